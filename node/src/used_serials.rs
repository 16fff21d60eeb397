//! Bounded replay-prevention cache of used order serial numbers.
//!
//! Every accepted order limit inserts its (coordinator, serial) pair here
//! with the limit's order expiration; a second session presenting the same
//! pair before that expiration is a replay. The cache is bounded by a memory
//! budget; at the cap a uniformly random entry is evicted so bursty
//! adversarial serials cannot force out any particular victim. Expired
//! entries are replaced lazily when the same pair is seen again.

use crate::constants::USED_SERIAL_ENTRY_SIZE;
use common::SerialNumber;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;

type SerialKey = ([u8; 32], SerialNumber);

/// Insertion failed because the serial is already present and unexpired.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("serial number already used")]
pub struct SerialAlreadyExists;

#[derive(Debug)]
pub struct UsedSerials {
    entries: DashMap<SerialKey, u64>,
    max_entries: usize,
}

impl UsedSerials {
    /// Build a cache bounded by `max_bytes` of accounted memory.
    pub fn new(max_bytes: u64) -> Self {
        let max_entries = (max_bytes as usize / USED_SERIAL_ENTRY_SIZE).max(1);
        UsedSerials {
            entries: DashMap::new(),
            max_entries,
        }
    }

    /// Record a serial, failing if it was already used and has not expired.
    pub fn insert(
        &self,
        coordinator: &iroh::PublicKey,
        serial: SerialNumber,
        expires_at: u64,
        now: u64,
    ) -> Result<(), SerialAlreadyExists> {
        let key = (*coordinator.as_bytes(), serial);

        // Evict before taking the entry lock: iterating shards while holding
        // an entry guard on one of them would deadlock.
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.max_entries {
                if !self.evict_random() {
                    break;
                }
            }
        }

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    return Err(SerialAlreadyExists);
                }
                // Expired entry, purged lazily by replacement
                occupied.insert(expires_at);
                Ok(())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(expires_at);
                Ok(())
            }
        }
    }

    fn evict_random(&self) -> bool {
        let len = self.entries.len();
        if len == 0 {
            return false;
        }
        let victim = {
            let idx = rand::rng().random_range(0..len);
            self.entries.iter().nth(idx).map(|entry| *entry.key())
        };
        match victim {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Accounted memory use in bytes.
    pub fn size_bytes(&self) -> u64 {
        (self.entries.len() * USED_SERIAL_ENTRY_SIZE) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn coordinator(seed: u8) -> iroh::PublicKey {
        let key = SigningKey::from_bytes(&[seed; 32]);
        iroh::PublicKey::from_bytes(&key.verifying_key().to_bytes()).unwrap()
    }

    fn serial(n: u8) -> SerialNumber {
        SerialNumber([n; 16])
    }

    #[test]
    fn replay_rejected_until_expiry() {
        let serials = UsedSerials::new(1024 * 1024);
        let c = coordinator(1);
        serials.insert(&c, serial(1), 1000, 100).unwrap();
        assert_eq!(
            serials.insert(&c, serial(1), 1000, 500),
            Err(SerialAlreadyExists)
        );
        // After expiry the same serial becomes usable again
        serials.insert(&c, serial(1), 2000, 1500).unwrap();
    }

    #[test]
    fn same_serial_different_coordinator_allowed() {
        let serials = UsedSerials::new(1024 * 1024);
        serials.insert(&coordinator(1), serial(1), 1000, 100).unwrap();
        serials.insert(&coordinator(2), serial(1), 1000, 100).unwrap();
        assert_eq!(serials.len(), 2);
    }

    #[test]
    fn cap_enforced_by_random_eviction() {
        // Budget for exactly 4 entries
        let serials = UsedSerials::new((USED_SERIAL_ENTRY_SIZE * 4) as u64);
        let c = coordinator(1);
        for n in 0..32u8 {
            serials.insert(&c, serial(n), 1000, 100).unwrap();
            assert!(serials.len() <= 4, "cache exceeded cap: {}", serials.len());
        }
        assert_eq!(serials.len(), 4);
        assert_eq!(serials.size_bytes(), (USED_SERIAL_ENTRY_SIZE * 4) as u64);
    }

    #[test]
    fn eviction_never_blocks_insertion() {
        let serials = UsedSerials::new(1);
        let c = coordinator(1);
        // max_entries clamps to 1; every insert evicts the previous entry
        for n in 0..8u8 {
            serials.insert(&c, serial(n), 1000, 100).unwrap();
        }
        assert_eq!(serials.len(), 1);
    }

    #[test]
    fn reinsert_of_present_serial_does_not_evict_others() {
        let serials = UsedSerials::new((USED_SERIAL_ENTRY_SIZE * 2) as u64);
        let c = coordinator(1);
        serials.insert(&c, serial(1), 1000, 100).unwrap();
        serials.insert(&c, serial(2), 1000, 100).unwrap();
        // Replay of a present serial must not trigger eviction
        assert_eq!(
            serials.insert(&c, serial(1), 1000, 100),
            Err(SerialAlreadyExists)
        );
        assert_eq!(serials.len(), 2);
    }
}
