//! Property tests for the used-serials replay cache.
//!
//! - SE-1: an unexpired serial is never accepted twice
//! - SE-2: the cache never exceeds its configured entry budget
//! - SE-3: serials become reusable after their expiration

use crate::strategies::*;
use common::SerialNumber;
use node::constants::USED_SERIAL_ENTRY_SIZE;
use node::used_serials::UsedSerials;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// SE-1: within one large cache, a second insert of any serial fails
    /// while the first is unexpired.
    #[test]
    fn prop_no_unexpired_replay(
        serials in prop::collection::hash_set(any::<[u8; 16]>(), 1..50),
    ) {
        let cache = UsedSerials::new(1024 * 1024);
        let coordinator = public(&key(1));
        for serial in &serials {
            cache
                .insert(&coordinator, SerialNumber(*serial), 1000, 100)
                .unwrap();
        }
        for serial in &serials {
            prop_assert!(
                cache
                    .insert(&coordinator, SerialNumber(*serial), 1000, 100)
                    .is_err()
            );
        }
    }

    /// SE-2: however many serials arrive, the entry count stays within the
    /// memory budget.
    #[test]
    fn prop_cache_respects_budget(
        cap_entries in 1usize..32,
        serials in prop::collection::vec(any::<[u8; 16]>(), 1..200),
    ) {
        let cache = UsedSerials::new((cap_entries * USED_SERIAL_ENTRY_SIZE) as u64);
        let coordinator = public(&key(1));
        for serial in serials {
            let _ = cache.insert(&coordinator, SerialNumber(serial), 1000, 100);
            prop_assert!(cache.len() <= cap_entries);
        }
    }

    /// SE-3: expiry releases a serial for reuse.
    #[test]
    fn prop_expired_serials_reusable(
        serial in any::<[u8; 16]>(),
        expiry in 1u64..1_000_000,
    ) {
        let cache = UsedSerials::new(1024 * 1024);
        let coordinator = public(&key(1));
        cache
            .insert(&coordinator, SerialNumber(serial), expiry, 0)
            .unwrap();
        // Still blocked one tick before expiry
        prop_assert!(
            cache
                .insert(&coordinator, SerialNumber(serial), expiry, expiry - 1)
                .is_err()
        );
        // Usable again once expired
        prop_assert!(
            cache
                .insert(&coordinator, SerialNumber(serial), expiry + 100, expiry)
                .is_ok()
        );
    }
}
