//! Bloom filter over piece ids, used by coordinator retain requests.
//!
//! Wire layout: first byte is the probe count `k` (1..=32), the remaining
//! bytes are the bit field. Probes are XXH3 hashes of the piece id bytes with
//! the probe index as the seed, reduced modulo the bit count.
//!
//! False positives keep garbage longer than necessary; false negatives would
//! delete live data, so membership of every inserted id is guaranteed.

use crate::PieceId;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Maximum accepted probe count. Higher values buy nothing below 2^-32 false
/// positive rates and a hostile header byte must not drive CPU per lookup.
pub const MAX_HASH_COUNT: u8 = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BloomFilterError {
    #[error("bloom filter is empty")]
    Empty,
    #[error("bloom filter has no bit field")]
    MissingBitField,
    #[error("bloom filter hash count {0} out of range 1..={MAX_HASH_COUNT}")]
    BadHashCount(u8),
}

#[derive(Debug, Clone)]
pub struct BloomFilter {
    hash_count: u8,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Size a filter for `expected_elements` at the given false positive rate.
    pub fn new(expected_elements: usize, false_positive_rate: f64) -> Self {
        let n = expected_elements.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m_bits = (-n * p.ln() / (ln2 * ln2)).ceil().max(8.0);
        let hash_count = ((m_bits / n) * ln2).round().clamp(1.0, MAX_HASH_COUNT as f64) as u8;
        let byte_len = (m_bits as usize).div_ceil(8);
        BloomFilter {
            hash_count,
            bits: vec![0u8; byte_len],
        }
    }

    /// Parse the wire form `[hash_count][bit field]`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BloomFilterError> {
        let (&hash_count, bits) = bytes.split_first().ok_or(BloomFilterError::Empty)?;
        if hash_count == 0 || hash_count > MAX_HASH_COUNT {
            return Err(BloomFilterError::BadHashCount(hash_count));
        }
        if bits.is_empty() {
            return Err(BloomFilterError::MissingBitField);
        }
        Ok(BloomFilter {
            hash_count,
            bits: bits.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.bits.len());
        out.push(self.hash_count);
        out.extend_from_slice(&self.bits);
        out
    }

    fn bit_index(&self, piece: &PieceId, probe: u8) -> (usize, u8) {
        let hash = xxh3_64_with_seed(piece.as_bytes(), probe as u64);
        let bit = (hash % (self.bits.len() as u64 * 8)) as usize;
        (bit / 8, 1u8 << (bit % 8))
    }

    pub fn insert(&mut self, piece: &PieceId) {
        for probe in 0..self.hash_count {
            let (byte, mask) = self.bit_index(piece, probe);
            self.bits[byte] |= mask;
        }
    }

    pub fn contains(&self, piece: &PieceId) -> bool {
        (0..self.hash_count).all(|probe| {
            let (byte, mask) = self.bit_index(piece, probe);
            self.bits[byte] & mask != 0
        })
    }
}
