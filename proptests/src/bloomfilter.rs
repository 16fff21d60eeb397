//! Property tests for the retain bloom filter.
//!
//! - BF-1: no false negatives, ever (a false negative deletes live data)
//! - BF-2: the wire encoding round-trips membership exactly

use crate::strategies::*;
use common::bloom::BloomFilter;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// BF-1: every inserted piece id is contained.
    #[test]
    fn prop_no_false_negatives(
        ids in prop::collection::vec(piece_id(), 1..200),
        fpr in 0.001f64..0.3,
    ) {
        let mut filter = BloomFilter::new(ids.len(), fpr);
        for id in &ids {
            filter.insert(id);
        }
        for id in &ids {
            prop_assert!(filter.contains(id), "false negative for {}", id);
        }
    }

    /// BF-2: serialization preserves membership bit for bit.
    #[test]
    fn prop_wire_round_trip_preserves_membership(
        inserted in prop::collection::vec(piece_id(), 1..50),
        probes in prop::collection::vec(piece_id(), 1..50),
    ) {
        let mut filter = BloomFilter::new(inserted.len(), 0.01);
        for id in &inserted {
            filter.insert(id);
        }
        let restored = BloomFilter::from_bytes(&filter.to_bytes()).unwrap();
        for id in inserted.iter().chain(probes.iter()) {
            prop_assert_eq!(filter.contains(id), restored.contains(id));
        }
    }
}
