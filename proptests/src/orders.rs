//! Property tests for order verification invariants.
//!
//! - OR-1: a session's order amounts are accepted iff non-decreasing
//! - OR-2: no accepted order ever exceeds the limit's byte budget
//! - OR-3: tampering with any signed field invalidates the order

use crate::strategies::*;
use common::PieceAction;
use node::verification::verify_order;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// OR-1: replaying a session's orders in sequence, each order is
    /// accepted exactly when its amount does not decrease.
    #[test]
    fn prop_orders_accepted_iff_monotonic(
        serial in serial_number(),
        piece in piece_id(),
        amounts in prop::collection::vec(0u64..100_000, 1..20),
    ) {
        let limit = signed_limit(piece, serial, PieceAction::Get, 100_000);
        let mut largest = 0u64;
        for amount in amounts {
            let order = signed_order(serial, amount);
            let accepted = verify_order(&limit, &order, largest).is_ok();
            prop_assert_eq!(accepted, amount >= largest);
            if accepted {
                largest = amount;
            }
        }
    }

    /// OR-2: amounts above the byte limit are rejected no matter the
    /// session state.
    #[test]
    fn prop_order_bounded_by_limit(
        serial in serial_number(),
        piece in piece_id(),
        byte_limit in 1u64..1_000_000,
        over in 1u64..1_000_000,
    ) {
        let limit = signed_limit(piece, serial, PieceAction::Get, byte_limit);
        let order = signed_order(serial, byte_limit.saturating_add(over));
        prop_assert!(verify_order(&limit, &order, 0).is_err());

        let at_limit = signed_order(serial, byte_limit);
        prop_assert!(verify_order(&limit, &at_limit, 0).is_ok());
    }

    /// OR-3: flipping any bit of the signature invalidates the order.
    #[test]
    fn prop_signature_tamper_detected(
        serial in serial_number(),
        piece in piece_id(),
        amount in 0u64..100_000,
        byte_index in 0usize..64,
        bit in 0u8..8,
    ) {
        let limit = signed_limit(piece, serial, PieceAction::Get, 100_000);
        let mut order = signed_order(serial, amount);
        prop_assert!(verify_order(&limit, &order, 0).is_ok());
        order.signature[byte_index] ^= 1 << bit;
        prop_assert!(verify_order(&limit, &order, 0).is_err());
    }

    /// OR-3 (amount): a signed order does not validate for a different
    /// amount.
    #[test]
    fn prop_amount_tamper_detected(
        serial in serial_number(),
        piece in piece_id(),
        amount in 0u64..100_000,
        delta in 1u64..100,
    ) {
        let limit = signed_limit(piece, serial, PieceAction::Get, u64::MAX);
        let mut order = signed_order(serial, amount);
        order.amount = amount + delta;
        prop_assert!(verify_order(&limit, &order, 0).is_err());
    }

    /// Orders are bound to their session serial.
    #[test]
    fn prop_foreign_serial_rejected(
        serial in serial_number(),
        other in serial_number(),
        piece in piece_id(),
        amount in 0u64..100_000,
    ) {
        prop_assume!(serial != other);
        let limit = signed_limit(piece, serial, PieceAction::Get, u64::MAX);
        let order = signed_order(other, amount);
        prop_assert!(verify_order(&limit, &order, 0).is_err());
    }
}
