//! Shared strategies and helpers for property tests.

use common::{Order, OrderLimit, PieceAction, PieceId, SerialNumber};
use ed25519_dalek::SigningKey;
use proptest::prelude::*;

pub fn key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

pub fn public(key: &SigningKey) -> iroh::PublicKey {
    iroh::PublicKey::from_bytes(&key.verifying_key().to_bytes()).unwrap()
}

/// Strategy for arbitrary piece ids, excluding the reserved zero id.
pub fn piece_id() -> impl Strategy<Value = PieceId> {
    any::<[u8; 32]>()
        .prop_filter("zero piece id is reserved", |bytes| bytes != &[0u8; 32])
        .prop_map(PieceId)
}

/// Strategy for arbitrary serial numbers, excluding zero.
pub fn serial_number() -> impl Strategy<Value = SerialNumber> {
    any::<[u8; 16]>()
        .prop_filter("zero serial is reserved", |bytes| bytes != &[0u8; 16])
        .prop_map(SerialNumber)
}

/// A coordinator-signed limit with the standard test identities
/// (coordinator seed 1, uplink seed 2, node seed 3).
pub fn signed_limit(
    piece: PieceId,
    serial: SerialNumber,
    action: PieceAction,
    byte_limit: u64,
) -> OrderLimit {
    let coordinator = key(1);
    OrderLimit {
        coordinator_id: public(&coordinator),
        uplink_key: public(&key(2)),
        node_id: public(&key(3)),
        piece_id: piece,
        action,
        byte_limit,
        serial,
        issued_at: 1_700_000_000,
        order_expiration: 1_700_003_600,
        piece_expiration: 0,
        signature: Vec::new(),
    }
    .signed(&coordinator)
}

/// An uplink-signed order for the standard test uplink (seed 2).
pub fn signed_order(serial: SerialNumber, amount: u64) -> Order {
    Order {
        serial,
        amount,
        signature: Vec::new(),
    }
    .signed(&key(2))
}
