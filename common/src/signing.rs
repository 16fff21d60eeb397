//! Canonical signing bytes and Ed25519 helpers for authorization envelopes.
//!
//! Each signable type encodes to a domain-separated SCALE tuple. The domain
//! separator prevents a signature over one message kind from validating as
//! another; SCALE gives a deterministic byte layout independent of the JSON
//! wire encoding. Signature fields are always excluded from the signed bytes.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parity_scale_codec::Encode;

use crate::{Order, OrderLimit, PieceHash};

/// Domain separator for order limit signatures (coordinator-signed).
const ORDER_LIMIT_DOMAIN: &[u8] = b"PEBBLE_ORDER_LIMIT_V1";

/// Domain separator for in-session order signatures (uplink-signed).
const ORDER_DOMAIN: &[u8] = b"PEBBLE_ORDER_V1";

/// Domain separator for piece hash signatures (uplink- or node-signed).
const PIECE_HASH_DOMAIN: &[u8] = b"PEBBLE_PIECE_HASH_V1";

/// Derive an Ed25519 verifying key from an Iroh peer identity.
///
/// Returns `None` for byte patterns that do not decode to a curve point;
/// callers treat that as an authentication failure.
pub fn verifying_key(id: &iroh::PublicKey) -> Option<VerifyingKey> {
    VerifyingKey::from_bytes(id.as_bytes()).ok()
}

fn verify(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    key.verify_strict(message, &signature).is_ok()
}

impl OrderLimit {
    /// Canonical bytes the coordinator signs.
    pub fn signing_bytes(&self) -> Vec<u8> {
        (
            ORDER_LIMIT_DOMAIN,
            self.coordinator_id.as_bytes(),
            self.uplink_key.as_bytes(),
            self.node_id.as_bytes(),
            self.piece_id.0,
            self.action.as_u8(),
            self.byte_limit,
            self.serial.0,
            self.issued_at,
            self.order_expiration,
            self.piece_expiration,
        )
            .encode()
    }

    /// Return the limit with `signature` filled in by the coordinator key.
    pub fn signed(mut self, key: &SigningKey) -> Self {
        self.signature = key.sign(&self.signing_bytes()).to_bytes().to_vec();
        self
    }

    pub fn verify_signature(&self, key: &VerifyingKey) -> bool {
        verify(key, &self.signing_bytes(), &self.signature)
    }
}

impl Order {
    /// Canonical bytes the uplink signs.
    pub fn signing_bytes(&self) -> Vec<u8> {
        (ORDER_DOMAIN, self.serial.0, self.amount).encode()
    }

    pub fn signed(mut self, key: &SigningKey) -> Self {
        self.signature = key.sign(&self.signing_bytes()).to_bytes().to_vec();
        self
    }

    pub fn verify_signature(&self, key: &VerifyingKey) -> bool {
        verify(key, &self.signing_bytes(), &self.signature)
    }
}

impl PieceHash {
    /// Canonical bytes signed by the uplink (done message) or the storage
    /// node (upload receipt).
    pub fn signing_bytes(&self) -> Vec<u8> {
        (
            PIECE_HASH_DOMAIN,
            self.piece_id.0,
            self.hash,
            self.piece_size,
            self.timestamp,
        )
            .encode()
    }

    pub fn signed(mut self, key: &SigningKey) -> Self {
        self.signature = key.sign(&self.signing_bytes()).to_bytes().to_vec();
        self
    }

    pub fn verify_signature(&self, key: &VerifyingKey) -> bool {
        verify(key, &self.signing_bytes(), &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PieceAction, PieceId, SerialNumber};

    fn test_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn public(key: &SigningKey) -> iroh::PublicKey {
        iroh::PublicKey::from_bytes(&key.verifying_key().to_bytes()).unwrap()
    }

    fn test_limit(coordinator: &SigningKey, uplink: &SigningKey, node: &SigningKey) -> OrderLimit {
        OrderLimit {
            coordinator_id: public(coordinator),
            uplink_key: public(uplink),
            node_id: public(node),
            piece_id: PieceId([3u8; 32]),
            action: PieceAction::Put,
            byte_limit: 1024,
            serial: SerialNumber([5u8; 16]),
            issued_at: 1_700_000_000,
            order_expiration: 1_700_003_600,
            piece_expiration: 0,
            signature: Vec::new(),
        }
    }

    #[test]
    fn order_limit_sign_and_verify() {
        let coordinator = test_key(1);
        let limit = test_limit(&coordinator, &test_key(2), &test_key(3)).signed(&coordinator);
        assert!(limit.verify_signature(&coordinator.verifying_key()));
    }

    #[test]
    fn order_limit_tamper_fails() {
        let coordinator = test_key(1);
        let mut limit = test_limit(&coordinator, &test_key(2), &test_key(3)).signed(&coordinator);
        limit.byte_limit += 1;
        assert!(!limit.verify_signature(&coordinator.verifying_key()));
    }

    #[test]
    fn order_limit_wrong_signer_fails() {
        let coordinator = test_key(1);
        let impostor = test_key(9);
        let limit = test_limit(&coordinator, &test_key(2), &test_key(3)).signed(&impostor);
        assert!(!limit.verify_signature(&coordinator.verifying_key()));
    }

    #[test]
    fn order_sign_and_verify() {
        let uplink = test_key(2);
        let order = Order {
            serial: SerialNumber([5u8; 16]),
            amount: 512,
            signature: Vec::new(),
        }
        .signed(&uplink);
        assert!(order.verify_signature(&uplink.verifying_key()));

        let mut tampered = order.clone();
        tampered.amount = 513;
        assert!(!tampered.verify_signature(&uplink.verifying_key()));
    }

    #[test]
    fn piece_hash_sign_and_verify() {
        let uplink = test_key(2);
        let hash = PieceHash {
            piece_id: PieceId([3u8; 32]),
            hash: [8u8; 32],
            piece_size: 2048,
            timestamp: 1_700_000_100,
            signature: Vec::new(),
        }
        .signed(&uplink);
        assert!(hash.verify_signature(&uplink.verifying_key()));
    }

    #[test]
    fn domains_are_disjoint() {
        // An order signature must not validate as a piece hash even when the
        // underlying field bytes coincide.
        let key = test_key(4);
        let order = Order {
            serial: SerialNumber([0u8; 16]),
            amount: 0,
            signature: Vec::new(),
        }
        .signed(&key);
        let hash = PieceHash {
            piece_id: PieceId([0u8; 32]),
            hash: [0u8; 32],
            piece_size: 0,
            timestamp: 0,
            signature: order.signature.clone(),
        };
        assert!(!hash.verify_signature(&key.verifying_key()));
    }

    #[test]
    fn truncated_signature_rejected() {
        let key = test_key(2);
        let mut order = Order {
            serial: SerialNumber([1u8; 16]),
            amount: 7,
            signature: Vec::new(),
        }
        .signed(&key);
        order.signature.truncate(10);
        assert!(!order.verify_signature(&key.verifying_key()));
    }

    #[test]
    fn verifying_key_from_iroh_identity() {
        let key = test_key(6);
        let id = public(&key);
        let vk = verifying_key(&id).expect("valid identity");
        let order = Order {
            serial: SerialNumber([2u8; 16]),
            amount: 99,
            signature: Vec::new(),
        }
        .signed(&key);
        assert!(order.verify_signature(&vk));
    }
}
