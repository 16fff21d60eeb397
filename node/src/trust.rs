//! Trust set of coordinator identities.
//!
//! The storage node only acts on directives from coordinators in this set:
//! order limits must be signed by a trusted coordinator, and control
//! operations (batch delete, retain, restore-trash) require the transport
//! peer itself to be trusted. Unlike development-mode allowlists, an empty
//! trust set denies everything.

use ed25519_dalek::VerifyingKey;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct TrustSet {
    coordinators: HashMap<iroh::PublicKey, VerifyingKey>,
}

impl TrustSet {
    pub fn new(coordinators: Vec<iroh::PublicKey>) -> Self {
        let coordinators = coordinators
            .into_iter()
            .filter_map(|id| match common::signing::verifying_key(&id) {
                Some(vk) => Some((id, vk)),
                None => {
                    warn!(coordinator = %id, "Coordinator identity is not a valid Ed25519 key, skipping");
                    None
                }
            })
            .collect();
        TrustSet { coordinators }
    }

    /// Parse hex-encoded coordinator node ids from config.
    ///
    /// Invalid ids are logged and skipped.
    pub fn from_strings(ids: &[String]) -> Self {
        let parsed = ids
            .iter()
            .filter_map(|s| match s.parse::<iroh::PublicKey>() {
                Ok(pk) => Some(pk),
                Err(e) => {
                    warn!(coordinator = %s, error = %e, "Invalid coordinator ID in config, skipping");
                    None
                }
            })
            .collect();
        Self::new(parsed)
    }

    pub fn is_trusted(&self, id: &iroh::PublicKey) -> bool {
        self.coordinators.contains_key(id)
    }

    /// Signature verification key for a trusted coordinator.
    pub fn verifying_key(&self, id: &iroh::PublicKey) -> Option<&VerifyingKey> {
        self.coordinators.get(id)
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }
}
