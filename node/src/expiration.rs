//! Persistent piece expiration index backed by ReDB.
//!
//! Uploads whose order limit carries a piece expiration register it here at
//! commit time. A background sweeper deletes pieces whose expiration is
//! within the configured grace window, so coordinators can stop auditing
//! them the moment they nominally expire.
//!
//! Keys are `coordinator bytes ‖ piece bytes` (64 bytes); values are the
//! expiration as Unix seconds.

use common::PieceId;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

const EXPIRATIONS_TABLE: TableDefinition<&[u8], u64> = TableDefinition::new("piece_expirations");

fn index_key(coordinator: &iroh::PublicKey, piece: &PieceId) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(coordinator.as_bytes());
    key[32..].copy_from_slice(piece.as_bytes());
    key
}

fn split_key(key: &[u8]) -> Option<(iroh::PublicKey, PieceId)> {
    if key.len() != 64 {
        return None;
    }
    let coordinator_bytes: [u8; 32] = key[..32].try_into().ok()?;
    let piece_bytes: [u8; 32] = key[32..].try_into().ok()?;
    let coordinator = iroh::PublicKey::from_bytes(&coordinator_bytes).ok()?;
    Some((coordinator, PieceId(piece_bytes)))
}

pub struct ExpirationIndex {
    db: Arc<Database>,
}

impl ExpirationIndex {
    pub fn open(path: &Path) -> Result<Self, redb::Error> {
        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(EXPIRATIONS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn set(
        &self,
        coordinator: &iroh::PublicKey,
        piece: &PieceId,
        expires_at: u64,
    ) -> Result<(), redb::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(EXPIRATIONS_TABLE)?;
            table.insert(index_key(coordinator, piece).as_slice(), expires_at)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn remove(&self, coordinator: &iroh::PublicKey, piece: &PieceId) -> Result<(), redb::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(EXPIRATIONS_TABLE)?;
            table.remove(index_key(coordinator, piece).as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// All entries expiring at or before `cutoff`.
    pub fn expired_before(
        &self,
        cutoff: u64,
    ) -> Result<Vec<(iroh::PublicKey, PieceId)>, redb::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EXPIRATIONS_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            if value.value() > cutoff {
                continue;
            }
            match split_key(key.value()) {
                Some(pair) => out.push(pair),
                None => warn!(len = key.value().len(), "Dropping malformed expiration key"),
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> Result<usize, redb::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EXPIRATIONS_TABLE)?;
        let mut count = 0;
        for _ in table.iter()? {
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, redb::Error> {
        Ok(self.len()? == 0)
    }
}

/// Periodically delete pieces whose expiration falls within the grace window.
pub async fn run_sweeper(state: Arc<crate::state::AppState>) {
    let interval = std::time::Duration::from_secs(crate::constants::EXPIRATION_SWEEP_INTERVAL_SECS);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        // Pieces are treated as expired `expiration_grace_secs` ahead of
        // their nominal expiry, so the cutoff reaches into the future.
        let cutoff = common::now_secs().saturating_add(state.config.expiration_grace_secs);
        let expired = match state.store.expired_pieces(cutoff) {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Expiration sweep failed");
                continue;
            }
        };
        if expired.is_empty() {
            continue;
        }
        let mut deleted = 0u64;
        for (coordinator, piece) in expired {
            match state.store.delete(&coordinator, &piece) {
                Ok(freed) => {
                    state.monitor.sub_used(freed);
                    deleted += 1;
                }
                Err(crate::pieces::StoreError::NotFound) => {
                    // Already gone (deleted or trashed); drop the index entry.
                    let _ = state.store.clear_expiration(&coordinator, &piece);
                }
                Err(e) => {
                    warn!(piece = %piece, coordinator = %coordinator, error = %e, "Failed to delete expired piece");
                }
            }
        }
        debug!(count = deleted, "Deleted expired pieces");
    }
}
