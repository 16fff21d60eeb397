//! Durable orders ledger backed by ReDB.
//!
//! Two tables:
//! - `unsent_orders` holds one record per transfer session, keyed by
//!   `coordinator bytes ‖ serial bytes`. Records wait here until an
//!   out-of-process settlement agent sends them to the coordinator.
//! - `bandwidth_usage` sums claimed bytes per (coordinator, action) so the
//!   node can report its own bandwidth consumption.
//!
//! Persisting the largest verified order of a session here is the one thing
//! the endpoint must never skip: bandwidth that is not recorded is bandwidth
//! the node is never paid for.

use common::{Order, OrderLimit, PieceAction};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

const UNSENT_ORDERS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("unsent_orders");
const BANDWIDTH_USAGE_TABLE: TableDefinition<&[u8], u64> = TableDefinition::new("bandwidth_usage");

/// A session's settled-largest order together with its authorizing limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub limit: OrderLimit,
    pub order: Order,
    pub received_at: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum OrdersError {
    #[error("database error: {0}")]
    Database(String),
    #[error("malformed order record: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl From<redb::Error> for OrdersError {
    fn from(e: redb::Error) -> Self {
        OrdersError::Database(e.to_string())
    }
}

// redb surfaces several operation-specific error types; fold them all into
// the database bucket.
macro_rules! impl_from_redb {
    ($($err:ty),*) => {
        $(impl From<$err> for OrdersError {
            fn from(e: $err) -> Self {
                OrdersError::Database(e.to_string())
            }
        })*
    };
}
impl_from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

fn order_key(limit: &OrderLimit) -> [u8; 48] {
    let mut key = [0u8; 48];
    key[..32].copy_from_slice(limit.coordinator_id.as_bytes());
    key[32..].copy_from_slice(limit.serial.as_bytes());
    key
}

fn usage_key(coordinator: &iroh::PublicKey, action: PieceAction) -> [u8; 33] {
    let mut key = [0u8; 33];
    key[..32].copy_from_slice(coordinator.as_bytes());
    key[32] = action.as_u8();
    key
}

pub struct OrdersDb {
    db: Arc<Database>,
}

impl OrdersDb {
    pub fn open(path: &Path) -> Result<Self, OrdersError> {
        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(UNSENT_ORDERS_TABLE)?;
            let _ = write_txn.open_table(BANDWIDTH_USAGE_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Store the session's settled order. Keyed by (coordinator, serial), so
    /// re-saving the same session overwrites rather than duplicates.
    pub fn enqueue(&self, record: &OrderRecord) -> Result<(), OrdersError> {
        let bytes = serde_json::to_vec(record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(UNSENT_ORDERS_TABLE)?;
            table.insert(order_key(&record.limit).as_slice(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// All unsent orders for one coordinator.
    pub fn list_unsent(&self, coordinator: &iroh::PublicKey) -> Result<Vec<OrderRecord>, OrdersError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(UNSENT_ORDERS_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            if &key.value()[..32] != coordinator.as_bytes() {
                continue;
            }
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    /// Remove a settled order after the settlement agent has delivered it.
    pub fn delete(&self, limit: &OrderLimit) -> Result<(), OrdersError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(UNSENT_ORDERS_TABLE)?;
            table.remove(order_key(limit).as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn unsent_count(&self) -> Result<usize, OrdersError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(UNSENT_ORDERS_TABLE)?;
        let mut count = 0;
        for _ in table.iter()? {
            count += 1;
        }
        Ok(count)
    }

    /// Add claimed bytes to the per-(coordinator, action) usage sum.
    pub fn add_usage(
        &self,
        coordinator: &iroh::PublicKey,
        action: PieceAction,
        amount: u64,
    ) -> Result<(), OrdersError> {
        let key = usage_key(coordinator, action);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(BANDWIDTH_USAGE_TABLE)?;
            let current = table.get(key.as_slice())?.map(|v| v.value()).unwrap_or(0);
            table.insert(key.as_slice(), current.saturating_add(amount))?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Total claimed bytes for (coordinator, action).
    pub fn usage(
        &self,
        coordinator: &iroh::PublicKey,
        action: PieceAction,
    ) -> Result<u64, OrdersError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BANDWIDTH_USAGE_TABLE)?;
        Ok(table
            .get(usage_key(coordinator, action).as_slice())?
            .map(|v| v.value())
            .unwrap_or(0))
    }
}
