//! Asynchronous piece deletion with a bounded queue and worker pool.
//!
//! Coordinators batch-delete pieces faster than a disk can unlink them, so
//! the endpoint only enqueues here and reports back how many entries did not
//! fit. Deletion of a piece the store no longer has is fine (garbage
//! collection may have won the race) and counts as handled.

use crate::metrics::Metrics;
use crate::monitor::SpaceMonitor;
use crate::pieces::{PieceStore, StoreError};
use common::PieceId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct DeleteItem {
    coordinator: iroh::PublicKey,
    piece: PieceId,
}

pub struct Deleter {
    tx: mpsc::Sender<DeleteItem>,
}

impl Deleter {
    /// Spawn `workers` delete workers draining a queue of `queue_size`.
    pub fn new(
        store: Arc<PieceStore>,
        monitor: Arc<SpaceMonitor>,
        metrics: Metrics,
        workers: usize,
        queue_size: usize,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<DeleteItem>(queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let store = store.clone();
            let monitor = monitor.clone();
            let metrics = metrics.clone();
            tokio::spawn(async move {
                loop {
                    let item = { rx.lock().await.recv().await };
                    let Some(item) = item else {
                        debug!(worker, "Delete queue closed, worker exiting");
                        return;
                    };
                    match store.delete(&item.coordinator, &item.piece) {
                        Ok(freed) => {
                            monitor.sub_used(freed);
                            metrics.pieces_deleted.inc();
                            info!(piece = %item.piece, coordinator = %item.coordinator, "Deleted piece");
                        }
                        Err(StoreError::NotFound) => {
                            debug!(piece = %item.piece, coordinator = %item.coordinator, "Piece to delete not found");
                        }
                        Err(e) => {
                            warn!(piece = %item.piece, coordinator = %item.coordinator, error = %e, "Failed to delete piece");
                        }
                    }
                }
            });
        }
        Arc::new(Deleter { tx })
    }

    /// Queue pieces for deletion. Returns how many did not fit in the queue;
    /// the caller reports that back to the coordinator as back-pressure.
    pub fn enqueue(&self, coordinator: iroh::PublicKey, piece_ids: Vec<PieceId>) -> u64 {
        let mut unhandled = 0u64;
        for piece in piece_ids {
            let item = DeleteItem { coordinator, piece };
            if self.tx.try_send(item).is_err() {
                unhandled += 1;
            }
        }
        unhandled
    }
}
