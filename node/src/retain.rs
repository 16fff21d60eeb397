//! Coordinator-driven garbage collection (retain).
//!
//! A retain request says: among my pieces created before this cutoff, keep
//! only those in the bloom filter. Requests are queued, never processed
//! inline, and at most one request per coordinator is pending at a time.
//! Collected pieces go to the trash rather than being unlinked, so a
//! coordinator mistake is recoverable with restore-trash.

use crate::constants::MAX_RETAIN_QUEUE;
use crate::metrics::Metrics;
use crate::monitor::SpaceMonitor;
use crate::pieces::PieceStore;
use common::bloom::BloomFilter;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Whether the node processes retain requests at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainStatus {
    Disabled,
    Enabled,
}

#[derive(Debug, Clone)]
pub struct RetainRequest {
    pub coordinator: iroh::PublicKey,
    /// Only pieces created strictly before this time are candidates.
    /// The endpoint has already subtracted the clock-skew buffer.
    pub created_before: u64,
    pub filter: BloomFilter,
}

pub struct RetainService {
    status: RetainStatus,
    queue: Mutex<VecDeque<RetainRequest>>,
    notify: Notify,
}

impl RetainService {
    pub fn new(status: RetainStatus) -> Arc<Self> {
        Arc::new(RetainService {
            status,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    pub fn status(&self) -> RetainStatus {
        self.status
    }

    /// Queue a request. Returns false when the queue is full or a request
    /// for the same coordinator is already pending; the caller logs and
    /// still reports success to the coordinator, which will retry later.
    pub fn queue(&self, request: RetainRequest) -> bool {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= MAX_RETAIN_QUEUE {
                return false;
            }
            if queue
                .iter()
                .any(|pending| pending.coordinator == request.coordinator)
            {
                return false;
            }
            queue.push_back(request);
        }
        self.notify.notify_one();
        true
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    fn pop(&self) -> Option<RetainRequest> {
        self.queue.lock().pop_front()
    }

    /// Worker loop draining the queue one request at a time.
    pub async fn run(
        self: Arc<Self>,
        store: Arc<PieceStore>,
        monitor: Arc<SpaceMonitor>,
        metrics: Metrics,
    ) {
        loop {
            let Some(request) = self.pop() else {
                self.notify.notified().await;
                continue;
            };
            let coordinator = request.coordinator;
            info!(coordinator = %coordinator, created_before = request.created_before, "Retain started");
            match process(&request, &store, &monitor, &metrics) {
                Ok((kept, trashed)) => {
                    info!(coordinator = %coordinator, kept, trashed, "Retain finished");
                }
                Err(e) => {
                    warn!(coordinator = %coordinator, error = %e, "Retain failed");
                }
            }
        }
    }
}

fn process(
    request: &RetainRequest,
    store: &PieceStore,
    monitor: &SpaceMonitor,
    metrics: &Metrics,
) -> anyhow::Result<(u64, u64)> {
    let pieces = store.walk_pieces(&request.coordinator)?;
    let mut kept = 0u64;
    let mut trashed = 0u64;
    for piece in pieces {
        if piece.created >= request.created_before || request.filter.contains(&piece.piece_id) {
            kept += 1;
            continue;
        }
        match store.trash(&request.coordinator, &piece.piece_id) {
            Ok(bytes) => {
                monitor.sub_used(bytes);
                metrics.retain_trashed.inc();
                trashed += 1;
                debug!(piece = %piece.piece_id, "Trashed piece absent from retain filter");
            }
            Err(crate::pieces::StoreError::NotFound) => {
                // Deleted underneath us; nothing kept, nothing to trash.
            }
            Err(e) => {
                warn!(piece = %piece.piece_id, error = %e, "Failed to trash piece");
            }
        }
    }
    Ok((kept, trashed))
}
