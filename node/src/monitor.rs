//! Disk space accounting and low-disk notification.
//!
//! The monitor tracks how much of the operator-allocated space is used,
//! seeded by a directory scan at startup and updated by deltas on commit,
//! delete, trash, and restore. Available space is the smaller of the
//! unallocated remainder and what the filesystem actually has free.
//!
//! Uploads that observe free space below the configured threshold fire the
//! low-disk notifier on exit; a consumer task logs it and updates the gauge,
//! rate-limited by a cooldown so a burst of uploads produces one report.

use crate::constants::LOW_DISK_NOTIFY_COOLDOWN_SECS;
use crate::pieces::PieceStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Debug)]
pub struct SpaceMonitor {
    allocated: u64,
    used: AtomicU64,
    disk_root: PathBuf,
    low_disk: Notify,
}

impl SpaceMonitor {
    /// Build a monitor over `disk_root`, seeding the used counter from the
    /// piece store.
    pub fn new(allocated: u64, disk_root: impl Into<PathBuf>, store: &PieceStore) -> Self {
        let used = store.used_space().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to scan used space, assuming empty store");
            0
        });
        SpaceMonitor {
            allocated,
            used: AtomicU64::new(used),
            disk_root: disk_root.into(),
            low_disk: Notify::new(),
        }
    }

    pub fn used_space(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn add_used(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub_used(&self, bytes: u64) {
        // Saturating: a scan raced with deletes is not worth panicking over.
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Space still usable for new pieces: the unallocated remainder, bounded
    /// by what the filesystem has free.
    pub fn available_space(&self) -> anyhow::Result<u64> {
        let allocation_free = self.allocated.saturating_sub(self.used_space());
        let disk_free = fs2::free_space(&self.disk_root)?;
        Ok(allocation_free.min(disk_free))
    }

    /// Signal that free space fell below the report threshold.
    pub fn notify_low_disk(&self) {
        self.low_disk.notify_one();
    }

    /// Consume low-disk notifications: log, update the gauge, and swallow
    /// repeats for the cooldown window.
    pub async fn run_notifier(self: Arc<Self>, metrics: crate::metrics::Metrics) {
        loop {
            self.low_disk.notified().await;
            let available = self.available_space().unwrap_or(0);
            warn!(
                available_bytes = available,
                used_bytes = self.used_space(),
                "Available space low, coordinators should stop selecting this node"
            );
            metrics.low_disk_events.inc();
            metrics.available_space.set(available as i64);
            tokio::time::sleep(std::time::Duration::from_secs(LOW_DISK_NOTIFY_COOLDOWN_SECS))
                .await;
        }
    }
}

/// Log the startup capacity picture once.
pub fn log_capacity(monitor: &SpaceMonitor) {
    match monitor.available_space() {
        Ok(available) => info!(
            used_bytes = monitor.used_space(),
            available_bytes = available,
            "Space accounting initialized"
        ),
        Err(e) => warn!(error = %e, "Could not query free disk space"),
    }
}
