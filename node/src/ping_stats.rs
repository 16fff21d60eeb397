//! Last-contact tracking.
//!
//! Every inbound request stamps the node as recently pinged; the dashboard
//! and uptime reporting read it back. The endpoint never inspects the value.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PingStats {
    last_pinged: AtomicU64,
}

impl PingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn was_pinged(&self, now_secs: u64) {
        self.last_pinged.fetch_max(now_secs, Ordering::Relaxed);
    }

    /// Unix seconds of the most recent inbound request, 0 if never pinged.
    pub fn last_pinged(&self) -> u64 {
        self.last_pinged.load(Ordering::Relaxed)
    }
}
