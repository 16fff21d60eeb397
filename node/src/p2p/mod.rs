//! P2P protocol handlers for the storage node.
//!
//! Two ALPN protocols make up the piece server:
//!
//! - `pebble/piece-store`: uplink streaming operations (upload, download,
//!   single-piece delete), authorized per-session by coordinator-signed
//!   order limits
//! - `pebble/coordinator-control`: coordinator unary operations (batch
//!   delete, retain, restore-trash), authorized by the transport peer
//!   identity against the trust set

mod coordinator_handler;
mod piece_handler;

pub use coordinator_handler::CoordinatorControlHandler;
pub use piece_handler::PieceStoreHandler;

use crate::error::RpcError;
use crate::state::AppState;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Wrap a single stream operation in the configured deadline.
///
/// There is deliberately no overall per-RPC deadline; a slow but live uplink
/// may take as long as it keeps individual sends and receives moving.
pub(crate) async fn with_timeout<T>(
    timeout: std::time::Duration,
    fut: impl Future<Output = T>,
) -> Result<T, RpcError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| RpcError::internal("stream operation timed out"))
}

/// Live-request accounting for one stream: increments on entry, decrements
/// when dropped, and keeps the gauge in sync.
pub(crate) struct LiveRequestGuard {
    state: Arc<AppState>,
    /// Counter value right after this request entered.
    pub entered_at: i32,
}

impl LiveRequestGuard {
    pub fn enter(state: Arc<AppState>) -> Self {
        state.ping_stats.was_pinged(common::now_secs());
        let entered_at = state.live_requests.fetch_add(1, Ordering::SeqCst) + 1;
        state.metrics.live_requests.set(entered_at as i64);
        LiveRequestGuard { state, entered_at }
    }
}

impl Drop for LiveRequestGuard {
    fn drop(&mut self) {
        let now = self.state.live_requests.fetch_sub(1, Ordering::SeqCst) - 1;
        self.state.metrics.live_requests.set(now as i64);
    }
}
