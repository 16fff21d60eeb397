//! Shared application state for the piece server.
//!
//! The endpoint owns only its live-request counter and the used-serials
//! cache; everything else here is a borrowed collaborator, shared through
//! `Arc` with the background tasks that also drive it.

use crate::config::PieceStoreConfig;
use crate::deleter::Deleter;
use crate::metrics::Metrics;
use crate::monitor::SpaceMonitor;
use crate::orders::{OrderRecord, OrdersDb};
use crate::pieces::PieceStore;
use crate::ping_stats::PingStats;
use crate::retain::RetainService;
use crate::trust::TrustSet;
use crate::used_serials::UsedSerials;
use common::{Order, OrderLimit};
use ed25519_dalek::SigningKey;
use std::sync::Arc;
use std::sync::atomic::AtomicI32;
use tracing::error;

pub struct AppState {
    pub config: PieceStoreConfig,
    pub node_id: iroh::PublicKey,
    /// Signs upload receipts; same identity as the transport key.
    pub signer: SigningKey,
    pub trust: TrustSet,
    pub store: Arc<PieceStore>,
    pub orders: Arc<OrdersDb>,
    pub monitor: Arc<SpaceMonitor>,
    pub deleter: Arc<Deleter>,
    pub retain: Arc<RetainService>,
    pub used_serials: UsedSerials,
    pub ping_stats: PingStats,
    pub live_requests: AtomicI32,
    pub metrics: Metrics,
}

impl AppState {
    /// Persist the largest verified order of a session and account its
    /// bandwidth. Failures are logged, never surfaced: the RPC outcome must
    /// not depend on ledger hiccups, and the next session will try again.
    ///
    /// A session that never produced an order with a positive amount leaves
    /// no record.
    pub fn save_order(&self, limit: &OrderLimit, order: Option<&Order>) {
        let Some(order) = order else { return };
        if order.amount == 0 {
            return;
        }
        let record = OrderRecord {
            limit: limit.clone(),
            order: order.clone(),
            received_at: common::now_secs(),
        };
        if let Err(e) = self.orders.enqueue(&record) {
            error!(
                piece = %limit.piece_id,
                coordinator = %limit.coordinator_id,
                error = %e,
                "Failed to save order"
            );
            return;
        }
        if let Err(e) = self
            .orders
            .add_usage(&limit.coordinator_id, limit.action, order.amount)
        {
            error!(
                coordinator = %limit.coordinator_id,
                error = %e,
                "Failed to add bandwidth usage"
            );
        }
    }
}
