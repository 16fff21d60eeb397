//! Prometheus metrics for the storage node.
//!
//! This module defines all metrics exported at the `/metrics` endpoint.
//!
//! # Key Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `pebble_requests_total` | Counter | Piece operations by op/outcome |
//! | `pebble_transfer_bytes_total` | Counter | Piece bytes moved by op/outcome |
//! | `pebble_op_duration_seconds` | Histogram | Operation latency by op |
//! | `pebble_live_requests` | Gauge | In-flight piece operations |
//! | `pebble_available_space_bytes` | Gauge | Space usable for new pieces |
//! | `pebble_used_serials` | Gauge | Entries in the replay-prevention cache |
//!
//! Outcomes are `ok`, `failed`, or `canceled`; a canceled transfer is the
//! peer hanging up, not a node failure, and alerting should treat the two
//! differently.

use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Instant;

/// Operation outcome bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Failed,
    Canceled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Failed => "failed",
            Outcome::Canceled => "canceled",
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<RwLock<Registry>>,
    pub requests: Family<[(String, String); 2], Counter>, // op, outcome
    pub transfer_bytes: Family<[(String, String); 2], Counter>, // op, outcome
    pub op_duration: Family<[(String, String); 1], Histogram>, // op
    pub live_requests: Gauge,
    pub available_space: Gauge,
    pub used_serials: Gauge,
    pub pieces_deleted: Counter,
    pub delete_queue_dropped: Counter,
    pub retain_trashed: Counter,
    pub low_disk_events: Counter,
    pub orderlimit_failures: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests = Family::<[(String, String); 2], Counter>::default();
        registry.register(
            "pebble_requests",
            "Piece operations by op and outcome",
            requests.clone(),
        );

        let transfer_bytes = Family::<[(String, String); 2], Counter>::default();
        registry.register(
            "pebble_transfer_bytes",
            "Piece bytes transferred by op and outcome",
            transfer_bytes.clone(),
        );

        let op_duration = Family::<[(String, String); 1], Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.01, 2.0, 14))
        });
        registry.register(
            "pebble_op_duration_seconds",
            "Piece operation duration",
            op_duration.clone(),
        );

        let live_requests = Gauge::default();
        registry.register(
            "pebble_live_requests",
            "In-flight piece operations",
            live_requests.clone(),
        );

        let available_space = Gauge::default();
        registry.register(
            "pebble_available_space_bytes",
            "Space usable for new pieces",
            available_space.clone(),
        );

        let used_serials = Gauge::default();
        registry.register(
            "pebble_used_serials",
            "Entries in the used-serials cache",
            used_serials.clone(),
        );

        let pieces_deleted = Counter::default();
        registry.register(
            "pebble_pieces_deleted",
            "Pieces deleted by the delete workers",
            pieces_deleted.clone(),
        );

        let delete_queue_dropped = Counter::default();
        registry.register(
            "pebble_delete_queue_dropped",
            "Delete requests dropped because the queue was full",
            delete_queue_dropped.clone(),
        );

        let retain_trashed = Counter::default();
        registry.register(
            "pebble_retain_trashed",
            "Pieces trashed by retain garbage collection",
            retain_trashed.clone(),
        );

        let low_disk_events = Counter::default();
        registry.register(
            "pebble_low_disk_events",
            "Low-disk notifications fired",
            low_disk_events.clone(),
        );

        let orderlimit_failures = Counter::default();
        registry.register(
            "pebble_orderlimit_verification_failures",
            "Order limits rejected during verification",
            orderlimit_failures.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            requests,
            transfer_bytes,
            op_duration,
            live_requests,
            available_space,
            used_serials,
            pieces_deleted,
            delete_queue_dropped,
            retain_trashed,
            low_disk_events,
            orderlimit_failures,
        }
    }

    /// Record one finished piece operation.
    pub fn record_op(&self, op: &str, outcome: Outcome, bytes: u64, started: Instant) {
        let labels = [
            ("op".to_string(), op.to_string()),
            ("outcome".to_string(), outcome.as_str().to_string()),
        ];
        self.requests.get_or_create(&labels).inc();
        self.transfer_bytes.get_or_create(&labels).inc_by(bytes);
        self.op_duration
            .get_or_create(&[("op".to_string(), op.to_string())])
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        let registry = self.registry.read();
        if let Err(e) = encode(&mut buffer, &registry) {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            return format!("# Error encoding metrics: {}", e);
        }
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
