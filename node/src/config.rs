//! Storage node configuration.
//!
//! Loads settings from `node.toml` with environment variable overrides.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this priority order (highest wins):
//! 1. Environment variables (e.g., `TRUSTED_COORDINATORS`, `ALLOCATED_GB`)
//! 2. TOML file (`node.toml` by default)
//! 3. Built-in defaults
//!
//! # Sections
//!
//! | Section | Purpose |
//! |---------|---------|
//! | `network` | P2P port, bind address, relay URL, metrics port |
//! | `storage` | Piece store path, data directory, allocated space |
//! | `trust` | Coordinator identities this node accepts directives from |
//! | `piecestore` | Endpoint limits: concurrency, timeouts, grace periods |
//!
//! # Example
//!
//! ```toml
//! [network]
//! p2p_port = 11330
//!
//! [storage]
//! path = "data/node/pieces"
//! allocated_gb = 1000
//!
//! [trust]
//! coordinators = ["1a2b3c..."]
//!
//! [piecestore]
//! max_concurrent_requests = 512
//! retain_enabled = true
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Read an env var, parse it, and apply it to `target`. Logs a warning on parse failure.
fn env_parse<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(val) = std::env::var(var) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env = var,
                value = %val,
                expected_type = std::any::type_name::<T>(),
                "Invalid env var value, using default"
            ),
        }
    }
}

/// Read an env var as a string and set an `Option<String>` field.
fn env_string_opt(var: &str, target: &mut Option<String>) {
    if let Ok(val) = std::env::var(var) {
        *target = Some(val);
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub piecestore: PieceStoreConfig,
}

/// Network configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// P2P bind port (UDP)
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,

    /// Specific IPv4 address to bind the P2P endpoint to.
    /// When unset, binds all interfaces.
    pub bind_ipv4: Option<String>,

    /// Iroh relay URL for P2P connectivity. Unset disables relays
    /// (direct-only deployments and tests).
    pub relay_url: Option<String>,

    /// HTTP port for /metrics and /healthz
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            p2p_port: default_p2p_port(),
            bind_ipv4: None,
            relay_url: None,
            metrics_port: default_metrics_port(),
        }
    }
}

fn default_p2p_port() -> u16 {
    11330
}
fn default_metrics_port() -> u16 {
    9600
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory for the piece store
    #[serde(default = "default_storage_path")]
    pub path: String,

    /// Data directory for keypair and databases
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Total allocated disk space in GB (0 = bounded by the disk alone)
    #[serde(default)]
    pub allocated_gb: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            data_dir: default_data_dir(),
            allocated_gb: 0,
        }
    }
}

fn default_storage_path() -> String {
    "data/node/pieces".to_string()
}
fn default_data_dir() -> String {
    "data/node".to_string()
}

impl StorageConfig {
    /// Allocated space in bytes; `u64::MAX` when unlimited.
    pub fn allocated_bytes(&self) -> u64 {
        if self.allocated_gb == 0 {
            u64::MAX
        } else {
            self.allocated_gb * 1024 * 1024 * 1024
        }
    }
}

/// Trusted coordinator identities
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TrustConfig {
    /// Hex-encoded Ed25519 node IDs of trusted coordinators.
    /// An empty list makes the node refuse every request.
    #[serde(default)]
    pub coordinators: Vec<String>,
}

/// Piece server endpoint limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PieceStoreConfig {
    /// Concurrent requests allowed before uploads are rejected (0 = unlimited)
    #[serde(default)]
    pub max_concurrent_requests: u32,

    /// How long after issuance order limits are still accepted
    #[serde(default = "default_order_limit_grace_secs")]
    pub order_limit_grace_secs: u64,

    /// Deadline for a single stream send or receive
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,

    /// Free-space level below which the low-disk notifier fires after uploads
    #[serde(default = "default_report_capacity_threshold_bytes")]
    pub report_capacity_threshold_bytes: u64,

    /// Memory allowed for the used-serials cache; beyond it serials are
    /// dropped at random
    #[serde(default = "default_max_used_serials_bytes")]
    pub max_used_serials_bytes: u64,

    /// Whether coordinator retain (garbage collection) requests are processed
    #[serde(default = "default_retain_enabled")]
    pub retain_enabled: bool,

    /// Slack subtracted from retain cutoffs to absorb coordinator clock skew
    #[serde(default = "default_retain_time_buffer_secs")]
    pub retain_time_buffer_secs: u64,

    /// Piece delete worker count
    #[serde(default = "default_delete_workers")]
    pub delete_workers: usize,

    /// Piece delete queue capacity
    #[serde(default = "default_delete_queue_size")]
    pub delete_queue_size: usize,

    /// How soon before their expiration date pieces are treated as expired
    #[serde(default = "default_expiration_grace_secs")]
    pub expiration_grace_secs: u64,
}

impl Default for PieceStoreConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 0,
            order_limit_grace_secs: default_order_limit_grace_secs(),
            stream_timeout_secs: default_stream_timeout_secs(),
            report_capacity_threshold_bytes: default_report_capacity_threshold_bytes(),
            max_used_serials_bytes: default_max_used_serials_bytes(),
            retain_enabled: default_retain_enabled(),
            retain_time_buffer_secs: default_retain_time_buffer_secs(),
            delete_workers: default_delete_workers(),
            delete_queue_size: default_delete_queue_size(),
            expiration_grace_secs: default_expiration_grace_secs(),
        }
    }
}

fn default_order_limit_grace_secs() -> u64 {
    3600
}
fn default_stream_timeout_secs() -> u64 {
    30 * 60
}
fn default_report_capacity_threshold_bytes() -> u64 {
    500 * 1024 * 1024
}
fn default_max_used_serials_bytes() -> u64 {
    1024 * 1024
}
fn default_retain_enabled() -> bool {
    true
}
fn default_retain_time_buffer_secs() -> u64 {
    48 * 3600
}
fn default_delete_workers() -> usize {
    1
}
fn default_delete_queue_size() -> usize {
    10_000
}
fn default_expiration_grace_secs() -> u64 {
    48 * 3600
}

impl PieceStoreConfig {
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}

impl NodeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = path.unwrap_or("node.toml");

        let mut config = if Path::new(config_path).exists() {
            let content = std::fs::read_to_string(config_path)?;
            toml::from_str(&content)?
        } else {
            warn!(config_path = %config_path, "No config file found, using defaults/env vars");
            NodeConfig::default()
        };

        // Environment variable overrides (network)
        env_parse("P2P_PORT", &mut config.network.p2p_port);
        env_parse("METRICS_PORT", &mut config.network.metrics_port);
        env_string_opt("P2P_BIND_IPV4", &mut config.network.bind_ipv4);
        env_string_opt("IROH_RELAY_URL", &mut config.network.relay_url);

        // Storage overrides
        if let Ok(val) = std::env::var("STORAGE_PATH") {
            config.storage.path = val;
        }
        if let Ok(val) = std::env::var("DATA_DIR") {
            config.storage.data_dir = val;
        }
        env_parse("ALLOCATED_GB", &mut config.storage.allocated_gb);

        // Trust overrides: comma-separated coordinator ids replace the list
        if let Ok(val) = std::env::var("TRUSTED_COORDINATORS") {
            config.trust.coordinators = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        // Piecestore overrides
        env_parse(
            "MAX_CONCURRENT_REQUESTS",
            &mut config.piecestore.max_concurrent_requests,
        );
        env_parse(
            "ORDER_LIMIT_GRACE_SECS",
            &mut config.piecestore.order_limit_grace_secs,
        );
        env_parse(
            "STREAM_TIMEOUT_SECS",
            &mut config.piecestore.stream_timeout_secs,
        );
        env_parse("DELETE_WORKERS", &mut config.piecestore.delete_workers);
        env_parse(
            "DELETE_QUEUE_SIZE",
            &mut config.piecestore.delete_queue_size,
        );
        if let Ok(val) = std::env::var("RETAIN_ENABLED") {
            config.piecestore.retain_enabled = val != "0" && val.to_lowercase() != "false";
        }

        Ok(config)
    }
}
