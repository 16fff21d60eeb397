//! Pebble storage node entry point.
//!
//! Wires together the piece store, orders ledger, space monitor, delete
//! workers, and retain service, then serves the piece-store and
//! coordinator-control protocols over Iroh P2P. Prometheus metrics and a
//! health probe are exposed over HTTP.

use anyhow::Result;
use axum::extract::State;
use axum::routing::get;
use clap::Parser;
use iroh::protocol::Router;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use node::config::NodeConfig;
use node::deleter::Deleter;
use node::helpers::{load_keypair, signing_key};
use node::metrics::Metrics;
use node::monitor::{self, SpaceMonitor};
use node::orders::OrdersDb;
use node::p2p::{CoordinatorControlHandler, PieceStoreHandler};
use node::pieces::PieceStore;
use node::ping_stats::PingStats;
use node::retain::{RetainService, RetainStatus};
use node::state::AppState;
use node::trust::TrustSet;
use node::used_serials::UsedSerials;

#[derive(Parser, Debug)]
#[command(author, version, about = "Pebble storage node", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Storage path override
    #[arg(long, env = "STORAGE_PATH")]
    storage_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    run_node(cli).await
}

fn relay_mode(url: Option<&str>) -> iroh::endpoint::RelayMode {
    match url.and_then(|s| s.parse::<iroh_base::RelayUrl>().ok()) {
        Some(url) => iroh::endpoint::RelayMode::Custom(iroh::RelayMap::from_iter([
            iroh::RelayConfig { url, quic: None },
        ])),
        None => iroh::endpoint::RelayMode::Disabled,
    }
}

async fn run_node(cli: Cli) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting storage node");

    let mut config = match NodeConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Config load warning, using defaults");
            NodeConfig::default()
        }
    };
    if let Some(path) = cli.storage_path {
        config.storage.path = path;
    }

    let data_dir = std::path::PathBuf::from(&config.storage.data_dir);
    tokio::fs::create_dir_all(&data_dir).await?;

    // Identity: one Ed25519 key for transport and receipt signing
    let secret_key = load_keypair(&data_dir).await?;
    let node_id = secret_key.public();
    info!(node_id = %node_id, "Node identity loaded");

    let trust = TrustSet::from_strings(&config.trust.coordinators);
    if trust.is_empty() {
        warn!("Trust set is empty: every request will be rejected until coordinators are configured");
    } else {
        info!(coordinators = trust.len(), "Trust set loaded");
    }

    // Collaborator services
    let store = Arc::new(PieceStore::open(
        &config.storage.path,
        &data_dir.join("expirations.redb"),
    )?);
    let orders = Arc::new(OrdersDb::open(&data_dir.join("orders.redb"))?);
    let monitor = Arc::new(SpaceMonitor::new(
        config.storage.allocated_bytes(),
        &config.storage.path,
        &store,
    ));
    monitor::log_capacity(&monitor);

    let metrics = Metrics::new();
    let deleter = Deleter::new(
        store.clone(),
        monitor.clone(),
        metrics.clone(),
        config.piecestore.delete_workers,
        config.piecestore.delete_queue_size,
    );
    let retain = RetainService::new(if config.piecestore.retain_enabled {
        RetainStatus::Enabled
    } else {
        RetainStatus::Disabled
    });

    let state = Arc::new(AppState {
        config: config.piecestore.clone(),
        node_id,
        signer: signing_key(&secret_key),
        trust,
        store: store.clone(),
        orders,
        monitor: monitor.clone(),
        deleter,
        retain: retain.clone(),
        used_serials: UsedSerials::new(config.piecestore.max_used_serials_bytes),
        ping_stats: PingStats::new(),
        live_requests: AtomicI32::new(0),
        metrics: metrics.clone(),
    });

    // Background tasks
    tokio::spawn(retain.run(store.clone(), monitor.clone(), metrics.clone()));
    tokio::spawn(node::expiration::run_sweeper(state.clone()));
    tokio::spawn(monitor.clone().run_notifier(metrics.clone()));
    tokio::spawn(space_gauge_loop(state.clone()));

    // Iroh endpoint
    let bind_ipv4: std::net::Ipv4Addr = config
        .network
        .bind_ipv4
        .as_deref()
        .map(|ip| {
            ip.parse().unwrap_or_else(|e| {
                panic!("P2P_BIND_IPV4 '{ip}' is not a valid IPv4 address: {e}");
            })
        })
        .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);

    let transport_config = iroh::endpoint::QuicTransportConfig::builder()
        .keep_alive_interval(std::time::Duration::from_secs(15))
        .max_idle_timeout(Some(
            std::time::Duration::from_secs(120)
                .try_into()
                .expect("valid idle timeout"),
        ))
        // Uplinks multiplex many transfers over one connection
        .max_concurrent_bidi_streams(4096u32.into())
        .stream_receive_window((4u32 * 1024 * 1024).into())
        .receive_window((64u32 * 1024 * 1024).into())
        .build();

    let endpoint = iroh::Endpoint::builder()
        .secret_key(secret_key)
        .bind_addr(std::net::SocketAddrV4::new(
            bind_ipv4,
            config.network.p2p_port,
        ))
        .expect("valid bind addr")
        .transport_config(transport_config)
        .relay_mode(relay_mode(config.network.relay_url.as_deref()))
        .bind()
        .await?;
    info!(port = config.network.p2p_port, "Iroh endpoint bound");

    let router = Router::builder(endpoint.clone())
        .accept(
            common::PIECE_STORE_ALPN,
            PieceStoreHandler::new(state.clone()),
        )
        .accept(
            common::COORDINATOR_CONTROL_ALPN,
            CoordinatorControlHandler::new(state.clone()),
        )
        .spawn();

    // HTTP: metrics and health
    let app = axum::Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state.clone());
    let http_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.network.metrics_port));
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!(addr = %http_addr, "Metrics HTTP server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    info!("Storage node ready");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = router.shutdown().await;
    endpoint.close().await;
    Ok(())
}

/// Keep the available-space gauge current even when no uploads run.
async fn space_gauge_loop(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        ticker.tick().await;
        if let Ok(available) = state.monitor.available_space() {
            state
                .metrics
                .available_space
                .set(available.min(i64::MAX as u64) as i64);
        }
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics.encode()
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "live_requests": state.live_requests.load(Ordering::SeqCst),
        "last_pinged": state.ping_stats.last_pinged(),
        "used_space": state.monitor.used_space(),
    }))
}
