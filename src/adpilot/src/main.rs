//! adpilot: adaptive creative allocation and pattern-learning engine.
//!
//! Main entry point that wires the stores, pattern index and orchestrator
//! together and starts the API server.

use adpilot_api::ApiServer;
use adpilot_core::clock::SystemClock;
use adpilot_core::config::{AppConfig, StoreBackend};
use adpilot_engine::AllocationOrchestrator;
use adpilot_patterns::{load_snapshot, save_snapshot, IndexConfig, PatternIndex};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Memory,
    Redis,
}

#[derive(Parser, Debug)]
#[command(name = "adpilot")]
#[command(about = "Adaptive budget allocation across creative arms")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "ADPILOT__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "ADPILOT__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Arm store backend (overrides config)
    #[arg(long, value_enum)]
    store: Option<Backend>,

    /// Fixed RNG seed for reproducible selection
    #[arg(long)]
    seed: Option<u64>,

    /// Skip the background promotion sweep
    #[arg(long, default_value_t = false)]
    no_sweep: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adpilot=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("adpilot starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(backend) = cli.store {
        config.store.backend = match backend {
            Backend::Memory => StoreBackend::Memory,
            Backend::Redis => StoreBackend::Redis,
        };
    }
    if cli.seed.is_some() {
        config.engine.rng_seed = cli.seed;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        backend = ?config.store.backend,
        dimension = config.patterns.dimension,
        "Configuration loaded"
    );

    let (store, event_log) = adpilot_store::open_stores(&config.store).await?;

    let patterns = Arc::new(PatternIndex::new(IndexConfig::from(&config.patterns)));
    let snapshot_path = config.patterns.snapshot_path.as_ref().map(PathBuf::from);
    if let Some(path) = snapshot_path.as_deref().filter(|p| p.exists()) {
        match load_snapshot(&patterns, path) {
            Ok(count) => info!(path = %path.display(), count, "Pattern snapshot loaded"),
            // Load is all-or-nothing, so the index stays empty here.
            Err(e) => error!(path = %path.display(), error = %e, "Failed to load pattern snapshot"),
        }
    }

    let engine = Arc::new(AllocationOrchestrator::new(
        &config,
        store,
        event_log,
        patterns,
        Arc::new(SystemClock),
    ));

    let api_server = ApiServer::new(config.clone(), engine.clone());

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    // Promotion sweep and pattern snapshotting
    if !cli.no_sweep {
        let sweep_engine = engine.clone();
        let every = Duration::from_secs(config.engine.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let report = sweep_engine.run_sweep().await;
                info!(
                    arms = report.arms_evaluated,
                    promoted = report.promoted,
                    patterns = report.patterns_ingested,
                    errors = report.errors,
                    "Sweep finished"
                );
                if let Some(path) = snapshot_path.as_deref() {
                    if let Err(e) = save_snapshot(sweep_engine.patterns(), path, chrono::Utc::now()) {
                        error!(path = %path.display(), error = %e, "Failed to save pattern snapshot");
                    }
                }
            }
        });
    } else {
        info!("Background sweep disabled");
    }

    // Snapshot cache maintenance
    let cache_engine = engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let evicted = cache_engine.snapshots().evict_expired();
            if evicted > 0 {
                tracing::debug!(evicted, "Expired arm snapshots evicted");
            }
        }
    });

    info!("adpilot is ready to serve traffic");

    // Start HTTP server (blocks until shutdown)
    api_server.start_http().await?;

    Ok(())
}
