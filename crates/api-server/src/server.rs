//! API server: REST routes plus the Prometheus exporter.

use crate::rest::{self, AppState};
use adpilot_core::config::AppConfig;
use adpilot_engine::AllocationOrchestrator;
use axum::routing::{get, post, put};
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Allocation contract
        .route("/v1/select", post(rest::handle_select))
        .route("/v1/feedback", post(rest::handle_feedback))
        .route("/v1/arms/:arm_id/stats", get(rest::handle_arm_stats))
        .route("/v1/arms/:arm_id/promote", post(rest::handle_promote))
        .route("/v1/campaigns/:campaign_id", put(rest::handle_put_campaign))
        .route("/v1/campaigns/:campaign_id/decisions", get(rest::handle_decisions))
        // Pattern library
        .route("/v1/patterns/search", post(rest::handle_pattern_search))
        .route("/v1/patterns/stats", get(rest::handle_pattern_stats))
        // Administration
        .route("/v1/feedback/parked", get(rest::handle_parked))
        .route("/v1/feedback/parked/replay", post(rest::handle_replay_parked))
        .route("/v1/sweep", post(rest::handle_sweep))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiServer {
    config: AppConfig,
    engine: Arc<AllocationOrchestrator>,
    ready: Arc<AtomicBool>,
}

impl ApiServer {
    pub fn new(config: AppConfig, engine: Arc<AllocationOrchestrator>) -> Self {
        Self {
            config,
            engine,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the HTTP REST server. Readiness flips once the listener is bound.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let state = AppState {
            engine: self.engine.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
            ready: self.ready.clone(),
        };
        let app = router(state);

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);
        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        self.ready.store(true, Ordering::SeqCst);
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Start the metrics exporter on a separate port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        if !self.config.metrics.enabled {
            info!("Metrics exporter disabled");
            return Ok(());
        }
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
