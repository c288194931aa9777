//! REST handlers for allocation, feedback and the operational endpoints.

use crate::error::ApiError;
use adpilot_core::campaign::CampaignConfig;
use adpilot_core::config::CampaignPolicy;
use adpilot_core::error::EngineError;
use adpilot_core::types::{AllocationDecision, ArmId, ArmStats, CampaignId, FeedbackEvent, Mode};
use adpilot_engine::{
    AllocationOrchestrator, DecisionRecord, EngineHealth, ParkedEvent, ParkedMetrics,
    PromotionOutcome, ReplayReport, SelectRequest, SweepReport,
};
use adpilot_patterns::{IndexStats, ScoredPattern, SearchFilter};
use adpilot_rewards::IngestOutcome;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Maximum candidates per select request.
const MAX_CANDIDATES: usize = 500;

/// Upper bound on `k` for pattern search.
const MAX_SEARCH_K: usize = 100;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1_000;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AllocationOrchestrator>,
    pub node_id: String,
    pub start_time: Instant,
    pub ready: Arc<AtomicBool>,
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// POST /v1/select: choose an arm for a campaign.
pub async fn handle_select(
    State(state): State<AppState>,
    Json(request): Json<SelectRequest>,
) -> ApiResult<AllocationDecision> {
    if request.candidate_creatives.len() > MAX_CANDIDATES {
        return Err(EngineError::Validation(format!(
            "at most {MAX_CANDIDATES} candidate creatives per request"
        ))
        .into());
    }
    let decision = state.engine.select(request).await?;
    metrics::counter!("api.selections").increment(1);
    Ok(Json(decision))
}

/// POST /v1/feedback: report an attributed outcome for an arm.
pub async fn handle_feedback(
    State(state): State<AppState>,
    Json(event): Json<FeedbackEvent>,
) -> ApiResult<IngestOutcome> {
    let outcome = state.engine.feedback(event).await?;
    Ok(Json(outcome))
}

/// GET /v1/arms/:arm_id/stats: current posterior and lifecycle state.
pub async fn handle_arm_stats(
    State(state): State<AppState>,
    Path(arm_id): Path<String>,
) -> ApiResult<ArmStats> {
    Ok(Json(state.engine.arm_stats(&ArmId::new(arm_id)).await?))
}

#[derive(Debug, Deserialize)]
pub struct PromoteParams {
    #[serde(default)]
    pub force: bool,
}

/// POST /v1/arms/:arm_id/promote: promote an exploiting arm to SCALED.
/// `?force=true` skips the consistency check.
pub async fn handle_promote(
    State(state): State<AppState>,
    Path(arm_id): Path<String>,
    Query(params): Query<PromoteParams>,
) -> ApiResult<PromotionOutcome> {
    Ok(Json(state.engine.promote(&ArmId::new(arm_id), params.force).await?))
}

#[derive(Debug, Deserialize)]
pub struct CampaignBody {
    pub mode: Mode,
    #[serde(default)]
    pub industry: Option<String>,
    /// Omitted fields fall back to the server's default policy.
    #[serde(default)]
    pub policy: Option<CampaignPolicy>,
}

/// PUT /v1/campaigns/:campaign_id: register or update a campaign.
pub async fn handle_put_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
    Json(body): Json<CampaignBody>,
) -> ApiResult<CampaignConfig> {
    let config = CampaignConfig {
        campaign_id: CampaignId::new(campaign_id),
        mode: body.mode,
        industry: body.industry,
        policy: body.policy.unwrap_or_else(|| state.engine.default_policy()),
    };
    state.engine.register_campaign(config.clone())?;
    Ok(Json(config))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

impl ListParams {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)
    }
}

/// GET /v1/campaigns/:campaign_id/decisions: audited decisions, newest first.
pub async fn handle_decisions(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<DecisionRecord>> {
    Ok(Json(
        state
            .engine
            .decisions(&CampaignId::new(campaign_id), params.limit())?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub embedding: Vec<f32>,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub filter: SearchFilter,
}

fn default_k() -> usize {
    10
}

/// POST /v1/patterns/search: nearest proven patterns for an embedding.
pub async fn handle_pattern_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<Vec<ScoredPattern>> {
    let k = request.k.min(MAX_SEARCH_K);
    Ok(Json(
        state
            .engine
            .search_similar(&request.embedding, k, &request.filter)?,
    ))
}

/// GET /v1/patterns/stats
pub async fn handle_pattern_stats(State(state): State<AppState>) -> Json<IndexStats> {
    Json(state.engine.pattern_stats())
}

#[derive(Serialize)]
pub struct ParkedResponse {
    pub metrics: ParkedMetrics,
    pub events: Vec<ParkedEvent>,
}

/// GET /v1/feedback/parked: events that exhausted their retries.
pub async fn handle_parked(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<ParkedResponse> {
    Json(ParkedResponse {
        metrics: state.engine.parked_metrics(),
        events: state.engine.parked(params.limit()),
    })
}

/// POST /v1/feedback/parked/replay
pub async fn handle_replay_parked(State(state): State<AppState>) -> Json<ReplayReport> {
    Json(state.engine.replay_parked().await)
}

/// POST /v1/sweep: run the promotion and pattern ingestion sweep now.
pub async fn handle_sweep(State(state): State<AppState>) -> Json<SweepReport> {
    Json(state.engine.run_sweep().await)
}

/// GET /health: Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let engine = state.engine.health();
    let status = if engine.pattern_index_available {
        "healthy"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status: status.to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        engine,
    })
}

/// GET /ready: Readiness probe for Kubernetes.
/// Returns 200 only once startup (snapshot load, store connection) is done.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.ready.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /live: Liveness probe for Kubernetes.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub engine: EngineHealth,
}
