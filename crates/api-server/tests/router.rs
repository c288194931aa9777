//! HTTP-level tests of the REST router over in-memory stores.

use adpilot_api::{router, AppState};
use adpilot_core::clock::SystemClock;
use adpilot_core::config::AppConfig;
use adpilot_engine::AllocationOrchestrator;
use adpilot_patterns::{IndexConfig, PatternIndex};
use adpilot_store::{MemoryArmStore, MemoryEventLog};
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceExt;

fn app(ready: bool) -> Router {
    let mut config = AppConfig::default();
    config.engine.rng_seed = Some(7);
    let patterns = Arc::new(PatternIndex::new(IndexConfig::from(&config.patterns)));
    let engine = AllocationOrchestrator::new(
        &config,
        Arc::new(MemoryArmStore::new()),
        Arc::new(MemoryEventLog::new()),
        patterns,
        Arc::new(SystemClock),
    );
    router(AppState {
        engine: Arc::new(engine),
        node_id: "test-node".to_string(),
        start_time: Instant::now(),
        ready: Arc::new(AtomicBool::new(ready)),
    })
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn register(app: &Router, campaign: &str) {
    let (status, body) = send(
        app,
        json_request(
            "PUT",
            &format!("/v1/campaigns/{campaign}"),
            json!({ "mode": "DIRECT_ROAS", "industry": "retail" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["campaign_id"], campaign);
}

#[tokio::test]
async fn test_select_feedback_and_stats_flow() {
    let app = app(true);
    register(&app, "c1").await;

    let (status, decision) = send(
        &app,
        json_request(
            "POST",
            "/v1/select",
            json!({
                "campaign_id": "c1",
                "mode": "DIRECT_ROAS",
                "candidate_creatives": [{ "creative_id": "hero" }]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decision["arm_id"], "c1:hero");
    assert_eq!(decision["degraded"], false);

    let event = json!({
        "event_id": "evt-1",
        "arm_id": "c1:hero",
        "observed_at": Utc::now(),
        "spend_delta": 100.0,
        "revenue_delta": 400.0,
        "source": "url_param"
    });
    let (status, outcome) = send(&app, json_request("POST", "/v1/feedback", event.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["accepted"], true);

    let (status, replay) = send(&app, json_request("POST", "/v1/feedback", event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay["duplicate"], true);

    let (status, stats) = send(&app, get("/v1/arms/c1:hero/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_trials"], 1);
    assert_eq!(stats["alpha"], 2.0);

    let (status, decisions) = send(&app, get("/v1/campaigns/c1/decisions?limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decisions.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_unknown_campaign_is_not_found() {
    let app = app(true);
    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/v1/select",
            json!({
                "campaign_id": "missing",
                "mode": "DIRECT_ROAS",
                "candidate_creatives": [{ "creative_id": "a" }]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "unknown_campaign");
}

#[tokio::test]
async fn test_empty_candidates_unprocessable() {
    let app = app(true);
    register(&app, "c1").await;
    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/v1/select",
            json!({ "campaign_id": "c1", "mode": "DIRECT_ROAS", "candidate_creatives": [] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_unknown_arm_stats_not_found() {
    let app = app(true);
    let (status, _) = send(&app, get("/v1/arms/nope/stats")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_pattern_stats_on_empty_index() {
    let app = app(true);
    let (status, body) = send(&app, get("/v1/patterns/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
    assert_eq!(body["trained"], false);
}

#[tokio::test]
async fn test_operational_endpoints() {
    let not_ready = app(false);
    let (status, health) = send(&not_ready, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["node_id"], "test-node");

    let (status, _) = send(&not_ready, get("/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _) = send(&not_ready, get("/live")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app(true), get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
}
