//! Mapping from engine errors to HTTP responses.

use adpilot_core::error::EngineError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            EngineError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_failed"),
            EngineError::DimensionMismatch { .. } => (StatusCode::BAD_REQUEST, "dimension_mismatch"),
            EngineError::InvalidEmbedding(_) => (StatusCode::BAD_REQUEST, "invalid_embedding"),
            EngineError::InvalidMode { .. } => (StatusCode::BAD_REQUEST, "invalid_mode"),
            EngineError::NoEligibleArms(_) => (StatusCode::UNPROCESSABLE_ENTITY, "no_eligible_arms"),
            EngineError::UnknownCampaign(_) => (StatusCode::NOT_FOUND, "unknown_campaign"),
            EngineError::ArmNotFound(_) => (StatusCode::NOT_FOUND, "arm_not_found"),
            EngineError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            EngineError::DuplicateEvent(_) => (StatusCode::CONFLICT, "duplicate_event"),
            EngineError::Contention(_) => (StatusCode::CONFLICT, "contention"),
            EngineError::EventInFlight(_) => (StatusCode::CONFLICT, "event_in_flight"),
            EngineError::IndexUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "index_unavailable"),
            EngineError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            EngineError::Timeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "timeout"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        metrics::counter!("api.errors", "code" => code).increment(1);

        // Internal details stay in the logs.
        let message = if status.is_server_error() {
            error!(error = %self.0, code, "Request failed");
            match status {
                StatusCode::INTERNAL_SERVER_ERROR => "Internal processing error".to_string(),
                _ => self.0.to_string(),
            }
        } else {
            warn!(error = %self.0, code, "Request rejected");
            self.0.to_string()
        };

        (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message,
            }),
        )
            .into_response()
    }
}
