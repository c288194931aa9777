use crate::types::{ArmId, ArmState, CampaignId, EventId, Mode};
use std::time::Duration;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No eligible arms for campaign {0}")]
    NoEligibleArms(CampaignId),

    #[error("Arm not found: {0}")]
    ArmNotFound(ArmId),

    #[error("Duplicate feedback event: {0}")]
    DuplicateEvent(EventId),

    #[error("Feedback event {0} is being applied by another worker")]
    EventInFlight(EventId),

    #[error("Pattern index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Invalid mode for campaign {campaign_id}: expected {expected}, got {got}")]
    InvalidMode {
        campaign_id: CampaignId,
        expected: Mode,
        got: Mode,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown campaign: {0}")]
    UnknownCampaign(CampaignId),

    #[error("Arm {arm_id} cannot move from {from} to {to}")]
    InvalidTransition {
        arm_id: ArmId,
        from: ArmState,
        to: ArmState,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Invalid embedding: {0}")]
    InvalidEmbedding(String),

    #[error("Write contention on arm {0}")]
    Contention(ArmId),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Errors worth retrying: the arm may still be in creation, another
    /// claim on the event has not finished, or the store is briefly
    /// unavailable or contended.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ArmNotFound(_)
                | Self::EventInFlight(_)
                | Self::Contention(_)
                | Self::Store(_)
                | Self::Timeout(_)
                | Self::IndexUnavailable(_)
        )
    }

    /// Errors that indicate a mistake by the caller and are surfaced
    /// immediately.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::NoEligibleArms(_)
                | Self::InvalidMode { .. }
                | Self::UnknownCampaign(_)
                | Self::InvalidTransition { .. }
                | Self::Validation(_)
                | Self::DimensionMismatch { .. }
                | Self::InvalidEmbedding(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let missing = EngineError::ArmNotFound(ArmId::new("c1:a"));
        assert!(missing.is_transient());
        assert!(!missing.is_caller_error());

        let mode = EngineError::InvalidMode {
            campaign_id: CampaignId::new("c1"),
            expected: Mode::DirectRoas,
            got: Mode::PipelineSynthetic,
        };
        assert!(mode.is_caller_error());
        assert!(!mode.is_transient());
        assert!(mode.to_string().contains("DIRECT_ROAS"));
    }
}
