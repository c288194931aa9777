#![warn(clippy::unwrap_used)]

//! Coordinates the allocator, reward bridge and pattern library behind the
//! engine's external operations.

pub mod audit;
pub mod orchestrator;
pub mod retry;
pub mod sweep;

pub use audit::{ChainVerification, DecisionAuditLog, DecisionRecord};
pub use orchestrator::{
    AllocationOrchestrator, EngineHealth, PromotionOutcome, ReplayReport, SelectRequest,
};
pub use retry::{ParkedEvent, ParkedEvents, ParkedMetrics, RetryPolicy};
pub use sweep::SweepReport;
