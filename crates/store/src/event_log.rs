//! Append-only feedback event log keyed by `event_id`. Used both for
//! idempotence and as the audit trail of every event the engine has seen.

use adpilot_core::error::EngineResult;
use adpilot_core::types::{EventId, FeedbackEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Claimed by a worker that is applying it. Re-claimable once the
    /// claim lease lapses.
    Pending,
    /// Folded into the arm posterior.
    Applied,
    /// Recorded but not applied (arm already killed).
    AuditOnly,
    /// Upstream reported no data; intentionally not counted.
    Discarded,
    /// Application failed; a retry may claim it again.
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: FeedbackEvent,
    pub status: EventStatus,
    pub attempts: u32,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub note: Option<String>,
}

impl EventRecord {
    pub fn pending(event: FeedbackEvent, now: DateTime<Utc>) -> Self {
        Self {
            event,
            status: EventStatus::Pending,
            attempts: 1,
            first_seen_at: now,
            updated_at: now,
            note: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns the event and must finish it.
    Acquired { attempt: u32 },
    /// Already seen; the caller must not apply it.
    Duplicate(EventStatus),
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Atomically claim an event. An unseen event, one whose previous
    /// application failed, or one whose `Pending` claim outlived the lease
    /// is acquired; anything else is a duplicate.
    async fn claim(&self, event: &FeedbackEvent, now: DateTime<Utc>) -> EngineResult<Claim>;

    /// Record the final outcome of a claimed event.
    async fn finish(
        &self,
        event_id: &EventId,
        status: EventStatus,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> EngineResult<()>;

    async fn get(&self, event_id: &EventId) -> EngineResult<Option<EventRecord>>;
}
