//! RewardBridge: the only path by which feedback reaches an arm posterior.
//!
//! Each event is claimed in the event log before anything else happens, so a
//! replayed `event_id` is a no-op regardless of its payload. A failed
//! application marks the claim `Failed`, which lets a later retry through.
//! A claim still `Pending` is reported as in flight, never as a duplicate;
//! if it was abandoned, the log hands it out again once its lease lapses and
//! the arm's memory of recent events keeps it from being counted twice.
//! The bridge never retries on its own.

use crate::normalize::{normalize, Normalized};
use adpilot_bandit::BanditAllocator;
use adpilot_core::campaign::CampaignRegistry;
use adpilot_core::clock::Clock;
use adpilot_core::error::{EngineError, EngineResult};
use adpilot_core::types::{ArmState, FeedbackEvent};
use adpilot_store::{ArmStore, Claim, EventLog, EventStatus};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    /// This call took the event in. False for a replay.
    pub accepted: bool,
    /// The event had been seen before and was not applied again.
    pub duplicate: bool,
    pub status: EventStatus,
    pub arm_state: Option<ArmState>,
    /// Normalized reward folded into the arm, when one was.
    pub reward: Option<f64>,
}

pub struct RewardBridge {
    event_log: Arc<dyn EventLog>,
    store: Arc<dyn ArmStore>,
    allocator: Arc<BanditAllocator>,
    campaigns: Arc<CampaignRegistry>,
    clock: Arc<dyn Clock>,
}

impl RewardBridge {
    pub fn new(
        event_log: Arc<dyn EventLog>,
        store: Arc<dyn ArmStore>,
        allocator: Arc<BanditAllocator>,
        campaigns: Arc<CampaignRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            event_log,
            store,
            allocator,
            campaigns,
            clock,
        }
    }

    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.event_log
    }

    pub async fn ingest(&self, event: FeedbackEvent) -> EngineResult<IngestOutcome> {
        if event.event_id.as_str().is_empty() {
            return Err(EngineError::Validation("event_id must not be empty".into()));
        }
        if event.arm_id.as_str().is_empty() {
            return Err(EngineError::Validation("arm_id must not be empty".into()));
        }

        let now = self.clock.now();
        let attempt = match self.event_log.claim(&event, now).await? {
            Claim::Acquired { attempt } => attempt,
            Claim::Duplicate(EventStatus::Pending) => {
                metrics::counter!("feedback.in_flight").increment(1);
                debug!(event_id = %event.event_id, "feedback event still claimed elsewhere");
                return Err(EngineError::EventInFlight(event.event_id.clone()));
            }
            Claim::Duplicate(status) => {
                metrics::counter!("feedback.duplicates").increment(1);
                debug!(event_id = %event.event_id, status = ?status, "duplicate feedback ignored");
                let arm_state = self.store.get(&event.arm_id).await?.map(|a| a.state);
                return Ok(IngestOutcome {
                    accepted: false,
                    duplicate: true,
                    status,
                    arm_state,
                    reward: None,
                });
            }
        };

        match self.apply(&event).await {
            Ok((status, note, outcome)) => {
                self.event_log
                    .finish(&event.event_id, status, note, self.clock.now())
                    .await?;
                Ok(outcome)
            }
            Err(e) => {
                warn!(
                    event_id = %event.event_id,
                    arm_id = %event.arm_id,
                    attempt,
                    error = %e,
                    "feedback application failed"
                );
                metrics::counter!("feedback.failed").increment(1);
                if let Err(release) = self
                    .event_log
                    .finish(&event.event_id, EventStatus::Failed, Some(e.to_string()), self.clock.now())
                    .await
                {
                    metrics::counter!("feedback.release_failed").increment(1);
                    error!(
                        event_id = %event.event_id,
                        error = %release,
                        "could not release feedback claim, reclaimable after lease"
                    );
                }
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        event: &FeedbackEvent,
    ) -> EngineResult<(EventStatus, Option<String>, IngestOutcome)> {
        let arm = self
            .store
            .get(&event.arm_id)
            .await?
            .ok_or_else(|| EngineError::ArmNotFound(event.arm_id.clone()))?;

        let ceiling = self.campaigns.policy(&arm.campaign_id).roas_ceiling;
        let (reward, spend) = match normalize(arm.mode, event, ceiling) {
            Normalized::Discard => {
                metrics::counter!("feedback.discarded").increment(1);
                info!(
                    event_id = %event.event_id,
                    arm_id = %event.arm_id,
                    source = ?event.source,
                    "feedback discarded: upstream reported no data"
                );
                return Ok((
                    EventStatus::Discarded,
                    Some("upstream reported no data".to_string()),
                    IngestOutcome {
                        accepted: true,
                        duplicate: false,
                        status: EventStatus::Discarded,
                        arm_state: Some(arm.state),
                        reward: None,
                    },
                ));
            }
            Normalized::Reward {
                reward,
                spend,
                neutral,
            } => {
                if neutral {
                    metrics::counter!("feedback.neutral_rewards").increment(1);
                    debug!(event_id = %event.event_id, "normalization inputs missing, neutral reward used");
                }
                (reward, spend)
            }
        };

        let update = self
            .allocator
            .update_for_event(&event.event_id, &event.arm_id, reward, spend, event.observed_at)
            .await?;

        if update.already_applied {
            metrics::counter!("feedback.duplicates").increment(1);
            info!(
                event_id = %event.event_id,
                arm_id = %event.arm_id,
                "reclaimed feedback was already folded into the arm"
            );
            return Ok((
                EventStatus::Applied,
                Some("already applied by an earlier claim".to_string()),
                IngestOutcome {
                    accepted: false,
                    duplicate: true,
                    status: EventStatus::Applied,
                    arm_state: Some(update.arm.state),
                    reward: None,
                },
            ));
        }

        let (status, note) = if update.applied {
            metrics::counter!("feedback.applied").increment(1);
            (EventStatus::Applied, None)
        } else {
            (EventStatus::AuditOnly, Some(format!("arm is {}", update.arm.state)))
        };
        Ok((
            status,
            note,
            IngestOutcome {
                accepted: true,
                duplicate: false,
                status,
                arm_state: Some(update.arm.state),
                reward: update.applied.then_some(reward),
            },
        ))
    }
}
