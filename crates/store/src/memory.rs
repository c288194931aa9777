//! In-process backends. Per-key atomicity comes from the DashMap shard lock
//! held while an entry is inspected and replaced.

use crate::arm_store::ArmStore;
use crate::event_log::{Claim, EventLog, EventRecord, EventStatus};
use adpilot_core::error::{EngineError, EngineResult};
use adpilot_core::types::{Arm, ArmId, CampaignId, EventId, FeedbackEvent};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

const DEFAULT_CLAIM_LEASE_SECS: i64 = 30;

#[derive(Default)]
pub struct MemoryArmStore {
    arms: DashMap<ArmId, Arm>,
    by_campaign: DashMap<CampaignId, Vec<ArmId>>,
}

impl MemoryArmStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.arms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arms.is_empty()
    }
}

#[async_trait]
impl ArmStore for MemoryArmStore {
    async fn get(&self, arm_id: &ArmId) -> EngineResult<Option<Arm>> {
        Ok(self.arms.get(arm_id).map(|a| a.clone()))
    }

    async fn insert_if_absent(&self, arm: Arm) -> EngineResult<Arm> {
        match self.arms.entry(arm.arm_id.clone()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                self.by_campaign
                    .entry(arm.campaign_id.clone())
                    .or_default()
                    .push(arm.arm_id.clone());
                slot.insert(arm.clone());
                Ok(arm)
            }
        }
    }

    async fn compare_and_swap(&self, expected_version: u64, arm: &Arm) -> EngineResult<bool> {
        match self.arms.get_mut(&arm.arm_id) {
            Some(mut current) if current.version == expected_version => {
                *current = arm.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::ArmNotFound(arm.arm_id.clone())),
        }
    }

    async fn list_campaign(&self, campaign_id: &CampaignId) -> EngineResult<Vec<Arm>> {
        let ids = self
            .by_campaign
            .get(campaign_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.arms.get(id).map(|a| a.clone()))
            .collect())
    }
}

pub struct MemoryEventLog {
    events: DashMap<EventId, EventRecord>,
    claim_lease: Duration,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self {
            events: DashMap::new(),
            claim_lease: Duration::seconds(DEFAULT_CLAIM_LEASE_SECS),
        }
    }
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn claim(&self, event: &FeedbackEvent, now: DateTime<Utc>) -> EngineResult<Claim> {
        match self.events.entry(event.event_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(EventRecord::pending(event.clone(), now));
                Ok(Claim::Acquired { attempt: 1 })
            }
            Entry::Occupied(mut existing) => {
                let record = existing.get_mut();
                let abandoned = record.status == EventStatus::Pending
                    && now - record.updated_at >= self.claim_lease;
                if record.status == EventStatus::Failed || abandoned {
                    record.status = EventStatus::Pending;
                    record.attempts += 1;
                    record.updated_at = now;
                    Ok(Claim::Acquired {
                        attempt: record.attempts,
                    })
                } else {
                    Ok(Claim::Duplicate(record.status))
                }
            }
        }
    }

    async fn finish(
        &self,
        event_id: &EventId,
        status: EventStatus,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut record = self
            .events
            .get_mut(event_id)
            .ok_or_else(|| EngineError::Store(format!("event {event_id} was never claimed")))?;
        record.status = status;
        record.note = note;
        record.updated_at = now;
        Ok(())
    }

    async fn get(&self, event_id: &EventId) -> EngineResult<Option<EventRecord>> {
        Ok(self.events.get(event_id).map(|r| r.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm_store::{modify_arm, Mutation};
    use adpilot_core::types::{AttributionSource, Mode};
    use std::sync::Arc;

    fn arm(creative: &str) -> Arm {
        Arm::new(CampaignId::new("c1"), creative, Mode::DirectRoas, Utc::now())
    }

    fn event(id: &str) -> FeedbackEvent {
        FeedbackEvent {
            event_id: EventId::new(id),
            arm_id: ArmId::new("c1:a"),
            observed_at: Utc::now(),
            spend_delta: Some(10.0),
            revenue_delta: Some(20.0),
            pipeline_value_delta: None,
            clicks: None,
            conversions: None,
            source: AttributionSource::UrlParam,
            no_data: false,
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first() {
        let store = MemoryArmStore::new();
        let first = store.insert_if_absent(arm("a")).await.unwrap();
        let mut second = arm("a");
        second.alpha = 9.0;
        let stored = store.insert_if_absent(second).await.unwrap();

        assert_eq!(stored.alpha, first.alpha);
        assert_eq!(store.len(), 1);
        assert_eq!(store.list_campaign(&CampaignId::new("c1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_version() {
        let store = MemoryArmStore::new();
        let mut a = store.insert_if_absent(arm("a")).await.unwrap();
        a.version = 1;
        assert!(store.compare_and_swap(0, &a).await.unwrap());
        assert!(!store.compare_and_swap(0, &a).await.unwrap());

        let missing = arm("zzz");
        assert!(matches!(
            store.compare_and_swap(0, &missing).await,
            Err(EngineError::ArmNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_modify_is_serialized() {
        let store = Arc::new(MemoryArmStore::new());
        let id = store.insert_if_absent(arm("a")).await.unwrap().arm_id;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    modify_arm(store.as_ref(), &id, 1_000, |arm| {
                        arm.total_trials += 1;
                        Ok(Mutation::Write(()))
                    })
                    .await
                    .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let final_arm = store.get(&id).await.unwrap().unwrap();
        assert_eq!(final_arm.total_trials, 200);
        assert_eq!(final_arm.version, 200);
    }

    #[tokio::test]
    async fn test_modify_missing_arm() {
        let store = MemoryArmStore::new();
        let result = modify_arm(&store, &ArmId::new("nope"), 3, |_| Ok(Mutation::Write(()))).await;
        assert!(matches!(result, Err(EngineError::ArmNotFound(_))));
    }

    #[tokio::test]
    async fn test_event_claim_lifecycle() {
        let log = MemoryEventLog::new();
        let e = event("evt-1");
        let now = Utc::now();

        assert_eq!(log.claim(&e, now).await.unwrap(), Claim::Acquired { attempt: 1 });
        assert_eq!(
            log.claim(&e, now).await.unwrap(),
            Claim::Duplicate(EventStatus::Pending)
        );

        log.finish(&e.event_id, EventStatus::Failed, Some("arm missing".into()), now)
            .await
            .unwrap();
        assert_eq!(log.claim(&e, now).await.unwrap(), Claim::Acquired { attempt: 2 });

        log.finish(&e.event_id, EventStatus::Applied, None, now).await.unwrap();
        assert_eq!(
            log.claim(&e, now).await.unwrap(),
            Claim::Duplicate(EventStatus::Applied)
        );
        let record = log.get(&e.event_id).await.unwrap().unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.status, EventStatus::Applied);
    }

    #[tokio::test]
    async fn test_abandoned_claim_is_reacquired_after_lease() {
        let log = MemoryEventLog::new().with_claim_lease(Duration::seconds(10));
        let e = event("evt-1");
        let now = Utc::now();

        assert_eq!(log.claim(&e, now).await.unwrap(), Claim::Acquired { attempt: 1 });
        assert_eq!(
            log.claim(&e, now + Duration::seconds(9)).await.unwrap(),
            Claim::Duplicate(EventStatus::Pending)
        );
        assert_eq!(
            log.claim(&e, now + Duration::seconds(10)).await.unwrap(),
            Claim::Acquired { attempt: 2 }
        );
        // The new claim restarts the lease.
        assert_eq!(
            log.claim(&e, now + Duration::seconds(11)).await.unwrap(),
            Claim::Duplicate(EventStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_finish_unclaimed_event_errors() {
        let log = MemoryEventLog::new();
        let result = log
            .finish(&EventId::new("ghost"), EventStatus::Applied, None, Utc::now())
            .await;
        assert!(matches!(result, Err(EngineError::Store(_))));
    }
}
