//! Arm store contract. Writes go through a single compare-and-swap primitive
//! keyed on `Arm::version`, which gives single-writer semantics per arm on
//! any backend that supports atomic per-key updates.

use adpilot_core::error::{EngineError, EngineResult};
use adpilot_core::types::{Arm, ArmId, CampaignId};
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait ArmStore: Send + Sync {
    async fn get(&self, arm_id: &ArmId) -> EngineResult<Option<Arm>>;

    /// Insert `arm` unless an arm with the same id exists. Returns whichever
    /// arm is stored afterwards.
    async fn insert_if_absent(&self, arm: Arm) -> EngineResult<Arm>;

    /// Replace the stored arm if its version still equals `expected_version`.
    async fn compare_and_swap(&self, expected_version: u64, arm: &Arm) -> EngineResult<bool>;

    async fn list_campaign(&self, campaign_id: &CampaignId) -> EngineResult<Vec<Arm>>;
}

/// Result of a mutation closure passed to [`modify_arm`].
pub enum Mutation<T> {
    /// The arm was changed and must be written back.
    Write(T),
    /// Nothing changed; skip the write.
    Unchanged(T),
}

/// Read-modify-write against the store of record. The closure may run more
/// than once when another writer wins the race, so it must derive its
/// changes from the arm it is handed.
pub async fn modify_arm<T, F>(
    store: &dyn ArmStore,
    arm_id: &ArmId,
    max_attempts: u32,
    mut mutate: F,
) -> EngineResult<(Arm, T)>
where
    F: FnMut(&mut Arm) -> EngineResult<Mutation<T>> + Send,
    T: Send,
{
    for attempt in 1..=max_attempts.max(1) {
        let mut arm = store
            .get(arm_id)
            .await?
            .ok_or_else(|| EngineError::ArmNotFound(arm_id.clone()))?;
        let expected = arm.version;

        match mutate(&mut arm)? {
            Mutation::Unchanged(out) => return Ok((arm, out)),
            Mutation::Write(out) => {
                arm.version = expected + 1;
                if store.compare_and_swap(expected, &arm).await? {
                    return Ok((arm, out));
                }
                metrics::counter!("store.cas_conflicts").increment(1);
                debug!(arm_id = %arm_id, attempt, "arm CAS conflict, retrying");
                tokio::task::yield_now().await;
            }
        }
    }
    Err(EngineError::Contention(arm_id.clone()))
}
