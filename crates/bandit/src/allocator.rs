//! Thompson-sampling allocator for dynamic creative budget allocation.
//!
//! `select` draws `s ~ Beta(alpha, beta)` for every eligible arm, multiplies
//! it by the arm's fatigue decay and picks the highest adjusted sample; ties
//! go to the lowest `arm_id`. `update` folds a normalized reward into the
//! arm through the store's compare-and-swap loop and then advances the
//! lifecycle state machine.

use crate::fatigue::FatigueEstimator;
use crate::lifecycle;
use adpilot_core::campaign::CampaignRegistry;
use adpilot_core::clock::Clock;
use adpilot_core::error::{EngineError, EngineResult};
use adpilot_core::types::{
    AllocationDecision, Arm, ArmId, ArmState, CampaignId, EventId, StateTransition,
};
use adpilot_store::{modify_arm, ArmStore, Mutation};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Beta, Distribution};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_CAS_ATTEMPTS: u32 = 16;

#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub arm: Arm,
    /// False when the arm was already terminal and nothing was folded in.
    pub applied: bool,
    /// The event had already been folded into this arm by an earlier claim.
    pub already_applied: bool,
    pub transitions: Vec<StateTransition>,
}

pub struct BanditAllocator {
    store: Arc<dyn ArmStore>,
    campaigns: Arc<CampaignRegistry>,
    fatigue: FatigueEstimator,
    clock: Arc<dyn Clock>,
    rng: Mutex<StdRng>,
    cas_max_attempts: u32,
}

impl BanditAllocator {
    /// Create an allocator. A fixed `seed` makes selection reproducible.
    pub fn new(
        store: Arc<dyn ArmStore>,
        campaigns: Arc<CampaignRegistry>,
        clock: Arc<dyn Clock>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            store,
            campaigns,
            fatigue: FatigueEstimator::new(),
            clock,
            rng: Mutex::new(rng),
            cas_max_attempts: DEFAULT_CAS_ATTEMPTS,
        }
    }

    pub fn with_cas_attempts(mut self, attempts: u32) -> Self {
        self.cas_max_attempts = attempts.max(1);
        self
    }

    pub fn fatigue(&self) -> &FatigueEstimator {
        &self.fatigue
    }

    /// Candidates that may receive budget, sorted by `arm_id` and deduplicated.
    fn eligible<'a>(campaign_id: &CampaignId, candidates: &'a [Arm]) -> Vec<&'a Arm> {
        let mut eligible: Vec<&Arm> = candidates
            .iter()
            .filter(|a| a.campaign_id == *campaign_id && a.state.is_selectable())
            .collect();
        eligible.sort_by(|a, b| a.arm_id.cmp(&b.arm_id));
        eligible.dedup_by(|a, b| a.arm_id == b.arm_id);
        eligible
    }

    /// Pick one arm by Thompson sampling over fatigue-adjusted draws.
    pub fn select(&self, campaign_id: &CampaignId, candidates: &[Arm]) -> EngineResult<AllocationDecision> {
        let eligible = Self::eligible(campaign_id, candidates);
        if eligible.is_empty() {
            return Err(EngineError::NoEligibleArms(campaign_id.clone()));
        }

        let now = self.clock.now();
        let policy = self.campaigns.policy(campaign_id);
        let today = now.date_naive();

        let mut best: Option<(&Arm, f64, f64)> = None;
        {
            let mut rng = self.rng.lock();
            for &arm in &eligible {
                let decay = self.fatigue.decay(arm, &policy, today);
                let sample = match Beta::new(arm.alpha, arm.beta) {
                    Ok(dist) => dist.sample(&mut *rng),
                    Err(_) => arm.posterior_mean(),
                };
                let adjusted = sample * decay;
                // Strictly greater: equal samples keep the lower arm_id.
                if best.map_or(true, |(_, s, _)| adjusted > s) {
                    best = Some((arm, adjusted, decay));
                }
            }
        }

        let (winner, sample, decay) = best.ok_or_else(|| EngineError::NoEligibleArms(campaign_id.clone()))?;
        metrics::counter!("bandit.selections").increment(1);
        debug!(
            campaign_id = %campaign_id,
            arm_id = %winner.arm_id,
            sample,
            decay,
            candidates = eligible.len(),
            "thompson selection"
        );

        Ok(AllocationDecision {
            decision_id: Uuid::new_v4(),
            campaign_id: campaign_id.clone(),
            arm_id: winner.arm_id.clone(),
            confidence: winner.posterior_mean() * decay,
            mode: winner.mode,
            state: winner.state,
            decided_at: now,
            degraded: false,
        })
    }

    /// Deterministic fallback: highest posterior mean, no random draw.
    pub fn select_fallback(
        &self,
        campaign_id: &CampaignId,
        candidates: &[Arm],
    ) -> EngineResult<AllocationDecision> {
        let eligible = Self::eligible(campaign_id, candidates);
        let mut best: Option<&Arm> = None;
        for arm in eligible {
            if best.map_or(true, |b| arm.posterior_mean() > b.posterior_mean()) {
                best = Some(arm);
            }
        }
        let winner = best.ok_or_else(|| EngineError::NoEligibleArms(campaign_id.clone()))?;
        metrics::counter!("bandit.fallback_selections").increment(1);

        Ok(AllocationDecision {
            decision_id: Uuid::new_v4(),
            campaign_id: campaign_id.clone(),
            arm_id: winner.arm_id.clone(),
            confidence: winner.posterior_mean(),
            mode: winner.mode,
            state: winner.state,
            decided_at: self.clock.now(),
            degraded: true,
        })
    }

    /// Fold a normalized reward into an arm. Feedback for a killed arm is
    /// accepted but leaves the posterior untouched.
    pub async fn update(
        &self,
        arm_id: &ArmId,
        reward: f64,
        spend: f64,
        observed_at: DateTime<Utc>,
    ) -> EngineResult<UpdateOutcome> {
        self.fold(None, arm_id, reward, spend, observed_at).await
    }

    /// `update` keyed by a feedback event. An event the arm already
    /// remembers is not folded in again.
    pub async fn update_for_event(
        &self,
        event_id: &EventId,
        arm_id: &ArmId,
        reward: f64,
        spend: f64,
        observed_at: DateTime<Utc>,
    ) -> EngineResult<UpdateOutcome> {
        self.fold(Some(event_id), arm_id, reward, spend, observed_at).await
    }

    async fn fold(
        &self,
        event_id: Option<&EventId>,
        arm_id: &ArmId,
        reward: f64,
        spend: f64,
        observed_at: DateTime<Utc>,
    ) -> EngineResult<UpdateOutcome> {
        if !(reward.is_finite() && (0.0..=1.0).contains(&reward)) {
            return Err(EngineError::Validation(format!(
                "reward {reward} outside [0, 1]"
            )));
        }
        if !(spend.is_finite() && spend >= 0.0) {
            return Err(EngineError::Validation(format!("spend {spend} must be non-negative")));
        }

        let now = self.clock.now();
        let (arm, (applied, already_applied, transitions)) =
            modify_arm(self.store.as_ref(), arm_id, self.cas_max_attempts, |arm| {
                if event_id.is_some_and(|id| arm.has_applied(id)) {
                    return Ok(Mutation::Unchanged((false, true, Vec::new())));
                }
                if arm.state.is_terminal() {
                    return Ok(Mutation::Unchanged((false, false, Vec::new())));
                }
                let policy = self.campaigns.policy(&arm.campaign_id);
                arm.record_observation(reward, spend, observed_at);
                if let Some(id) = event_id {
                    arm.remember_event(id.clone());
                }
                let transitions = lifecycle::evaluate(arm, &policy, now);
                Ok(Mutation::Write((true, false, transitions)))
            })
            .await?;

        if applied {
            metrics::counter!("bandit.updates").increment(1);
        } else if already_applied {
            metrics::counter!("bandit.updates_already_applied").increment(1);
            debug!(arm_id = %arm_id, event_id = ?event_id, "event already folded into arm");
        } else {
            metrics::counter!("bandit.updates_ignored_terminal").increment(1);
            debug!(arm_id = %arm_id, "feedback for killed arm left posterior unchanged");
        }
        log_transitions(&arm, &transitions);

        Ok(UpdateOutcome {
            arm,
            applied,
            already_applied,
            transitions,
        })
    }

    /// Re-evaluate an arm's lifecycle without new feedback; used by the
    /// sweep so ignorance windows expire even on quiet arms.
    pub async fn refresh(&self, arm_id: &ArmId) -> EngineResult<UpdateOutcome> {
        let now = self.clock.now();
        let (arm, transitions) =
            modify_arm(self.store.as_ref(), arm_id, self.cas_max_attempts, |arm| {
                let policy = self.campaigns.policy(&arm.campaign_id);
                let transitions = lifecycle::evaluate(arm, &policy, now);
                if transitions.is_empty() {
                    Ok(Mutation::Unchanged(transitions))
                } else {
                    Ok(Mutation::Write(transitions))
                }
            })
            .await?;
        log_transitions(&arm, &transitions);
        Ok(UpdateOutcome {
            arm,
            applied: false,
            already_applied: false,
            transitions,
        })
    }

    /// Promote an exploiting arm to SCALED. Without `force`, the arm must
    /// have beaten the scale threshold on every day of its consistency
    /// window; `force` is the administrative override.
    pub async fn promote(&self, arm_id: &ArmId, force: bool) -> EngineResult<UpdateOutcome> {
        let now = self.clock.now();
        let (arm, transitions) =
            modify_arm(self.store.as_ref(), arm_id, self.cas_max_attempts, |arm| {
                if arm.state != ArmState::Exploiting {
                    return Err(EngineError::InvalidTransition {
                        arm_id: arm.arm_id.clone(),
                        from: arm.state,
                        to: ArmState::Scaled,
                    });
                }
                let policy = self.campaigns.policy(&arm.campaign_id);
                let reason = match lifecycle::scale_eligibility(arm, &policy, now) {
                    Ok(()) => "consistently above scale threshold".to_string(),
                    Err(_) if force => "administrative promotion".to_string(),
                    Err(why) => {
                        debug!(arm_id = %arm.arm_id, reason = %why, "arm not ready for scaling");
                        return Ok(Mutation::Unchanged(Vec::new()));
                    }
                };
                arm.transition(ArmState::Scaled, now, reason);
                Ok(Mutation::Write(arm.transitions[arm.transitions.len() - 1..].to_vec()))
            })
            .await?;
        log_transitions(&arm, &transitions);
        Ok(UpdateOutcome {
            arm,
            applied: false,
            already_applied: false,
            transitions,
        })
    }
}

fn log_transitions(arm: &Arm, transitions: &[StateTransition]) {
    for t in transitions {
        metrics::counter!("bandit.transitions", "to" => t.to.to_string()).increment(1);
        info!(
            arm_id = %arm.arm_id,
            campaign_id = %arm.campaign_id,
            from = %t.from,
            to = %t.to,
            reason = %t.reason,
            "arm state transition"
        );
    }
}
