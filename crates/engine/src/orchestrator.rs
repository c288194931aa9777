//! AllocationOrchestrator: the engine's external contract.
//!
//! `select` resolves candidate creatives to arms (creating unknown ones,
//! seeded from the pattern library when the campaign has no history yet),
//! delegates to the bandit and records the decision in the audit log. It
//! never blocks past the select timeout: a slow or failing store yields a
//! deterministic decision from the last known snapshots instead.
//!
//! `feedback` hands events to the RewardBridge, retrying transient failures
//! with backoff and parking events that keep failing.

use crate::audit::{DecisionAuditLog, DecisionRecord};
use crate::retry::{ParkedEvent, ParkedEvents, ParkedMetrics, RetryPolicy};
use adpilot_bandit::BanditAllocator;
use adpilot_core::campaign::{CampaignConfig, CampaignRegistry};
use adpilot_core::clock::Clock;
use adpilot_core::config::{AppConfig, CampaignPolicy, EngineConfig};
use adpilot_core::error::{EngineError, EngineResult};
use adpilot_core::types::{
    AllocationDecision, Arm, ArmId, ArmState, ArmStats, CampaignId, CreativeCandidate,
    FeedbackEvent, Mode, PatternId,
};
use adpilot_patterns::{IndexStats, PatternIndex, ScoredPattern, SearchFilter};
use adpilot_rewards::{IngestOutcome, RewardBridge};
use adpilot_store::{ArmStore, EventLog, SnapshotCache};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pseudo-count mean of an uninformed (1, 1) prior.
const UNINFORMED_MEAN: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectRequest {
    pub campaign_id: CampaignId,
    pub mode: Mode,
    pub candidate_creatives: Vec<CreativeCandidate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromotionOutcome {
    pub promoted: bool,
    pub stats: ArmStats,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub replayed: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub parked_again: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub campaigns: usize,
    pub pattern_index_available: bool,
    pub parked_events: usize,
    pub decisions_retained: usize,
}

pub struct AllocationOrchestrator {
    engine: EngineConfig,
    prior_strength: f64,
    min_prior_similarity: f64,
    pub(crate) campaigns: Arc<CampaignRegistry>,
    pub(crate) store: Arc<dyn ArmStore>,
    pub(crate) allocator: Arc<BanditAllocator>,
    bridge: RewardBridge,
    pub(crate) patterns: Arc<PatternIndex>,
    pub(crate) snapshots: SnapshotCache,
    audit: DecisionAuditLog,
    retry: RetryPolicy,
    parked: ParkedEvents,
    pub(crate) clock: Arc<dyn Clock>,
}

impl AllocationOrchestrator {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn ArmStore>,
        event_log: Arc<dyn EventLog>,
        patterns: Arc<PatternIndex>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let campaigns = Arc::new(CampaignRegistry::new(config.defaults.clone()));
        let allocator = Arc::new(
            BanditAllocator::new(
                store.clone(),
                campaigns.clone(),
                clock.clone(),
                config.engine.rng_seed,
            )
            .with_cas_attempts(config.store.cas_max_attempts),
        );
        let bridge = RewardBridge::new(
            event_log,
            store.clone(),
            allocator.clone(),
            campaigns.clone(),
            clock.clone(),
        );

        info!(
            node_id = %config.node_id,
            select_timeout_ms = config.engine.select_timeout_ms,
            pattern_lookup_timeout_ms = config.engine.pattern_lookup_timeout_ms,
            seeded = config.engine.rng_seed.is_some(),
            "Allocation orchestrator initialized"
        );

        Self {
            engine: config.engine.clone(),
            prior_strength: config.patterns.prior_strength,
            min_prior_similarity: config.patterns.min_prior_similarity,
            campaigns,
            store,
            allocator,
            bridge,
            patterns,
            snapshots: SnapshotCache::new(
                Duration::from_secs(config.store.snapshot_ttl_secs),
                config.store.snapshot_max_entries,
            ),
            audit: DecisionAuditLog::new(config.engine.decision_log_capacity),
            retry: RetryPolicy::from(&config.feedback),
            parked: ParkedEvents::new(config.feedback.parked_capacity),
            clock,
        }
    }

    // ─── Campaigns ──────────────────────────────────────────────────────

    pub fn register_campaign(&self, config: CampaignConfig) -> EngineResult<()> {
        self.campaigns.register(config)
    }

    pub fn campaign(&self, campaign_id: &CampaignId) -> Option<CampaignConfig> {
        self.campaigns.get(campaign_id)
    }

    /// Policy applied to campaigns registered without overrides.
    pub fn default_policy(&self) -> CampaignPolicy {
        self.campaigns.defaults().clone()
    }

    // ─── Select ─────────────────────────────────────────────────────────

    pub async fn select(&self, request: SelectRequest) -> EngineResult<AllocationDecision> {
        let campaign = self.campaigns.require(&request.campaign_id)?;
        if campaign.mode != request.mode {
            return Err(EngineError::InvalidMode {
                campaign_id: campaign.campaign_id.clone(),
                expected: campaign.mode,
                got: request.mode,
            });
        }
        let candidates = self.validate_candidates(&campaign.campaign_id, &request.candidate_creatives)?;

        let started = Instant::now();
        let deadline = Duration::from_millis(self.engine.select_timeout_ms);
        let decision = match tokio::time::timeout(deadline, self.select_fresh(&campaign, &candidates)).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) if e.is_transient() => {
                warn!(campaign_id = %campaign.campaign_id, error = %e, "select degraded after store error");
                self.select_degraded(&campaign, &candidates)?
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                metrics::counter!("engine.select_timeouts").increment(1);
                warn!(
                    campaign_id = %campaign.campaign_id,
                    timeout_ms = self.engine.select_timeout_ms,
                    "select timed out, using deterministic fallback"
                );
                self.select_degraded(&campaign, &candidates)?
            }
        };

        metrics::histogram!("engine.select_latency_seconds").record(started.elapsed().as_secs_f64());
        if decision.degraded {
            metrics::counter!("engine.degraded_selections").increment(1);
        }
        self.audit.append(decision.clone());
        Ok(decision)
    }

    /// Reject malformed candidates before anything is written and drop
    /// repeated creative ids, keeping the first.
    fn validate_candidates(
        &self,
        campaign_id: &CampaignId,
        candidates: &[CreativeCandidate],
    ) -> EngineResult<Vec<CreativeCandidate>> {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.creative_id.trim().is_empty() {
                return Err(EngineError::Validation("creative_id must not be empty".into()));
            }
            if let Some(embedding) = &candidate.embedding {
                self.patterns.normalize(embedding)?;
            }
            if seen.insert(candidate.creative_id.clone()) {
                unique.push(candidate.clone());
            }
        }
        if unique.is_empty() {
            return Err(EngineError::NoEligibleArms(campaign_id.clone()));
        }
        Ok(unique)
    }

    async fn select_fresh(
        &self,
        campaign: &CampaignConfig,
        candidates: &[CreativeCandidate],
    ) -> EngineResult<AllocationDecision> {
        let mut arms = Vec::with_capacity(candidates.len());
        let mut missing = Vec::new();
        for candidate in candidates {
            let arm_id = ArmId::for_creative(&campaign.campaign_id, &candidate.creative_id);
            match self.snapshots.get(&arm_id) {
                Some(arm) => arms.push(arm),
                None => missing.push(candidate),
            }
        }

        if !missing.is_empty() {
            let known: HashMap<ArmId, Arm> = self
                .store
                .list_campaign(&campaign.campaign_id)
                .await?
                .into_iter()
                .map(|arm| (arm.arm_id.clone(), arm))
                .collect();
            let has_history = known.values().any(|arm| arm.total_trials > 0);

            for candidate in missing {
                let arm_id = ArmId::for_creative(&campaign.campaign_id, &candidate.creative_id);
                let arm = match known.get(&arm_id) {
                    Some(arm) => arm.clone(),
                    None => self.create_arm(campaign, candidate, has_history).await?,
                };
                self.snapshots.put(arm.clone());
                arms.push(arm);
            }
        }

        self.allocator.select(&campaign.campaign_id, &arms)
    }

    /// Decision without a random draw or a store round-trip: highest
    /// posterior mean among cached snapshots, else the lowest arm id not
    /// known to be killed.
    fn select_degraded(
        &self,
        campaign: &CampaignConfig,
        candidates: &[CreativeCandidate],
    ) -> EngineResult<AllocationDecision> {
        let mut cached = Vec::new();
        let mut unknown = Vec::new();
        for candidate in candidates {
            let arm_id = ArmId::for_creative(&campaign.campaign_id, &candidate.creative_id);
            match self.snapshots.get_stale(&arm_id) {
                Some(arm) => cached.push(arm),
                None => unknown.push(arm_id),
            }
        }

        if let Ok(decision) = self.allocator.select_fallback(&campaign.campaign_id, &cached) {
            return Ok(decision);
        }
        let arm_id = unknown
            .into_iter()
            .min()
            .ok_or_else(|| EngineError::NoEligibleArms(campaign.campaign_id.clone()))?;
        Ok(AllocationDecision {
            decision_id: Uuid::new_v4(),
            campaign_id: campaign.campaign_id.clone(),
            arm_id,
            confidence: UNINFORMED_MEAN,
            mode: campaign.mode,
            state: ArmState::Ingesting,
            decided_at: self.clock.now(),
            degraded: true,
        })
    }

    async fn create_arm(
        &self,
        campaign: &CampaignConfig,
        candidate: &CreativeCandidate,
        has_history: bool,
    ) -> EngineResult<Arm> {
        let mut arm = Arm::new(
            campaign.campaign_id.clone(),
            candidate.creative_id.clone(),
            campaign.mode,
            self.clock.now(),
        )
        .with_embedding(candidate.embedding.clone());

        if !has_history {
            if let Some(embedding) = &candidate.embedding {
                if let Some((alpha, beta, pattern_id)) = self.informed_prior(campaign, embedding).await {
                    arm = arm.with_prior(alpha, beta, pattern_id);
                }
            }
        }

        let stored = self.store.insert_if_absent(arm).await?;
        metrics::counter!("engine.arms_created").increment(1);
        info!(
            arm_id = %stored.arm_id,
            alpha = stored.alpha,
            beta = stored.beta,
            prior_pattern_id = ?stored.prior_pattern_id,
            "Arm created"
        );
        Ok(stored)
    }

    /// Prior pseudo-counts from the closest known pattern. Any failure,
    /// including a lookup slower than the pattern timeout, yields None and
    /// the arm keeps the uninformed (1, 1) prior.
    pub async fn informed_prior(
        &self,
        campaign: &CampaignConfig,
        embedding: &[f32],
    ) -> Option<(f64, f64, PatternId)> {
        let policy = &campaign.policy;
        let filter = SearchFilter {
            exclude_campaign: policy
                .exclude_own_campaign
                .then(|| campaign.campaign_id.clone()),
            industry: if policy.prior_industry_filter {
                campaign.industry.clone()
            } else {
                None
            },
        };
        let index = self.patterns.clone();
        let query = embedding.to_vec();
        let lookup = tokio::task::spawn_blocking(move || index.search(&query, 1, &filter));
        let timeout = Duration::from_millis(self.engine.pattern_lookup_timeout_ms);

        let best = match tokio::time::timeout(timeout, lookup).await {
            Ok(Ok(Ok(hits))) => hits.into_iter().next(),
            Ok(Ok(Err(e))) => {
                metrics::counter!("engine.prior_fallbacks", "reason" => "error").increment(1);
                warn!(campaign_id = %campaign.campaign_id, error = %e, "pattern lookup failed, using uninformed prior");
                None
            }
            Ok(Err(e)) => {
                metrics::counter!("engine.prior_fallbacks", "reason" => "error").increment(1);
                warn!(campaign_id = %campaign.campaign_id, error = %e, "pattern lookup task failed");
                None
            }
            Err(_) => {
                metrics::counter!("engine.prior_fallbacks", "reason" => "timeout").increment(1);
                warn!(campaign_id = %campaign.campaign_id, "pattern lookup timed out, using uninformed prior");
                None
            }
        };

        let best: ScoredPattern = best?;
        if best.similarity < self.min_prior_similarity {
            debug!(
                campaign_id = %campaign.campaign_id,
                similarity = best.similarity,
                "closest pattern too dissimilar for a prior"
            );
            return None;
        }
        let mean = best.pattern.posterior_mean.clamp(0.0, 1.0);
        Some((
            mean * self.prior_strength,
            (1.0 - mean) * self.prior_strength,
            best.pattern.pattern_id,
        ))
    }

    // ─── Feedback ───────────────────────────────────────────────────────

    pub async fn feedback(&self, event: FeedbackEvent) -> EngineResult<IngestOutcome> {
        let mut attempt = 0u32;
        loop {
            match self.bridge.ingest(event.clone()).await {
                Ok(outcome) => {
                    self.snapshots.invalidate(&event.arm_id);
                    return Ok(outcome);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let backoff = self.retry.backoff_for_attempt(attempt);
                    attempt += 1;
                    metrics::counter!("feedback.retries").increment(1);
                    debug!(
                        event_id = %event.event_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retrying feedback"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) if e.is_transient() => {
                    let event_id = event.event_id.clone();
                    let parked = self.parked.park(ParkedEvent {
                        event,
                        error: e.to_string(),
                        attempts: attempt + 1,
                        parked_at: self.clock.now(),
                    });
                    if parked {
                        metrics::counter!("feedback.parked").increment(1);
                        warn!(
                            event_id = %event_id,
                            attempts = attempt + 1,
                            error = %e,
                            "feedback parked for manual replay"
                        );
                    } else {
                        error!(
                            event_id = %event_id,
                            attempts = attempt + 1,
                            error = %e,
                            "feedback not parked, lot full; caller must resubmit"
                        );
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn parked(&self, limit: usize) -> Vec<ParkedEvent> {
        self.parked.peek(limit)
    }

    pub fn parked_metrics(&self) -> ParkedMetrics {
        self.parked.metrics()
    }

    /// Re-submit every parked event. Events that still fail transiently are
    /// parked again by `feedback`.
    pub async fn replay_parked(&self) -> ReplayReport {
        let mut report = ReplayReport::default();
        for parked in self.parked.drain() {
            report.replayed += 1;
            let event_id = parked.event.event_id.clone();
            match self.feedback(parked.event).await {
                Ok(outcome) if outcome.duplicate => report.duplicates += 1,
                Ok(_) => report.applied += 1,
                Err(e) if e.is_transient() => report.parked_again += 1,
                Err(e) => {
                    warn!(event_id = %event_id, error = %e, "parked event rejected on replay");
                    report.rejected += 1;
                }
            }
        }
        info!(
            replayed = report.replayed,
            applied = report.applied,
            parked_again = report.parked_again,
            "Parked feedback replayed"
        );
        report
    }

    // ─── Arms, patterns, audit ──────────────────────────────────────────

    pub async fn arm_stats(&self, arm_id: &ArmId) -> EngineResult<ArmStats> {
        self.store
            .get(arm_id)
            .await?
            .map(|arm| arm.stats())
            .ok_or_else(|| EngineError::ArmNotFound(arm_id.clone()))
    }

    pub async fn arm(&self, arm_id: &ArmId) -> EngineResult<Arm> {
        self.store
            .get(arm_id)
            .await?
            .ok_or_else(|| EngineError::ArmNotFound(arm_id.clone()))
    }

    /// Promote an exploiting arm to SCALED and record it as a winner
    /// pattern. Without `force` the arm must pass the consistency check.
    pub async fn promote(&self, arm_id: &ArmId, force: bool) -> EngineResult<PromotionOutcome> {
        let outcome = self.allocator.promote(arm_id, force).await?;
        self.snapshots.invalidate(arm_id);
        let promoted = !outcome.transitions.is_empty();
        if promoted {
            let trigger = if force { "admin" } else { "request" };
            metrics::counter!("engine.promotions", "trigger" => trigger).increment(1);
            let industry = self
                .campaigns
                .get(&outcome.arm.campaign_id)
                .and_then(|c| c.industry);
            if let Err(e) = self
                .patterns
                .ingest_arm(&outcome.arm, industry.as_deref(), self.clock.now())
            {
                warn!(arm_id = %arm_id, error = %e, "promoted arm not ingested as pattern");
            }
        }
        Ok(PromotionOutcome {
            promoted,
            stats: outcome.arm.stats(),
        })
    }

    pub fn search_similar(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> EngineResult<Vec<ScoredPattern>> {
        self.patterns.search(embedding, k, filter)
    }

    pub fn pattern_stats(&self) -> IndexStats {
        self.patterns.stats()
    }

    pub fn decisions(&self, campaign_id: &CampaignId, limit: usize) -> EngineResult<Vec<DecisionRecord>> {
        self.campaigns.require(campaign_id)?;
        Ok(self.audit.for_campaign(campaign_id, limit))
    }

    pub fn audit(&self) -> &DecisionAuditLog {
        &self.audit
    }

    pub fn patterns(&self) -> &Arc<PatternIndex> {
        &self.patterns
    }

    pub fn snapshots(&self) -> &SnapshotCache {
        &self.snapshots
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            campaigns: self.campaigns.len(),
            pattern_index_available: self.patterns.is_available(),
            parked_events: self.parked.depth(),
            decisions_retained: self.audit.len(),
        }
    }
}
