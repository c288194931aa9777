//! Periodic sweep: expires ignorance windows on quiet arms, promotes
//! consistent winners to SCALED and feeds proven arms into the pattern
//! library.

use crate::orchestrator::AllocationOrchestrator;
use adpilot_core::campaign::CampaignConfig;
use adpilot_core::error::{EngineError, EngineResult};
use adpilot_core::types::{Arm, ArmState, PerformanceTier};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub campaigns: usize,
    pub arms_evaluated: usize,
    pub transitions: usize,
    pub promoted: usize,
    pub patterns_ingested: usize,
    pub errors: usize,
}

impl AllocationOrchestrator {
    pub async fn run_sweep(&self) -> SweepReport {
        let mut report = SweepReport {
            started_at: self.clock.now(),
            campaigns: 0,
            arms_evaluated: 0,
            transitions: 0,
            promoted: 0,
            patterns_ingested: 0,
            errors: 0,
        };

        for campaign_id in self.campaigns.campaign_ids() {
            let Some(campaign) = self.campaigns.get(&campaign_id) else {
                continue;
            };
            report.campaigns += 1;

            let arms = match self.store.list_campaign(&campaign_id).await {
                Ok(arms) => arms,
                Err(e) => {
                    warn!(campaign_id = %campaign_id, error = %e, "sweep could not list arms");
                    report.errors += 1;
                    continue;
                }
            };
            for arm in arms.into_iter().filter(|a| !a.state.is_terminal()) {
                report.arms_evaluated += 1;
                let arm_id = arm.arm_id.clone();
                if let Err(e) = self.sweep_arm(&campaign, arm, &mut report).await {
                    warn!(arm_id = %arm_id, error = %e, "sweep failed for arm");
                    report.errors += 1;
                }
            }
        }

        metrics::counter!("engine.sweeps").increment(1);
        metrics::counter!("engine.sweep_promotions").increment(report.promoted as u64);
        info!(
            campaigns = report.campaigns,
            arms = report.arms_evaluated,
            transitions = report.transitions,
            promoted = report.promoted,
            patterns_ingested = report.patterns_ingested,
            errors = report.errors,
            "Sweep complete"
        );
        report
    }

    async fn sweep_arm(
        &self,
        campaign: &CampaignConfig,
        arm: Arm,
        report: &mut SweepReport,
    ) -> EngineResult<()> {
        let refreshed = self.allocator.refresh(&arm.arm_id).await?;
        report.transitions += refreshed.transitions.len();
        let mut current = refreshed.arm;

        if current.state == ArmState::Exploiting {
            let promoted = self.allocator.promote(&current.arm_id, false).await?;
            if !promoted.transitions.is_empty() {
                report.promoted += 1;
                report.transitions += promoted.transitions.len();
            }
            current = promoted.arm;
        }
        self.snapshots.invalidate(&current.arm_id);

        if PerformanceTier::for_state(current.state).is_none()
            || current.total_trials < campaign.policy.min_sample_threshold
        {
            return Ok(());
        }
        match self
            .patterns
            .ingest_arm(&current, campaign.industry.as_deref(), self.clock.now())
        {
            Ok(Some(pattern_id)) => {
                debug!(arm_id = %current.arm_id, pattern_id = %pattern_id, "sweep ingested pattern");
                report.patterns_ingested += 1;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(EngineError::IndexUnavailable(reason)) => {
                debug!(arm_id = %current.arm_id, reason = %reason, "pattern index offline, ingestion skipped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
