//! Creative fatigue: compares the reward rate of the most recent N-day
//! bucket against the N-day bucket before it. A decline shrinks the decay
//! factor toward the campaign floor; anything else leaves it at 1.0.

use adpilot_core::config::CampaignPolicy;
use adpilot_core::types::Arm;
use chrono::{Duration, NaiveDate};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FatigueReading {
    pub decay: f64,
    pub recent_rate: Option<f64>,
    pub prior_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FatigueEstimator;

impl FatigueEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Decay factor in `(0, 1]` for `arm` as of `today`.
    pub fn decay(&self, arm: &Arm, policy: &CampaignPolicy, today: NaiveDate) -> f64 {
        self.assess(arm, policy, today).decay
    }

    pub fn assess(&self, arm: &Arm, policy: &CampaignPolicy, today: NaiveDate) -> FatigueReading {
        let days = policy.fatigue_window_days.max(1);
        let recent = arm.window(today, days);
        let prior_end = today
            .checked_sub_signed(Duration::days(i64::from(days)))
            .unwrap_or(NaiveDate::MIN);
        let prior = arm.window(prior_end, days);

        let (recent_rate, prior_rate) = (recent.rate(), prior.rate());
        let decay = match (recent_rate, prior_rate) {
            (Some(r), Some(p)) if r < p && p > 0.0 => {
                let relative_drop = (p - r) / p;
                let floor = policy.fatigue_floor.clamp(f64::MIN_POSITIVE, 1.0);
                (1.0 - policy.fatigue_sensitivity.max(0.0) * relative_drop).clamp(floor, 1.0)
            }
            // Fewer than two windows of data never penalizes.
            _ => 1.0,
        };

        FatigueReading {
            decay,
            recent_rate,
            prior_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpilot_core::types::{CampaignId, Mode};
    use chrono::{TimeZone, Utc};

    fn arm_with(rates: &[(u32, f64, u64)]) -> Arm {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let mut arm = Arm::new(CampaignId::new("c1"), "a", Mode::DirectRoas, created);
        for &(day, reward, trials) in rates {
            let at = Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).unwrap();
            for _ in 0..trials {
                arm.record_observation(reward, 1.0, at);
            }
        }
        arm
    }

    fn today(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    #[test]
    fn test_insufficient_data_returns_one() {
        let policy = CampaignPolicy::default();
        let estimator = FatigueEstimator::new();

        let empty = arm_with(&[]);
        assert_eq!(estimator.decay(&empty, &policy, today(10)), 1.0);

        // Only the recent window has data.
        let recent_only = arm_with(&[(9, 0.1, 5), (10, 0.1, 5)]);
        assert_eq!(estimator.decay(&recent_only, &policy, today(10)), 1.0);
    }

    #[test]
    fn test_declining_arm_is_discounted() {
        let policy = CampaignPolicy::default();
        // prior window days 2..=4 at 0.8, recent window days 5..=7 at 0.6
        let arm = arm_with(&[(3, 0.8, 10), (6, 0.6, 10)]);
        let reading = FatigueEstimator::new().assess(&arm, &policy, today(7));

        assert!((reading.decay - 0.75).abs() < 1e-9);
        assert!((reading.prior_rate.unwrap() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_decay_never_drops_below_floor() {
        let policy = CampaignPolicy::default();
        let arm = arm_with(&[(3, 0.9, 10), (6, 0.0, 10)]);
        assert_eq!(FatigueEstimator::new().decay(&arm, &policy, today(7)), 0.5);
    }

    #[test]
    fn test_improving_or_flat_arm_is_not_penalized() {
        let policy = CampaignPolicy::default();
        let estimator = FatigueEstimator::new();
        let improving = arm_with(&[(3, 0.4, 10), (6, 0.7, 10)]);
        assert_eq!(estimator.decay(&improving, &policy, today(7)), 1.0);
        let flat = arm_with(&[(3, 0.5, 10), (6, 0.5, 10)]);
        assert_eq!(estimator.decay(&flat, &policy, today(7)), 1.0);
    }

    #[test]
    fn test_buckets_do_not_overlap() {
        let policy = CampaignPolicy::default();
        // Day 4 belongs to the prior window when today is day 7.
        let arm = arm_with(&[(4, 1.0, 10), (5, 0.5, 10)]);
        let reading = FatigueEstimator::new().assess(&arm, &policy, today(7));
        assert_eq!(reading.prior_rate, Some(1.0));
        assert_eq!(reading.recent_rate, Some(0.5));
    }
}
