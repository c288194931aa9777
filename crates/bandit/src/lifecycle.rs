//! Per-arm state machine.
//!
//! ```text
//! INGESTING --first feedback--> LEARNING <--window expiry-- IGNORANCE_ZONE
//!                                  |  \--inside window-------^    |
//!                                  |                              |
//!       trials >= min && mean > scale (from either)               |
//!                                  v                              |
//!                              EXPLOITING <-----------------------+
//!                                  |
//!                      consistent winner (sweep/admin)
//!                                  v
//!                                SCALED
//!
//! LEARNING / EXPLOITING --mean < kill, outside window--> KILLED (terminal)
//! ```

use adpilot_core::config::CampaignPolicy;
use adpilot_core::types::{Arm, ArmState, StateTransition};
use chrono::{DateTime, Utc};

/// Advance `arm` through every transition its current counters justify.
/// Returns the transitions applied, oldest first.
pub fn evaluate(arm: &mut Arm, policy: &CampaignPolicy, now: DateTime<Utc>) -> Vec<StateTransition> {
    let mut applied = 0usize;

    if arm.state == ArmState::Ingesting && arm.total_trials > 0 {
        arm.transition(ArmState::Learning, now, "first feedback received");
        applied += 1;
    }

    let protected = arm.in_ignorance_zone(policy.ignorance_window(), now);
    match arm.state {
        ArmState::Learning if protected => {
            arm.transition(
                ArmState::IgnoranceZone,
                now,
                format!(
                    "protected until {}",
                    arm.ignorance_zone_end(policy.ignorance_window()).to_rfc3339()
                ),
            );
            applied += 1;
        }
        ArmState::IgnoranceZone if !protected => {
            arm.transition(ArmState::Learning, now, "ignorance window expired");
            applied += 1;
        }
        _ => {}
    }

    let mean = arm.posterior_mean();
    match arm.state {
        ArmState::Learning | ArmState::IgnoranceZone
            if arm.total_trials >= policy.min_sample_threshold && mean > policy.scale_threshold =>
        {
            arm.transition(
                ArmState::Exploiting,
                now,
                format!("posterior mean {mean:.3} above scale threshold after {} trials", arm.total_trials),
            );
            applied += 1;
        }
        ArmState::Learning | ArmState::Exploiting
            if !protected && mean < policy.kill_threshold =>
        {
            arm.transition(
                ArmState::Killed,
                now,
                format!("posterior mean {mean:.3} below kill threshold"),
            );
            applied += 1;
        }
        _ => {}
    }

    // At most a handful of transitions per call, well under the history bound.
    let start = arm.transitions.len().saturating_sub(applied);
    arm.transitions[start..].to_vec()
}

/// Whether an exploiting arm has beaten the scale threshold on every day of
/// the trailing consistency window. Returns the reason it does not qualify.
pub fn scale_eligibility(arm: &Arm, policy: &CampaignPolicy, now: DateTime<Utc>) -> Result<(), String> {
    if arm.state != ArmState::Exploiting {
        return Err(format!("arm is {}, not EXPLOITING", arm.state));
    }
    let mean = arm.posterior_mean();
    if mean <= policy.scale_threshold {
        return Err(format!("posterior mean {mean:.3} not above scale threshold"));
    }

    let today = now.date_naive();
    let days = policy.scale_window_days.max(1);
    let window = arm.window(today, days);
    if window.days_with_data < days {
        return Err(format!(
            "only {} of the last {days} days have feedback",
            window.days_with_data
        ));
    }
    let start = today
        .checked_sub_signed(chrono::Duration::days(i64::from(days) - 1))
        .unwrap_or(chrono::NaiveDate::MIN);
    let below = arm
        .daily
        .iter()
        .filter(|b| b.day >= start && b.day <= today)
        .filter_map(|b| b.rate().map(|r| (b.day, r)))
        .find(|(_, rate)| *rate <= policy.scale_threshold);
    if let Some((day, rate)) = below {
        return Err(format!("reward rate {rate:.3} on {day} not above scale threshold"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpilot_core::types::{CampaignId, Mode};
    use chrono::{Duration, TimeZone};

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    fn new_arm() -> Arm {
        Arm::new(CampaignId::new("c1"), "a", Mode::DirectRoas, created())
    }

    fn feed(arm: &mut Arm, reward: f64, n: usize, at: DateTime<Utc>, policy: &CampaignPolicy) {
        for _ in 0..n {
            arm.record_observation(reward, 1.0, at);
            evaluate(arm, policy, at);
        }
    }

    #[test]
    fn test_first_feedback_inside_window_enters_ignorance_zone() {
        let policy = CampaignPolicy::default();
        let mut arm = new_arm();
        arm.record_observation(0.5, 1.0, created());
        let transitions = evaluate(&mut arm, &policy, created() + Duration::hours(1));

        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].to, ArmState::Learning);
        assert_eq!(transitions[1].to, ArmState::IgnoranceZone);
        assert_eq!(arm.state, ArmState::IgnoranceZone);
    }

    #[test]
    fn test_no_transition_without_feedback() {
        let policy = CampaignPolicy::default();
        let mut arm = new_arm();
        assert!(evaluate(&mut arm, &policy, created() + Duration::days(5)).is_empty());
        assert_eq!(arm.state, ArmState::Ingesting);
    }

    #[test]
    fn test_protected_arm_is_never_killed() {
        let policy = CampaignPolicy::default();
        let mut arm = new_arm();
        let inside = created() + Duration::hours(47);
        feed(&mut arm, 0.0, 30, inside, &policy);
        assert_eq!(arm.state, ArmState::IgnoranceZone);

        let transitions = evaluate(&mut arm, &policy, created() + Duration::hours(48));
        assert_eq!(arm.state, ArmState::Killed);
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].to, ArmState::Learning);
    }

    #[test]
    fn test_killed_is_terminal() {
        let policy = CampaignPolicy::default();
        let mut arm = new_arm();
        let after = created() + Duration::days(3);
        feed(&mut arm, 0.0, 5, after, &policy);
        assert_eq!(arm.state, ArmState::Killed);

        feed(&mut arm, 1.0, 200, after, &policy);
        assert_eq!(arm.state, ArmState::Killed);
    }

    #[test]
    fn test_exploiting_requires_min_samples() {
        let policy = CampaignPolicy::default();
        let mut arm = new_arm();
        let after = created() + Duration::days(3);
        feed(&mut arm, 1.0, 49, after, &policy);
        assert_eq!(arm.state, ArmState::Learning);
        feed(&mut arm, 1.0, 1, after, &policy);
        assert_eq!(arm.state, ArmState::Exploiting);
    }

    #[test]
    fn test_exploiting_arm_inside_window_is_not_killed() {
        let policy = CampaignPolicy {
            min_sample_threshold: 5,
            ..CampaignPolicy::default()
        };
        let mut arm = new_arm();
        let inside = created() + Duration::hours(1);
        feed(&mut arm, 1.0, 5, inside, &policy);
        assert_eq!(arm.state, ArmState::Exploiting);
        feed(&mut arm, 0.0, 100, inside, &policy);
        assert_eq!(arm.state, ArmState::Exploiting);

        evaluate(&mut arm, &policy, created() + Duration::days(2));
        assert_eq!(arm.state, ArmState::Killed);
    }

    #[test]
    fn test_scale_eligibility_requires_consistent_days() {
        let policy = CampaignPolicy {
            min_sample_threshold: 5,
            ..CampaignPolicy::default()
        };
        let mut arm = new_arm();
        let day = |d: i64| created() + Duration::days(d) + Duration::hours(12);

        feed(&mut arm, 1.0, 10, day(3), &policy);
        assert_eq!(arm.state, ArmState::Exploiting);
        assert!(scale_eligibility(&arm, &policy, day(3)).is_err());

        feed(&mut arm, 1.0, 10, day(4), &policy);
        feed(&mut arm, 0.5, 10, day(5), &policy);
        let reason = scale_eligibility(&arm, &policy, day(5)).unwrap_err();
        assert!(reason.contains("not above scale threshold"));

        feed(&mut arm, 1.0, 10, day(6), &policy);
        feed(&mut arm, 1.0, 10, day(7), &policy);
        assert!(scale_eligibility(&arm, &policy, day(7)).is_err());
        feed(&mut arm, 1.0, 10, day(8), &policy);
        assert!(scale_eligibility(&arm, &policy, day(8)).is_ok());
    }
}
