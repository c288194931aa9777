//! Mode-specific reward normalization. This is the only place that branches
//! on `Mode`; everything downstream sees a reward in [0, 1].

use adpilot_core::types::{FeedbackEvent, Mode};

/// Substituted when the inputs needed for a ratio are missing or zero.
pub const NEUTRAL_REWARD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalized {
    Reward {
        reward: f64,
        spend: f64,
        /// True when the neutral reward was substituted.
        neutral: bool,
    },
    /// The event carries no measurement and must not count as neutral.
    Discard,
}

/// Normalize an event for an arm in `mode`. ROAS-style ratios are divided
/// by `roas_ceiling`, so a ratio at or above the ceiling earns reward 1.
pub fn normalize(mode: Mode, event: &FeedbackEvent, roas_ceiling: f64) -> Normalized {
    if event.no_data {
        return Normalized::Discard;
    }
    let spend = event
        .spend_delta
        .filter(|s| s.is_finite() && *s >= 0.0)
        .unwrap_or(0.0);

    let value = match mode {
        Mode::DirectRoas => event.revenue_delta,
        Mode::PipelineSynthetic => event.pipeline_value_delta,
    };
    let ratio = roas(value, spend, roas_ceiling).or_else(|| match mode {
        Mode::DirectRoas => conversion_rate(event.conversions, event.clicks),
        Mode::PipelineSynthetic => None,
    });

    match ratio {
        Some(reward) => Normalized::Reward {
            reward,
            spend,
            neutral: false,
        },
        None => Normalized::Reward {
            reward: NEUTRAL_REWARD,
            spend,
            neutral: true,
        },
    }
}

fn roas(value: Option<f64>, spend: f64, ceiling: f64) -> Option<f64> {
    let value = value.filter(|v| v.is_finite())?;
    if spend <= 0.0 || ceiling <= 0.0 {
        return None;
    }
    Some((value / spend / ceiling).clamp(0.0, 1.0))
}

fn conversion_rate(conversions: Option<u64>, clicks: Option<u64>) -> Option<f64> {
    let clicks = clicks.filter(|c| *c > 0)?;
    let conversions = conversions?;
    Some((conversions as f64 / clicks as f64).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpilot_core::types::{ArmId, AttributionSource, EventId};
    use chrono::Utc;

    fn event() -> FeedbackEvent {
        FeedbackEvent {
            event_id: EventId::new("e1"),
            arm_id: ArmId::new("c1:a"),
            observed_at: Utc::now(),
            spend_delta: None,
            revenue_delta: None,
            pipeline_value_delta: None,
            clicks: None,
            conversions: None,
            source: AttributionSource::UrlParam,
            no_data: false,
        }
    }

    fn reward_of(n: Normalized) -> (f64, bool) {
        match n {
            Normalized::Reward { reward, neutral, .. } => (reward, neutral),
            Normalized::Discard => panic!("unexpected discard"),
        }
    }

    #[test]
    fn test_direct_roas_scaled_by_ceiling() {
        let e = FeedbackEvent {
            spend_delta: Some(100.0),
            revenue_delta: Some(200.0),
            ..event()
        };
        assert_eq!(reward_of(normalize(Mode::DirectRoas, &e, 4.0)), (0.5, false));
        assert_eq!(reward_of(normalize(Mode::DirectRoas, &e, 1.0)), (1.0, false));
    }

    #[test]
    fn test_direct_roas_falls_back_to_conversion_rate() {
        let e = FeedbackEvent {
            clicks: Some(40),
            conversions: Some(10),
            ..event()
        };
        assert_eq!(reward_of(normalize(Mode::DirectRoas, &e, 4.0)), (0.25, false));
    }

    #[test]
    fn test_zero_denominators_are_neutral() {
        let e = FeedbackEvent {
            spend_delta: Some(0.0),
            revenue_delta: Some(50.0),
            clicks: Some(0),
            conversions: Some(3),
            ..event()
        };
        assert_eq!(reward_of(normalize(Mode::DirectRoas, &e, 4.0)), (NEUTRAL_REWARD, true));
        assert_eq!(reward_of(normalize(Mode::PipelineSynthetic, &event(), 4.0)), (NEUTRAL_REWARD, true));
    }

    #[test]
    fn test_pipeline_ignores_direct_revenue() {
        let e = FeedbackEvent {
            spend_delta: Some(10.0),
            revenue_delta: Some(1_000.0),
            pipeline_value_delta: Some(10.0),
            ..event()
        };
        assert_eq!(reward_of(normalize(Mode::PipelineSynthetic, &e, 4.0)), (0.25, false));
    }

    #[test]
    fn test_refund_clamps_to_zero() {
        let e = FeedbackEvent {
            spend_delta: Some(10.0),
            revenue_delta: Some(-30.0),
            ..event()
        };
        assert_eq!(reward_of(normalize(Mode::DirectRoas, &e, 4.0)), (0.0, false));
    }

    #[test]
    fn test_no_data_discards() {
        let e = FeedbackEvent {
            no_data: true,
            spend_delta: Some(10.0),
            revenue_delta: Some(10.0),
            ..event()
        };
        assert_eq!(normalize(Mode::DirectRoas, &e, 4.0), Normalized::Discard);
    }
}
