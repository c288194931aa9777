use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Daily reward buckets kept per arm. Fatigue and scale checks only look a
/// few days back, so a month of history is plenty.
pub const MAX_DAILY_BUCKETS: usize = 30;

/// State transitions kept per arm for audit.
pub const MAX_TRANSITIONS: usize = 32;

/// Feedback event ids remembered per arm. A claim abandoned after its
/// update landed is re-applied at most after this many newer events.
pub const MAX_RECENT_EVENTS: usize = 64;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Opaque, immutable arm identifier. Ordering is used for tie-breaks.
    ArmId
);
string_id!(
    /// Owning campaign identifier.
    CampaignId
);
string_id!(
    /// Deduplication key of a feedback event.
    EventId
);

impl ArmId {
    /// Stable arm id for a creative inside a campaign, so every orchestrator
    /// instance resolves the same creative to the same arm.
    pub fn for_creative(campaign_id: &CampaignId, creative_id: &str) -> Self {
        Self(format!("{campaign_id}:{creative_id}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternId(Uuid);

impl PatternId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PatternId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How raw outcome events become a reward. Fixed per arm at creation and
/// consumed only by reward normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    DirectRoas,
    PipelineSynthetic,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectRoas => f.write_str("DIRECT_ROAS"),
            Self::PipelineSynthetic => f.write_str("PIPELINE_SYNTHETIC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArmState {
    Ingesting,
    Learning,
    IgnoranceZone,
    Exploiting,
    Killed,
    Scaled,
}

impl ArmState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Killed)
    }

    /// Whether the arm may still receive budget.
    pub fn is_selectable(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for ArmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ingesting => "INGESTING",
            Self::Learning => "LEARNING",
            Self::IgnoranceZone => "IGNORANCE_ZONE",
            Self::Exploiting => "EXPLOITING",
            Self::Killed => "KILLED",
            Self::Scaled => "SCALED",
        };
        f.write_str(s)
    }
}

/// Reward observations aggregated per calendar day (UTC) of `observed_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardBucket {
    pub day: NaiveDate,
    pub trials: u64,
    pub reward_sum: f64,
}

impl RewardBucket {
    pub fn rate(&self) -> Option<f64> {
        if self.trials == 0 {
            None
        } else {
            Some(self.reward_sum / self.trials as f64)
        }
    }
}

/// Aggregate of the daily buckets falling inside a window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowStats {
    pub trials: u64,
    pub reward_sum: f64,
    pub days_with_data: u32,
}

impl WindowStats {
    pub fn rate(&self) -> Option<f64> {
        if self.trials == 0 {
            None
        } else {
            Some(self.reward_sum / self.trials as f64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ArmState,
    pub to: ArmState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// A single creative/budget-allocation candidate tracked by the bandit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arm {
    pub arm_id: ArmId,
    pub campaign_id: CampaignId,
    pub creative_id: String,
    pub alpha: f64,
    pub beta: f64,
    pub total_trials: u64,
    pub total_reward_sum: f64,
    pub total_spend: f64,
    pub created_at: DateTime<Utc>,
    pub last_feedback_at: Option<DateTime<Utc>>,
    pub state: ArmState,
    pub mode: Mode,
    /// Creative embedding, kept so a proven arm can seed the pattern index.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Pattern whose posterior seeded this arm's prior, if any.
    #[serde(default)]
    pub prior_pattern_id: Option<PatternId>,
    #[serde(default)]
    pub daily: Vec<RewardBucket>,
    #[serde(default)]
    pub transitions: Vec<StateTransition>,
    /// Most recent feedback events folded into the posterior, oldest first.
    #[serde(default)]
    pub recent_events: Vec<EventId>,
    /// Incremented on every write; the store's compare-and-swap key.
    #[serde(default)]
    pub version: u64,
}

impl Arm {
    pub fn new(
        campaign_id: CampaignId,
        creative_id: impl Into<String>,
        mode: Mode,
        created_at: DateTime<Utc>,
    ) -> Self {
        let creative_id = creative_id.into();
        Self {
            arm_id: ArmId::for_creative(&campaign_id, &creative_id),
            campaign_id,
            creative_id,
            alpha: 1.0,
            beta: 1.0,
            total_trials: 0,
            total_reward_sum: 0.0,
            total_spend: 0.0,
            created_at,
            last_feedback_at: None,
            state: ArmState::Ingesting,
            mode,
            embedding: None,
            prior_pattern_id: None,
            daily: Vec::new(),
            transitions: Vec::new(),
            recent_events: Vec::new(),
            version: 0,
        }
    }

    pub fn with_embedding(mut self, embedding: Option<Vec<f32>>) -> Self {
        self.embedding = embedding;
        self
    }

    /// Informative prior from a known pattern. Both parameters stay >= 1.
    pub fn with_prior(mut self, alpha: f64, beta: f64, pattern_id: PatternId) -> Self {
        self.alpha = if alpha.is_finite() { alpha.max(1.0) } else { 1.0 };
        self.beta = if beta.is_finite() { beta.max(1.0) } else { 1.0 };
        self.prior_pattern_id = Some(pattern_id);
        self
    }

    pub fn posterior_mean(&self) -> f64 {
        let denom = self.alpha + self.beta;
        if denom <= 0.0 {
            0.5
        } else {
            self.alpha / denom
        }
    }

    pub fn ignorance_zone_end(&self, window: Duration) -> DateTime<Utc> {
        self.created_at
            .checked_add_signed(window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn in_ignorance_zone(&self, window: Duration, now: DateTime<Utc>) -> bool {
        now < self.ignorance_zone_end(window)
    }

    /// Fold one normalized observation into the posterior and counters.
    /// `reward` must already be clamped to [0, 1].
    pub fn record_observation(&mut self, reward: f64, spend: f64, observed_at: DateTime<Utc>) {
        self.alpha += reward;
        self.beta += 1.0 - reward;
        self.total_trials += 1;
        self.total_reward_sum += reward;
        self.total_spend += spend;
        self.last_feedback_at = Some(match self.last_feedback_at {
            Some(prev) if prev > observed_at => prev,
            _ => observed_at,
        });

        let day = observed_at.date_naive();
        match self.daily.binary_search_by(|b| b.day.cmp(&day)) {
            Ok(idx) => {
                self.daily[idx].trials += 1;
                self.daily[idx].reward_sum += reward;
            }
            Err(idx) => self.daily.insert(
                idx,
                RewardBucket {
                    day,
                    trials: 1,
                    reward_sum: reward,
                },
            ),
        }
        if self.daily.len() > MAX_DAILY_BUCKETS {
            let excess = self.daily.len() - MAX_DAILY_BUCKETS;
            self.daily.drain(..excess);
        }
    }

    /// Aggregate the `days`-day window ending on `end` (inclusive).
    pub fn window(&self, end: NaiveDate, days: u32) -> WindowStats {
        let start = end
            .checked_sub_signed(Duration::days(i64::from(days.max(1)) - 1))
            .unwrap_or(NaiveDate::MIN);
        self.daily
            .iter()
            .filter(|b| b.day >= start && b.day <= end)
            .fold(WindowStats::default(), |mut acc, b| {
                acc.trials += b.trials;
                acc.reward_sum += b.reward_sum;
                if b.trials > 0 {
                    acc.days_with_data += 1;
                }
                acc
            })
    }

    pub fn has_applied(&self, event_id: &EventId) -> bool {
        self.recent_events.contains(event_id)
    }

    pub fn remember_event(&mut self, event_id: EventId) {
        self.recent_events.push(event_id);
        if self.recent_events.len() > MAX_RECENT_EVENTS {
            let excess = self.recent_events.len() - MAX_RECENT_EVENTS;
            self.recent_events.drain(..excess);
        }
    }

    pub fn transition(&mut self, to: ArmState, at: DateTime<Utc>, reason: impl Into<String>) {
        self.transitions.push(StateTransition {
            from: self.state,
            to,
            at,
            reason: reason.into(),
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            self.transitions.remove(0);
        }
        self.state = to;
    }

    /// Whether the arm has ever been in `state`.
    pub fn has_visited(&self, state: ArmState) -> bool {
        self.state == state || self.transitions.iter().any(|t| t.from == state || t.to == state)
    }

    pub fn stats(&self) -> ArmStats {
        ArmStats {
            arm_id: self.arm_id.clone(),
            campaign_id: self.campaign_id.clone(),
            alpha: self.alpha,
            beta: self.beta,
            state: self.state,
            total_trials: self.total_trials,
            total_reward_sum: self.total_reward_sum,
            total_spend: self.total_spend,
            posterior_mean: self.posterior_mean(),
        }
    }
}

/// Read-only arm view for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmStats {
    pub arm_id: ArmId,
    pub campaign_id: CampaignId,
    pub alpha: f64,
    pub beta: f64,
    pub state: ArmState,
    pub total_trials: u64,
    pub total_reward_sum: f64,
    pub total_spend: f64,
    pub posterior_mean: f64,
}

/// Attribution layer that resolved the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionSource {
    UrlParam,
    DeviceFingerprint,
    Probabilistic,
}

/// A single normalized outcome notification from the attribution layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub event_id: EventId,
    pub arm_id: ArmId,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub spend_delta: Option<f64>,
    #[serde(default)]
    pub revenue_delta: Option<f64>,
    #[serde(default)]
    pub pipeline_value_delta: Option<f64>,
    #[serde(default)]
    pub clicks: Option<u64>,
    #[serde(default)]
    pub conversions: Option<u64>,
    pub source: AttributionSource,
    /// Upstream explicitly reports that no measurement exists.
    #[serde(default)]
    pub no_data: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceTier {
    /// Exploiting with sufficient trials.
    Proven,
    /// Promoted to SCALED.
    Winner,
}

impl PerformanceTier {
    pub fn for_state(state: ArmState) -> Option<Self> {
        match state {
            ArmState::Exploiting => Some(Self::Proven),
            ArmState::Scaled => Some(Self::Winner),
            _ => None,
        }
    }
}

/// An embedding plus performance metadata learned from a proven arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub pattern_id: PatternId,
    pub embedding: Vec<f32>,
    pub source_arm_id: ArmId,
    pub source_campaign_id: CampaignId,
    pub performance_tier: PerformanceTier,
    #[serde(default)]
    pub industry: Option<String>,
    pub posterior_mean: f64,
    pub trials: u64,
    pub created_at: DateTime<Utc>,
}

/// A creative offered to `select`; unknown creatives become new arms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreativeCandidate {
    pub creative_id: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

/// Outcome of a single `select` call. Written to the audit log only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationDecision {
    pub decision_id: Uuid,
    pub campaign_id: CampaignId,
    pub arm_id: ArmId,
    pub confidence: f64,
    pub mode: Mode,
    pub state: ArmState,
    pub decided_at: DateTime<Utc>,
    /// True when produced by the deterministic timeout fallback.
    #[serde(default)]
    pub degraded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_new_arm_defaults() {
        let arm = Arm::new(CampaignId::new("c1"), "hero", Mode::DirectRoas, ts(1, 0));
        assert_eq!(arm.arm_id.as_str(), "c1:hero");
        assert_eq!((arm.alpha, arm.beta), (1.0, 1.0));
        assert_eq!(arm.state, ArmState::Ingesting);
        assert!((arm.posterior_mean() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_prior_is_clamped() {
        let arm = Arm::new(CampaignId::new("c1"), "hero", Mode::DirectRoas, ts(1, 0))
            .with_prior(0.2, f64::NAN, PatternId::new());
        assert_eq!((arm.alpha, arm.beta), (1.0, 1.0));
        assert!(arm.prior_pattern_id.is_some());
    }

    #[test]
    fn test_out_of_order_observations_bucket_by_day() {
        let mut arm = Arm::new(CampaignId::new("c1"), "hero", Mode::DirectRoas, ts(1, 0));
        arm.record_observation(1.0, 2.0, ts(5, 10));
        arm.record_observation(0.0, 1.0, ts(3, 10));
        arm.record_observation(0.5, 1.0, ts(5, 22));

        assert_eq!(arm.daily.len(), 2);
        assert!(arm.daily[0].day < arm.daily[1].day);
        assert_eq!(arm.daily[1].trials, 2);
        assert_eq!(arm.total_trials, 3);
        assert_eq!(arm.last_feedback_at, Some(ts(5, 22)));
        assert!((arm.alpha - 2.5).abs() < 1e-12);
        assert!((arm.beta - 2.5).abs() < 1e-12);

        let w = arm.window(ts(5, 0).date_naive(), 3);
        assert_eq!(w.trials, 3);
        assert_eq!(w.days_with_data, 2);
        let w = arm.window(ts(4, 0).date_naive(), 1);
        assert_eq!(w.rate(), None);
    }

    #[test]
    fn test_daily_history_is_bounded() {
        let mut arm = Arm::new(CampaignId::new("c1"), "hero", Mode::DirectRoas, ts(1, 0));
        let start = ts(1, 12);
        for d in 0..(MAX_DAILY_BUCKETS as i64 + 5) {
            arm.record_observation(1.0, 1.0, start + Duration::days(d));
        }
        assert_eq!(arm.daily.len(), MAX_DAILY_BUCKETS);
        assert_eq!(arm.total_trials, MAX_DAILY_BUCKETS as u64 + 5);
    }

    #[test]
    fn test_extreme_windows_saturate() {
        let arm = Arm::new(CampaignId::new("c1"), "hero", Mode::DirectRoas, ts(1, 0));
        assert_eq!(arm.ignorance_zone_end(Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert!(arm.in_ignorance_zone(Duration::MAX, ts(20, 0)));

        let mut arm = arm;
        arm.record_observation(1.0, 1.0, ts(2, 0));
        let stats = arm.window(ts(2, 0).date_naive(), u32::MAX);
        assert_eq!(stats.trials, 1);
    }

    #[test]
    fn test_recent_events_are_bounded() {
        let mut arm = Arm::new(CampaignId::new("c1"), "hero", Mode::DirectRoas, ts(1, 0));
        for i in 0..MAX_RECENT_EVENTS + 5 {
            arm.remember_event(EventId::new(format!("evt-{i}")));
        }
        assert_eq!(arm.recent_events.len(), MAX_RECENT_EVENTS);
        assert!(!arm.has_applied(&EventId::new("evt-0")));
        assert!(arm.has_applied(&EventId::new(format!("evt-{}", MAX_RECENT_EVENTS + 4))));
    }

    #[test]
    fn test_mode_serialization() {
        let json = serde_json::to_string(&Mode::PipelineSynthetic).unwrap();
        assert_eq!(json, "\"PIPELINE_SYNTHETIC\"");
        let state: ArmState = serde_json::from_str("\"IGNORANCE_ZONE\"").unwrap();
        assert_eq!(state, ArmState::IgnoranceZone);
    }
}
