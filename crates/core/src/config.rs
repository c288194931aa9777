use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Root application configuration. Loaded from environment variables
/// with the prefix `ADPILOT__` and an optional `config/adpilot.toml` file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub patterns: PatternConfig,
    /// Policy applied to campaigns that do not override it.
    #[serde(default)]
    pub defaults: CampaignPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Read-modify-write attempts before an update reports contention.
    #[serde(default = "default_cas_max_attempts")]
    pub cas_max_attempts: u32,
    /// TTL of the in-process arm snapshot cache used by `select`.
    #[serde(default = "default_snapshot_ttl_secs")]
    pub snapshot_ttl_secs: u64,
    #[serde(default = "default_snapshot_max_entries")]
    pub snapshot_max_entries: usize,
    /// A `Pending` event claim older than this is treated as abandoned and
    /// may be claimed again.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_select_timeout_ms")]
    pub select_timeout_ms: u64,
    #[serde(default = "default_pattern_lookup_timeout_ms")]
    pub pattern_lookup_timeout_ms: u64,
    /// Fixed RNG seed for reproducible selection; entropy when unset.
    #[serde(default)]
    pub rng_seed: Option<u64>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_decision_log_capacity")]
    pub decision_log_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_parked_capacity")]
    pub parked_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternConfig {
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// Active pattern count at which the coarse quantizer is first trained.
    #[serde(default = "default_train_threshold")]
    pub train_threshold: usize,
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,
    #[serde(default = "default_kmeans_iterations")]
    pub kmeans_iterations: usize,
    /// Total pseudo-counts of an informed prior.
    #[serde(default = "default_prior_strength")]
    pub prior_strength: f64,
    /// Closest pattern must be at least this similar to seed a prior.
    #[serde(default = "default_min_prior_similarity")]
    pub min_prior_similarity: f64,
    #[serde(default)]
    pub snapshot_path: Option<String>,
}

/// Per-campaign thresholds and windows. Every field has a documented default
/// so campaigns may override any subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignPolicy {
    /// Hours after creation during which an arm cannot be killed.
    #[serde(default = "default_ignorance_window_hours")]
    pub ignorance_window_hours: i64,
    #[serde(default = "default_min_sample_threshold")]
    pub min_sample_threshold: u64,
    /// Posterior mean above which a sampled-enough arm is exploited.
    #[serde(default = "default_scale_threshold")]
    pub scale_threshold: f64,
    /// Posterior mean below which an unprotected arm is killed.
    #[serde(default = "default_kill_threshold")]
    pub kill_threshold: f64,
    #[serde(default = "default_fatigue_window_days")]
    pub fatigue_window_days: u32,
    #[serde(default = "default_fatigue_floor")]
    pub fatigue_floor: f64,
    #[serde(default = "default_fatigue_sensitivity")]
    pub fatigue_sensitivity: f64,
    /// Trailing days an exploiting arm must beat the scale threshold on
    /// every day before the sweep promotes it to SCALED.
    #[serde(default = "default_scale_window_days")]
    pub scale_window_days: u32,
    /// ROAS that maps to a full reward of 1.0.
    #[serde(default = "default_roas_ceiling")]
    pub roas_ceiling: f64,
    /// Skip patterns learned from the same campaign when seeding priors.
    #[serde(default = "default_exclude_own_campaign")]
    pub exclude_own_campaign: bool,
    /// Restrict prior lookups to patterns from this industry.
    #[serde(default)]
    pub prior_industry_filter: bool,
}

/// Ten years.
pub const MAX_IGNORANCE_WINDOW_HOURS: i64 = 24 * 3650;

pub const MAX_WINDOW_DAYS: u32 = 365;

impl CampaignPolicy {
    pub fn ignorance_window(&self) -> Duration {
        Duration::try_hours(self.ignorance_window_hours).unwrap_or(Duration::MAX)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0..=MAX_IGNORANCE_WINDOW_HOURS).contains(&self.ignorance_window_hours) {
            return Err(format!(
                "ignorance_window_hours must be within [0, {MAX_IGNORANCE_WINDOW_HOURS}]"
            ));
        }
        for (name, value) in [
            ("scale_threshold", self.scale_threshold),
            ("kill_threshold", self.kill_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{name} must be within [0, 1]"));
            }
        }
        if self.kill_threshold >= self.scale_threshold {
            return Err("kill_threshold must be below scale_threshold".to_string());
        }
        if !(self.fatigue_floor > 0.0 && self.fatigue_floor <= 1.0) {
            return Err("fatigue_floor must be within (0, 1]".to_string());
        }
        for (name, days) in [
            ("fatigue_window_days", self.fatigue_window_days),
            ("scale_window_days", self.scale_window_days),
        ] {
            if !(1..=MAX_WINDOW_DAYS).contains(&days) {
                return Err(format!("{name} must be within [1, {MAX_WINDOW_DAYS}]"));
            }
        }
        if !(self.roas_ceiling > 0.0 && self.roas_ceiling.is_finite()) {
            return Err("roas_ceiling must be positive".to_string());
        }
        Ok(())
    }
}

// Default functions
fn default_node_id() -> String {
    "adpilot-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_key_prefix() -> String {
    "adpilot".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_cas_max_attempts() -> u32 {
    16
}
fn default_snapshot_ttl_secs() -> u64 {
    30
}
fn default_snapshot_max_entries() -> usize {
    1_000_000
}
fn default_claim_lease_secs() -> u64 {
    30
}
fn default_select_timeout_ms() -> u64 {
    200
}
fn default_pattern_lookup_timeout_ms() -> u64 {
    50
}
fn default_sweep_interval_secs() -> u64 {
    86_400
}
fn default_decision_log_capacity() -> usize {
    100_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    5_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_parked_capacity() -> usize {
    10_000
}
fn default_dimension() -> usize {
    128
}
fn default_train_threshold() -> usize {
    1024
}
fn default_nprobe() -> usize {
    8
}
fn default_kmeans_iterations() -> usize {
    10
}
fn default_prior_strength() -> f64 {
    10.0
}
fn default_min_prior_similarity() -> f64 {
    0.5
}

fn default_ignorance_window_hours() -> i64 { 48 }
fn default_min_sample_threshold() -> u64 { 50 }
fn default_scale_threshold() -> f64 { 0.6 }
fn default_kill_threshold() -> f64 { 0.25 }
fn default_fatigue_window_days() -> u32 { 3 }
fn default_fatigue_floor() -> f64 { 0.5 }
fn default_fatigue_sensitivity() -> f64 { 1.0 }
fn default_scale_window_days() -> u32 { 3 }
fn default_roas_ceiling() -> f64 { 4.0 }
fn default_exclude_own_campaign() -> bool { true }

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
            cas_max_attempts: default_cas_max_attempts(),
            snapshot_ttl_secs: default_snapshot_ttl_secs(),
            snapshot_max_entries: default_snapshot_max_entries(),
            claim_lease_secs: default_claim_lease_secs(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            select_timeout_ms: default_select_timeout_ms(),
            pattern_lookup_timeout_ms: default_pattern_lookup_timeout_ms(),
            rng_seed: None,
            sweep_interval_secs: default_sweep_interval_secs(),
            decision_log_capacity: default_decision_log_capacity(),
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            parked_capacity: default_parked_capacity(),
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            train_threshold: default_train_threshold(),
            nprobe: default_nprobe(),
            kmeans_iterations: default_kmeans_iterations(),
            prior_strength: default_prior_strength(),
            min_prior_similarity: default_min_prior_similarity(),
            snapshot_path: None,
        }
    }
}

impl Default for CampaignPolicy {
    fn default() -> Self {
        Self {
            ignorance_window_hours: default_ignorance_window_hours(),
            min_sample_threshold: default_min_sample_threshold(),
            scale_threshold: default_scale_threshold(),
            kill_threshold: default_kill_threshold(),
            fatigue_window_days: default_fatigue_window_days(),
            fatigue_floor: default_fatigue_floor(),
            fatigue_sensitivity: default_fatigue_sensitivity(),
            scale_window_days: default_scale_window_days(),
            roas_ceiling: default_roas_ceiling(),
            exclude_own_campaign: default_exclude_own_campaign(),
            prior_industry_filter: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            store: StoreConfig::default(),
            engine: EngineConfig::default(),
            feedback: FeedbackConfig::default(),
            patterns: PatternConfig::default(),
            defaults: CampaignPolicy::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional config file and environment
    /// variables (environment wins).
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/adpilot").required(false))
            .add_source(
                config::Environment::with_prefix("ADPILOT")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            );

        let config: Self = builder.build()?.try_deserialize()?;
        config
            .defaults
            .validate()
            .map_err(config::ConfigError::Message)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.engine.select_timeout_ms, 200);
        assert_eq!(config.engine.pattern_lookup_timeout_ms, 50);
        assert_eq!(config.feedback.max_retries, 3);
        assert_eq!(config.store.backend, StoreBackend::Memory);

        let policy = &config.defaults;
        assert_eq!(policy.ignorance_window(), Duration::days(2));
        assert_eq!(policy.min_sample_threshold, 50);
        assert_eq!(policy.fatigue_floor, 0.5);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_partial_policy_override() {
        let policy: CampaignPolicy =
            serde_json::from_str(r#"{"kill_threshold": 0.1, "ignorance_window_hours": 24}"#)
                .unwrap();
        assert_eq!(policy.kill_threshold, 0.1);
        assert_eq!(policy.ignorance_window(), Duration::hours(24));
        assert_eq!(policy.scale_threshold, 0.6);
    }

    #[test]
    fn test_policy_validation() {
        let policy = CampaignPolicy {
            kill_threshold: 0.7,
            ..CampaignPolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = CampaignPolicy {
            fatigue_floor: 0.0,
            ..CampaignPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_policy_rejects_oversized_windows() {
        let policy = CampaignPolicy {
            fatigue_window_days: u32::MAX,
            ..CampaignPolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = CampaignPolicy {
            scale_window_days: MAX_WINDOW_DAYS + 1,
            ..CampaignPolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = CampaignPolicy {
            ignorance_window_hours: 10_000_000_000,
            ..CampaignPolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = CampaignPolicy {
            ignorance_window_hours: MAX_IGNORANCE_WINDOW_HOURS,
            fatigue_window_days: MAX_WINDOW_DAYS,
            scale_window_days: MAX_WINDOW_DAYS,
            ..CampaignPolicy::default()
        };
        assert!(policy.validate().is_ok());
    }
}
