//! Registry of campaigns known to the engine: their reward mode, industry,
//! and per-campaign policy overrides.

use crate::config::CampaignPolicy;
use crate::error::{EngineError, EngineResult};
use crate::types::{CampaignId, Mode};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub campaign_id: CampaignId,
    pub mode: Mode,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub policy: CampaignPolicy,
}

pub struct CampaignRegistry {
    campaigns: DashMap<CampaignId, CampaignConfig>,
    defaults: CampaignPolicy,
}

impl CampaignRegistry {
    pub fn new(defaults: CampaignPolicy) -> Self {
        Self {
            campaigns: DashMap::new(),
            defaults,
        }
    }

    /// Register or replace a campaign. The mode of an already registered
    /// campaign cannot change, since its arms carry the mode they were
    /// created with.
    pub fn register(&self, config: CampaignConfig) -> EngineResult<()> {
        config.policy.validate().map_err(EngineError::Validation)?;
        if let Some(existing) = self.campaigns.get(&config.campaign_id) {
            if existing.mode != config.mode {
                return Err(EngineError::InvalidMode {
                    campaign_id: config.campaign_id.clone(),
                    expected: existing.mode,
                    got: config.mode,
                });
            }
        }
        info!(
            campaign_id = %config.campaign_id,
            mode = %config.mode,
            industry = ?config.industry,
            "registering campaign"
        );
        self.campaigns.insert(config.campaign_id.clone(), config);
        Ok(())
    }

    pub fn get(&self, campaign_id: &CampaignId) -> Option<CampaignConfig> {
        self.campaigns.get(campaign_id).map(|c| c.clone())
    }

    pub fn require(&self, campaign_id: &CampaignId) -> EngineResult<CampaignConfig> {
        self.get(campaign_id)
            .ok_or_else(|| EngineError::UnknownCampaign(campaign_id.clone()))
    }

    /// Policy for a campaign, or the global defaults for campaigns this
    /// instance has not seen (arms outlive registrations on other nodes).
    pub fn policy(&self, campaign_id: &CampaignId) -> CampaignPolicy {
        self.campaigns
            .get(campaign_id)
            .map(|c| c.policy.clone())
            .unwrap_or_else(|| self.defaults.clone())
    }

    pub fn defaults(&self) -> &CampaignPolicy {
        &self.defaults
    }

    pub fn campaign_ids(&self) -> Vec<CampaignId> {
        self.campaigns.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.campaigns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.campaigns.is_empty()
    }
}

impl Default for CampaignRegistry {
    fn default() -> Self {
        Self::new(CampaignPolicy::default())
    }
}
