#![warn(clippy::unwrap_used)]

pub mod campaign;
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use campaign::{CampaignConfig, CampaignRegistry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, CampaignPolicy};
pub use error::{EngineError, EngineResult};
