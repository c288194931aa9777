#![warn(clippy::unwrap_used)]

//! Turns attribution events into bounded rewards and applies them to arms
//! exactly once per `event_id`.

pub mod bridge;
pub mod normalize;

pub use bridge::{IngestOutcome, RewardBridge};
pub use normalize::{normalize, Normalized, NEUTRAL_REWARD};
