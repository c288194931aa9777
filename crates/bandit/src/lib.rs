#![warn(clippy::unwrap_used)]

//! Thompson-sampling allocator over the arm store, the per-arm lifecycle
//! state machine, and the fatigue estimator that discounts decaying arms.

pub mod allocator;
pub mod fatigue;
pub mod lifecycle;

pub use allocator::{BanditAllocator, UpdateOutcome};
pub use fatigue::{FatigueEstimator, FatigueReading};
