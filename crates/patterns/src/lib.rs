#![warn(clippy::unwrap_used)]

//! Approximate nearest-neighbor index of creative embeddings learned from
//! proven arms. Queried for cold-start priors and pattern reuse.

pub mod index;
pub mod quantizer;
pub mod snapshot;

pub use index::{IndexConfig, IndexStats, PatternBatch, PatternIndex, ScoredPattern, SearchFilter};
pub use snapshot::{load as load_snapshot, save as save_snapshot};
