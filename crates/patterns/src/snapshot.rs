//! JSON persistence of the pattern library so a restart does not lose what
//! the fleet has learned.

use crate::index::PatternIndex;
use adpilot_core::error::{EngineError, EngineResult};
use adpilot_core::types::Pattern;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    dimension: usize,
    saved_at: DateTime<Utc>,
    entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    pattern: Pattern,
    #[serde(default)]
    superseded: bool,
}

/// Write every stored pattern, superseded ones included. The file is
/// written beside the target and renamed into place.
pub fn save(index: &PatternIndex, path: &Path, now: DateTime<Utc>) -> EngineResult<usize> {
    let file = SnapshotFile {
        dimension: index.dimension(),
        saved_at: now,
        entries: index
            .entries()
            .into_iter()
            .map(|(pattern, superseded)| SnapshotEntry { pattern, superseded })
            .collect(),
    };
    let count = file.entries.len();
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec(&file)?)?;
    std::fs::rename(&tmp, path)?;
    info!(path = %path.display(), patterns = count, "Pattern snapshot saved");
    Ok(count)
}

/// Replace the index contents with a saved snapshot. Returns the number of
/// active patterns loaded.
pub fn load(index: &PatternIndex, path: &Path) -> EngineResult<usize> {
    let bytes = std::fs::read(path)?;
    let file: SnapshotFile = serde_json::from_slice(&bytes)?;
    if file.dimension != index.dimension() {
        return Err(EngineError::DimensionMismatch {
            expected: index.dimension(),
            got: file.dimension,
        });
    }
    let active = index.replace_snapshot(
        file.entries
            .into_iter()
            .map(|e| (e.pattern, e.superseded))
            .collect(),
    )?;
    info!(path = %path.display(), active, saved_at = %file.saved_at, "Pattern snapshot loaded");
    Ok(active)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexConfig, SearchFilter};
    use adpilot_core::types::{ArmId, CampaignId, PatternId, PerformanceTier};

    fn index(dimension: usize) -> PatternIndex {
        PatternIndex::new(IndexConfig {
            dimension,
            train_threshold: 1_000,
            nprobe: 4,
            kmeans_iterations: 5,
        })
    }

    fn pattern(arm: &str, embedding: Vec<f32>) -> Pattern {
        Pattern {
            pattern_id: PatternId::new(),
            embedding,
            source_arm_id: ArmId::new(arm),
            source_campaign_id: CampaignId::new("c1"),
            performance_tier: PerformanceTier::Winner,
            industry: Some("travel".into()),
            posterior_mean: 0.8,
            trials: 300,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_restart_keeps_library() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.json");

        let original = index(2);
        original.add(pattern("c1:a", vec![1.0, 0.0])).unwrap();
        let gone = original.add(pattern("c1:b", vec![0.0, 1.0])).unwrap();
        original.supersede(gone).unwrap();
        assert_eq!(save(&original, &path, Utc::now()).unwrap(), 2);

        let restored = index(2);
        assert_eq!(load(&restored, &path).unwrap(), 1);
        assert!(restored.get(gone).is_some());
        let hits = restored.search(&[0.0, 1.0], 5, &SearchFilter::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pattern.source_arm_id.as_str(), "c1:a");
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.json");
        let small = index(2);
        small.add(pattern("c1:a", vec![1.0, 0.0])).unwrap();
        save(&small, &path, Utc::now()).unwrap();

        let wide = index(3);
        assert!(matches!(
            load(&wide, &path),
            Err(EngineError::DimensionMismatch { expected: 3, got: 2 })
        ));
    }
}
