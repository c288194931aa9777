//! Pattern index: unit-normalized embeddings searched by cosine similarity.
//!
//! Below `train_threshold` active patterns every search is an exact scan.
//! Past it, a coarse quantizer partitions entries into posting lists and a
//! search only visits the `nprobe` lists nearest the query. The quantizer is
//! retrained whenever the active set doubles.

use crate::quantizer::CoarseQuantizer;
use adpilot_core::config::PatternConfig;
use adpilot_core::error::{EngineError, EngineResult};
use adpilot_core::types::{Arm, ArmId, CampaignId, Pattern, PatternId, PerformanceTier};
use chrono::{DateTime, Utc};
use ndarray::Array1;
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub dimension: usize,
    pub train_threshold: usize,
    pub nprobe: usize,
    pub kmeans_iterations: usize,
}

impl From<&PatternConfig> for IndexConfig {
    fn from(c: &PatternConfig) -> Self {
        Self {
            dimension: c.dimension,
            train_threshold: c.train_threshold.max(1),
            nprobe: c.nprobe.max(1),
            kmeans_iterations: c.kmeans_iterations,
        }
    }
}

/// Restricts which patterns a search may return.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Skip patterns learned from this campaign.
    #[serde(default)]
    pub exclude_campaign: Option<CampaignId>,
    /// Only return patterns tagged with this industry.
    #[serde(default)]
    pub industry: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredPattern {
    pub pattern: Pattern,
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub count: usize,
    pub superseded: usize,
    /// Mean best-match similarity observed when patterns were inserted into
    /// a non-empty index. Drifting toward 1.0 means the library is saturating.
    pub avg_similarity_at_insert: f64,
    pub trained: bool,
    pub lists: usize,
}

pub(crate) struct Entry {
    pub(crate) pattern: Pattern,
    unit: Array1<f32>,
    pub(crate) superseded: bool,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    by_id: HashMap<PatternId, usize>,
    active_by_arm: HashMap<ArmId, usize>,
    active: usize,
    quantizer: Option<CoarseQuantizer>,
    trained_at: usize,
    similarity_sum: f64,
    similarity_samples: u64,
}

pub struct PatternIndex {
    config: IndexConfig,
    inner: RwLock<Inner>,
    available: AtomicBool,
}

impl PatternIndex {
    pub fn new(config: IndexConfig) -> Self {
        info!(
            dimension = config.dimension,
            train_threshold = config.train_threshold,
            nprobe = config.nprobe,
            "Pattern index initialized"
        );
        Self {
            config,
            inner: RwLock::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Toggle availability. While unavailable every read and write fails with
    /// `IndexUnavailable` and callers fall back to uninformed priors.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> EngineResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(EngineError::IndexUnavailable("pattern index is offline".into()))
        }
    }

    /// Validate and L2-normalize an embedding.
    pub fn normalize(&self, embedding: &[f32]) -> EngineResult<Array1<f32>> {
        if embedding.len() != self.config.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.config.dimension,
                got: embedding.len(),
            });
        }
        if embedding.iter().any(|x| !x.is_finite()) {
            return Err(EngineError::InvalidEmbedding("embedding contains non-finite values".into()));
        }
        let v = Array1::from(embedding.to_vec());
        let norm = v.dot(&v).sqrt();
        if norm == 0.0 {
            return Err(EngineError::InvalidEmbedding("embedding has zero norm".into()));
        }
        Ok(v / norm)
    }

    /// Insert a pattern. The stored embedding is unit length.
    pub fn add(&self, pattern: Pattern) -> EngineResult<PatternId> {
        self.batch()?.add(pattern)
    }

    /// Exclusive writer for loading several patterns at once. Searches block
    /// until the batch is dropped, so none of them sees a partial load.
    pub fn batch(&self) -> EngineResult<PatternBatch<'_>> {
        self.ensure_available()?;
        Ok(PatternBatch {
            index: self,
            inner: self.inner.write(),
        })
    }

    /// Mark a pattern superseded. It stays in storage for audit but is no
    /// longer returned by searches.
    pub fn supersede(&self, pattern_id: PatternId) -> EngineResult<()> {
        self.ensure_available()?;
        let mut inner = self.inner.write();
        inner.supersede(pattern_id)?;
        metrics::gauge!("patterns.active").set(inner.active as f64);
        Ok(())
    }

    /// Record a pattern for an arm that has reached EXPLOITING or SCALED.
    /// Returns the new pattern id, or None when the arm does not qualify or
    /// its current tier is already indexed. A tier change supersedes the
    /// arm's previous pattern.
    pub fn ingest_arm(
        &self,
        arm: &Arm,
        industry: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<PatternId>> {
        let Some(tier) = PerformanceTier::for_state(arm.state) else {
            return Ok(None);
        };
        let Some(embedding) = arm.embedding.as_ref() else {
            return Ok(None);
        };
        self.ensure_available()?;
        let unit = self.normalize(embedding)?;

        let mut inner = self.inner.write();
        let previous = inner.active_by_arm.get(&arm.arm_id).copied();
        if let Some(position) = previous {
            if inner.entries[position].pattern.performance_tier == tier {
                return Ok(None);
            }
        }

        let pattern = Pattern {
            pattern_id: PatternId::new(),
            embedding: unit.to_vec(),
            source_arm_id: arm.arm_id.clone(),
            source_campaign_id: arm.campaign_id.clone(),
            performance_tier: tier,
            industry: industry.map(str::to_string),
            posterior_mean: arm.posterior_mean(),
            trials: arm.total_trials,
            created_at: now,
        };
        let id = inner.swap_active(previous, pattern, unit, self.config.nprobe)?;
        self.maybe_train(&mut inner);

        metrics::counter!("patterns.added").increment(1);
        metrics::gauge!("patterns.active").set(inner.active as f64);
        info!(arm_id = %arm.arm_id, pattern_id = %id, tier = ?tier, "Pattern ingested");
        Ok(Some(id))
    }

    /// Up to `k` active patterns by descending cosine similarity. Ties go to
    /// the newer pattern, then the lower pattern id.
    pub fn search(&self, query: &[f32], k: usize, filter: &SearchFilter) -> EngineResult<Vec<ScoredPattern>> {
        self.ensure_available()?;
        let unit = self.normalize(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let inner = self.inner.read();
        let mut scored: Vec<(usize, f64)> = inner
            .candidates(&unit, self.config.nprobe)
            .into_iter()
            .filter(|&i| matches_filter(&inner.entries[i].pattern, filter))
            .map(|i| (i, f64::from(inner.entries[i].unit.dot(&unit))))
            .collect();

        scored.sort_by(|(a, sa), (b, sb)| {
            let pa = &inner.entries[*a].pattern;
            let pb = &inner.entries[*b].pattern;
            sb.total_cmp(sa)
                .then(pb.created_at.cmp(&pa.created_at))
                .then(pa.pattern_id.cmp(&pb.pattern_id))
        });
        scored.truncate(k);

        metrics::counter!("patterns.searches").increment(1);
        Ok(scored
            .into_iter()
            .map(|(i, similarity)| ScoredPattern {
                pattern: inner.entries[i].pattern.clone(),
                similarity,
            })
            .collect())
    }

    /// Any stored pattern, superseded or not.
    pub fn get(&self, pattern_id: PatternId) -> Option<Pattern> {
        let inner = self.inner.read();
        inner
            .by_id
            .get(&pattern_id)
            .map(|&i| inner.entries[i].pattern.clone())
    }

    pub fn stats(&self) -> IndexStats {
        let inner = self.inner.read();
        IndexStats {
            count: inner.active,
            superseded: inner.entries.len() - inner.active,
            avg_similarity_at_insert: if inner.similarity_samples == 0 {
                0.0
            } else {
                inner.similarity_sum / inner.similarity_samples as f64
            },
            trained: inner.quantizer.is_some(),
            lists: inner.quantizer.as_ref().map_or(0, CoarseQuantizer::nlist),
        }
    }

    /// Every stored pattern with its superseded flag, in insertion order.
    pub fn entries(&self) -> Vec<(Pattern, bool)> {
        self.inner
            .read()
            .entries
            .iter()
            .map(|e| (e.pattern.clone(), e.superseded))
            .collect()
    }

    /// Atomically swap the whole contents. Validation happens before the
    /// swap, so a bad snapshot leaves the current index untouched.
    pub fn replace_snapshot(&self, snapshot: Vec<(Pattern, bool)>) -> EngineResult<usize> {
        let mut fresh = Inner::default();
        for (mut pattern, superseded) in snapshot {
            let unit = self.normalize(&pattern.embedding)?;
            pattern.embedding = unit.to_vec();
            let position = fresh.entries.len();
            if fresh.by_id.insert(pattern.pattern_id, position).is_some() {
                return Err(EngineError::Validation(format!(
                    "duplicate pattern {} in snapshot",
                    pattern.pattern_id
                )));
            }
            if !superseded {
                fresh.active += 1;
                fresh
                    .active_by_arm
                    .insert(pattern.source_arm_id.clone(), position);
            }
            fresh.entries.push(Entry {
                pattern,
                unit,
                superseded,
            });
        }
        self.maybe_train(&mut fresh);

        let active = fresh.active;
        *self.inner.write() = fresh;
        metrics::gauge!("patterns.active").set(active as f64);
        info!(active, "Pattern index snapshot replaced");
        Ok(active)
    }

    fn maybe_train(&self, inner: &mut Inner) {
        let due = match inner.quantizer {
            None => inner.active >= self.config.train_threshold,
            Some(_) => inner.active >= inner.trained_at.saturating_mul(2),
        };
        if !due {
            return;
        }

        let (ids, vectors): (Vec<usize>, Vec<&Array1<f32>>) = inner
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.superseded)
            .map(|(i, e)| (i, &e.unit))
            .unzip();
        let nlist = ((vectors.len() as f64).sqrt() as usize).max(1);
        let quantizer = CoarseQuantizer::train(&vectors, &ids, nlist, self.config.kmeans_iterations);
        debug!(active = inner.active, lists = quantizer.nlist(), "Coarse quantizer trained");
        inner.quantizer = Some(quantizer);
        inner.trained_at = inner.active;
    }
}

pub struct PatternBatch<'a> {
    index: &'a PatternIndex,
    inner: RwLockWriteGuard<'a, Inner>,
}

impl PatternBatch<'_> {
    pub fn add(&mut self, mut pattern: Pattern) -> EngineResult<PatternId> {
        let unit = self.index.normalize(&pattern.embedding)?;
        pattern.embedding = unit.to_vec();

        let pattern_id = self.inner.insert(pattern, unit, self.index.config.nprobe)?;
        self.index.maybe_train(&mut self.inner);

        metrics::counter!("patterns.added").increment(1);
        metrics::gauge!("patterns.active").set(self.inner.active as f64);
        Ok(pattern_id)
    }
}

impl Inner {
    /// Entry positions worth scoring: probed lists once trained, otherwise
    /// everything. Superseded entries are dropped here.
    fn candidates(&self, unit: &Array1<f32>, nprobe: usize) -> Vec<usize> {
        let raw: Vec<usize> = match &self.quantizer {
            Some(q) => q.probe(unit, nprobe),
            None => (0..self.entries.len()).collect(),
        };
        raw.into_iter()
            .filter(|&i| !self.entries[i].superseded)
            .collect()
    }

    fn supersede(&mut self, pattern_id: PatternId) -> EngineResult<()> {
        let position = *self
            .by_id
            .get(&pattern_id)
            .ok_or_else(|| EngineError::Validation(format!("unknown pattern {pattern_id}")))?;
        let entry = &mut self.entries[position];
        if entry.superseded {
            return Ok(());
        }
        entry.superseded = true;
        let arm_id = entry.pattern.source_arm_id.clone();
        if self.active_by_arm.get(&arm_id) == Some(&position) {
            self.active_by_arm.remove(&arm_id);
        }
        self.active -= 1;
        Ok(())
    }

    fn insert(&mut self, pattern: Pattern, unit: Array1<f32>, nprobe: usize) -> EngineResult<PatternId> {
        let pattern_id = pattern.pattern_id;
        if self.by_id.contains_key(&pattern_id) {
            return Err(EngineError::Validation(format!("pattern {pattern_id} already indexed")));
        }

        if self.active > 0 {
            let best = self
                .candidates(&unit, nprobe)
                .into_iter()
                .map(|i| f64::from(self.entries[i].unit.dot(&unit)))
                .fold(f64::NEG_INFINITY, f64::max);
            if best.is_finite() {
                self.similarity_sum += best;
                self.similarity_samples += 1;
            }
        }

        let position = self.entries.len();
        if let Some(q) = self.quantizer.as_mut() {
            q.assign(&unit, position);
        }
        self.by_id.insert(pattern_id, position);
        self.active_by_arm
            .insert(pattern.source_arm_id.clone(), position);
        self.entries.push(Entry {
            pattern,
            unit,
            superseded: false,
        });
        self.active += 1;
        Ok(pattern_id)
    }

    /// Supersede the entry at `previous` and insert `pattern` in its place.
    /// If the insert fails the previous entry is active again.
    fn swap_active(
        &mut self,
        previous: Option<usize>,
        pattern: Pattern,
        unit: Array1<f32>,
        nprobe: usize,
    ) -> EngineResult<PatternId> {
        if let Some(position) = previous {
            let old = self.entries[position].pattern.pattern_id;
            self.supersede(old)?;
        }
        match self.insert(pattern, unit, nprobe) {
            Ok(id) => Ok(id),
            Err(e) => {
                if let Some(position) = previous {
                    self.reactivate(position);
                }
                Err(e)
            }
        }
    }

    fn reactivate(&mut self, position: usize) {
        let entry = &mut self.entries[position];
        if !entry.superseded {
            return;
        }
        entry.superseded = false;
        let arm_id = entry.pattern.source_arm_id.clone();
        self.active_by_arm.insert(arm_id, position);
        self.active += 1;
    }
}

fn matches_filter(pattern: &Pattern, filter: &SearchFilter) -> bool {
    if filter
        .exclude_campaign
        .as_ref()
        .is_some_and(|c| *c == pattern.source_campaign_id)
    {
        return false;
    }
    match &filter.industry {
        Some(industry) => pattern.industry.as_deref() == Some(industry.as_str()),
        None => true,
    }
}
