//! In-process arm snapshot cache backed by DashMap for lock-free concurrent
//! access. Serves `select` reads and the timeout fallback only; updates
//! always read-modify-write against the store of record.

use adpilot_core::types::{Arm, ArmId};
use dashmap::DashMap;
use std::time::{Duration, Instant};

struct CacheEntry {
    arm: Arm,
    inserted_at: Instant,
}

pub struct SnapshotCache {
    store: DashMap<ArmId, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl SnapshotCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            store: DashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// Fresh snapshot, or None if expired or missing. Expired entries stay
    /// available to `get_stale` until `evict_expired` runs.
    pub fn get(&self, arm_id: &ArmId) -> Option<Arm> {
        let entry = self.store.get(arm_id)?;
        if entry.inserted_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.arm.clone())
    }

    /// Last known snapshot regardless of age. Used when the store cannot be
    /// reached in time and a stale answer beats no answer.
    pub fn get_stale(&self, arm_id: &ArmId) -> Option<Arm> {
        self.store.get(arm_id).map(|e| e.arm.clone())
    }

    /// Insert a snapshot unless an equal or newer version is cached.
    pub fn put(&self, arm: Arm) {
        if self.store.len() >= self.max_entries && !self.store.contains_key(&arm.arm_id) {
            return;
        }
        if let Some(existing) = self.store.get(&arm.arm_id) {
            if existing.arm.version > arm.version {
                return;
            }
        }
        self.store.insert(
            arm.arm_id.clone(),
            CacheEntry {
                arm,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, arm_id: &ArmId) {
        self.store.remove(arm_id);
    }

    /// Remove expired entries. Call this periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        self.store
            .retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpilot_core::types::{CampaignId, Mode};
    use chrono::Utc;

    fn arm(creative: &str, version: u64) -> Arm {
        let mut arm = Arm::new(CampaignId::new("c1"), creative, Mode::DirectRoas, Utc::now());
        arm.version = version;
        arm
    }

    #[test]
    fn test_older_version_does_not_replace_newer() {
        let cache = SnapshotCache::new(Duration::from_secs(60), 10);
        cache.put(arm("a", 5));
        cache.put(arm("a", 3));
        assert_eq!(cache.get(&ArmId::new("c1:a")).unwrap().version, 5);
    }

    #[test]
    fn test_expired_entries_are_stale_only() {
        let cache = SnapshotCache::new(Duration::ZERO, 10);
        cache.put(arm("a", 1));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get_stale(&ArmId::new("c1:a")).is_some());
        assert!(cache.get(&ArmId::new("c1:a")).is_none());
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_bound() {
        let cache = SnapshotCache::new(Duration::from_secs(60), 1);
        cache.put(arm("a", 1));
        cache.put(arm("b", 1));
        assert_eq!(cache.len(), 1);
        cache.put(arm("a", 2));
        assert_eq!(cache.get(&ArmId::new("c1:a")).unwrap().version, 2);
        assert_eq!(cache.evict_expired(), 0);
    }
}
