//! Decision audit log: append-only, tamper-evident via SHA-256 hash chaining.
//! The in-memory window is bounded; verification starts from the oldest
//! retained record's link.

use adpilot_core::types::{AllocationDecision, CampaignId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use tracing::debug;

const GENESIS: &str = "genesis";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub sequence: u64,
    pub decision: AllocationDecision,
    pub previous_hash: String,
    pub record_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainVerification {
    pub total: usize,
    pub valid: usize,
    pub tampered: Vec<u64>,
    pub intact: bool,
}

struct Inner {
    records: VecDeque<DecisionRecord>,
    sequence: u64,
    last_hash: String,
}

pub struct DecisionAuditLog {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl DecisionAuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: VecDeque::new(),
                sequence: 0,
                last_hash: GENESIS.to_string(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn append(&self, decision: AllocationDecision) -> DecisionRecord {
        let mut inner = self.inner.lock();
        inner.sequence += 1;
        let sequence = inner.sequence;
        let previous_hash = inner.last_hash.clone();
        let record_hash = record_hash(sequence, &decision, &previous_hash);

        let record = DecisionRecord {
            sequence,
            decision,
            previous_hash,
            record_hash: record_hash.clone(),
        };
        inner.last_hash = record_hash;
        if inner.records.len() >= self.capacity {
            inner.records.pop_front();
        }
        inner.records.push_back(record.clone());
        debug!(
            sequence,
            decision_id = %record.decision.decision_id,
            arm_id = %record.decision.arm_id,
            "Decision recorded (hash-chained)"
        );
        record
    }

    /// Most recent decisions for a campaign, newest first.
    pub fn for_campaign(&self, campaign_id: &CampaignId, limit: usize) -> Vec<DecisionRecord> {
        self.inner
            .lock()
            .records
            .iter()
            .rev()
            .filter(|r| r.decision.campaign_id == *campaign_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    pub fn verify_chain(&self) -> ChainVerification {
        let inner = self.inner.lock();
        let mut expected_prev = inner
            .records
            .front()
            .map(|r| r.previous_hash.clone())
            .unwrap_or_else(|| GENESIS.to_string());
        let mut valid = 0;
        let mut tampered = Vec::new();

        for record in &inner.records {
            let recomputed = record_hash(record.sequence, &record.decision, &record.previous_hash);
            if record.previous_hash == expected_prev && recomputed == record.record_hash {
                valid += 1;
            } else {
                tampered.push(record.sequence);
            }
            expected_prev = record.record_hash.clone();
        }

        ChainVerification {
            total: inner.records.len(),
            valid,
            intact: tampered.is_empty(),
            tampered,
        }
    }
}

fn record_hash(sequence: u64, d: &AllocationDecision, previous_hash: &str) -> String {
    let content = format!(
        "{}:{}:{}:{}:{:.6}:{}:{}:{}:{}",
        sequence,
        d.decision_id,
        d.campaign_id,
        d.arm_id,
        d.confidence,
        d.state,
        d.degraded,
        d.decided_at.to_rfc3339(),
        previous_hash,
    );
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpilot_core::types::{ArmId, ArmState, Mode};
    use chrono::Utc;
    use uuid::Uuid;

    fn decision(campaign: &str, arm: &str) -> AllocationDecision {
        AllocationDecision {
            decision_id: Uuid::new_v4(),
            campaign_id: CampaignId::new(campaign),
            arm_id: ArmId::new(arm),
            confidence: 0.5,
            mode: Mode::DirectRoas,
            state: ArmState::Learning,
            decided_at: Utc::now(),
            degraded: false,
        }
    }

    #[test]
    fn test_chain_links_records() {
        let log = DecisionAuditLog::new(10);
        let first = log.append(decision("c1", "c1:a"));
        let second = log.append(decision("c1", "c1:b"));
        assert_eq!(first.previous_hash, GENESIS);
        assert_eq!(second.previous_hash, first.record_hash);
        assert_eq!(first.record_hash.len(), 64);
        assert!(log.verify_chain().intact);
    }

    #[test]
    fn test_tampering_detected() {
        let log = DecisionAuditLog::new(10);
        for arm in ["c1:a", "c1:b", "c1:c"] {
            log.append(decision("c1", arm));
        }
        log.inner.lock().records[1].decision.arm_id = ArmId::new("c1:z");

        let v = log.verify_chain();
        assert!(!v.intact);
        assert_eq!(v.tampered, vec![2]);
        assert_eq!(v.valid, 2);
    }

    #[test]
    fn test_bounded_window_still_verifies() {
        let log = DecisionAuditLog::new(2);
        for arm in ["c1:a", "c1:b", "c1:c"] {
            log.append(decision("c1", arm));
        }
        assert_eq!(log.len(), 2);
        let v = log.verify_chain();
        assert!(v.intact);
        assert_eq!(v.total, 2);
    }

    #[test]
    fn test_for_campaign_newest_first() {
        let log = DecisionAuditLog::new(10);
        log.append(decision("c1", "c1:a"));
        log.append(decision("c2", "c2:a"));
        log.append(decision("c1", "c1:b"));

        let records = log.for_campaign(&CampaignId::new("c1"), 10);
        let arms: Vec<&str> = records.iter().map(|r| r.decision.arm_id.as_str()).collect();
        assert_eq!(arms, vec!["c1:b", "c1:a"]);
        assert_eq!(log.for_campaign(&CampaignId::new("c1"), 1).len(), 1);
    }
}
