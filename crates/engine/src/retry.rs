//! Retry policy for feedback application and the parking lot for events
//! that kept failing.

use adpilot_core::config::FeedbackConfig;
use adpilot_core::types::FeedbackEvent;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&FeedbackConfig::default())
    }
}

impl From<&FeedbackConfig> for RetryPolicy {
    fn from(c: &FeedbackConfig) -> Self {
        Self {
            max_retries: c.max_retries,
            initial_backoff_ms: c.initial_backoff_ms,
            max_backoff_ms: c.max_backoff_ms,
            backoff_multiplier: c.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(base_ms.min(self.max_backoff_ms as f64) as u64)
    }
}

/// An event that exhausted its retries, held for manual replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParkedEvent {
    pub event: FeedbackEvent,
    pub error: String,
    pub attempts: u32,
    pub parked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParkedMetrics {
    pub depth: usize,
    pub total_parked: u64,
    pub total_replayed: u64,
    /// Events turned away because the lot was full.
    pub total_refused: u64,
}

pub struct ParkedEvents {
    events: Mutex<VecDeque<ParkedEvent>>,
    capacity: usize,
    total_parked: AtomicU64,
    total_replayed: AtomicU64,
    total_refused: AtomicU64,
}

impl ParkedEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            total_parked: AtomicU64::new(0),
            total_replayed: AtomicU64::new(0),
            total_refused: AtomicU64::new(0),
        }
    }

    /// Park an event. A full lot keeps what it holds and refuses the new
    /// event, returning false; the caller still owns it.
    pub fn park(&self, parked: ParkedEvent) -> bool {
        let mut queue = self.events.lock();
        if queue.len() >= self.capacity {
            self.total_refused.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("feedback.park_refused").increment(1);
            warn!(
                event_id = %parked.event.event_id,
                capacity = self.capacity,
                "Parking lot full, event refused"
            );
            return false;
        }
        queue.push_back(parked);
        self.total_parked.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("feedback.parked_depth").set(queue.len() as f64);
        true
    }

    /// Take every parked event for replay.
    pub fn drain(&self) -> Vec<ParkedEvent> {
        let mut queue = self.events.lock();
        let drained: Vec<ParkedEvent> = queue.drain(..).collect();
        self.total_replayed
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        metrics::gauge!("feedback.parked_depth").set(0.0);
        drained
    }

    pub fn peek(&self, limit: usize) -> Vec<ParkedEvent> {
        self.events.lock().iter().take(limit).cloned().collect()
    }

    pub fn depth(&self) -> usize {
        self.events.lock().len()
    }

    pub fn metrics(&self) -> ParkedMetrics {
        ParkedMetrics {
            depth: self.depth(),
            total_parked: self.total_parked.load(Ordering::Relaxed),
            total_replayed: self.total_replayed.load(Ordering::Relaxed),
            total_refused: self.total_refused.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpilot_core::types::{ArmId, AttributionSource, EventId};

    fn parked(id: &str) -> ParkedEvent {
        ParkedEvent {
            event: FeedbackEvent {
                event_id: EventId::new(id),
                arm_id: ArmId::new("c1:a"),
                observed_at: Utc::now(),
                spend_delta: None,
                revenue_delta: None,
                pipeline_value_delta: None,
                clicks: None,
                conversions: None,
                source: AttributionSource::Probabilistic,
                no_data: false,
            },
            error: "arm not found".into(),
            attempts: 4,
            parked_at: Utc::now(),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 300,
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(300));
        assert_eq!(policy.backoff_for_attempt(40), Duration::from_millis(300));
    }

    #[test]
    fn test_full_lot_refuses_instead_of_evicting() {
        let lot = ParkedEvents::new(2);
        assert!(lot.park(parked("a")));
        assert!(lot.park(parked("b")));
        assert!(!lot.park(parked("c")));

        let ids: Vec<String> = lot.peek(10).iter().map(|p| p.event.event_id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        let m = lot.metrics();
        assert_eq!(m.total_parked, 2);
        assert_eq!(m.total_refused, 1);

        lot.drain();
        assert!(lot.park(parked("c")));
    }

    #[test]
    fn test_drain_empties_queue() {
        let lot = ParkedEvents::new(10);
        lot.park(parked("a"));
        assert_eq!(lot.drain().len(), 1);
        assert_eq!(lot.depth(), 0);
        assert_eq!(lot.metrics().total_replayed, 1);
    }
}
