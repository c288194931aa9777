#![warn(clippy::unwrap_used)]

//! Store of record for arm state and the feedback event log, plus the
//! in-process snapshot cache that serves `select` reads.

pub mod arm_store;
pub mod event_log;
pub mod memory;
pub mod redis_store;
pub mod snapshot;

pub use arm_store::{modify_arm, ArmStore, Mutation};
pub use event_log::{Claim, EventLog, EventRecord, EventStatus};
pub use memory::{MemoryArmStore, MemoryEventLog};
pub use redis_store::{RedisArmStore, RedisEventLog};
pub use snapshot::SnapshotCache;

use adpilot_core::config::{StoreBackend, StoreConfig};
use std::sync::Arc;
use tracing::info;

/// Open the configured backend.
pub async fn open_stores(
    config: &StoreConfig,
) -> anyhow::Result<(Arc<dyn ArmStore>, Arc<dyn EventLog>)> {
    match config.backend {
        StoreBackend::Memory => {
            info!("Using in-memory arm store (single instance only)");
            let lease = i64::try_from(config.claim_lease_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX);
            Ok((
                Arc::new(MemoryArmStore::new()),
                Arc::new(MemoryEventLog::new().with_claim_lease(lease)),
            ))
        }
        StoreBackend::Redis => {
            let conn = redis_store::connect(config).await?;
            Ok((
                Arc::new(RedisArmStore::new(conn.clone(), &config.key_prefix)),
                Arc::new(
                    RedisEventLog::new(conn, &config.key_prefix)
                        .with_claim_lease(std::time::Duration::from_secs(config.claim_lease_secs)),
                ),
            ))
        }
    }
}
