//! Redis backends. Arms live in a hash (`version`, `body`) so the CAS script
//! can compare versions without decoding the JSON body; event records are
//! JSON strings claimed through a script so the check-and-set is atomic.

use crate::arm_store::ArmStore;
use crate::event_log::{Claim, EventLog, EventRecord, EventStatus};
use adpilot_core::config::StoreConfig;
use adpilot_core::error::{EngineError, EngineResult};
use adpilot_core::types::{Arm, ArmId, CampaignId, EventId, FeedbackEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::info;

const INSERT_IF_ABSENT: &str = r#"
local body = redis.call('HGET', KEYS[1], 'body')
if body then
  return body
end
redis.call('HSET', KEYS[1], 'version', ARGV[1], 'body', ARGV[2])
redis.call('SADD', KEYS[2], ARGV[3])
return ARGV[2]
"#;

const COMPARE_AND_SWAP: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then
  return -1
end
if current ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'version', ARGV[2], 'body', ARGV[3])
return 1
"#;

const CLAIM_EVENT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  redis.call('SET', KEYS[1], ARGV[1])
  redis.call('SET', KEYS[2], '1', 'PX', ARGV[3])
  return {'acquired', '1'}
end
local record = cjson.decode(current)
local abandoned = record.status == 'pending' and redis.call('EXISTS', KEYS[2]) == 0
if record.status == 'failed' or abandoned then
  record.status = 'pending'
  record.attempts = record.attempts + 1
  record.updated_at = ARGV[2]
  redis.call('SET', KEYS[1], cjson.encode(record))
  redis.call('SET', KEYS[2], '1', 'PX', ARGV[3])
  return {'acquired', tostring(record.attempts)}
end
return {'duplicate', record.status}
"#;

fn store_err(e: redis::RedisError) -> EngineError {
    EngineError::Store(e.to_string())
}

/// Connect and verify the server answers before handing out stores.
pub async fn connect(config: &StoreConfig) -> anyhow::Result<ConnectionManager> {
    info!(url = %config.redis_url, "Connecting to Redis");
    let client = redis::Client::open(config.redis_url.as_str())?;
    let timeout = Duration::from_millis(config.connect_timeout_ms);
    let mut conn = tokio::time::timeout(timeout, ConnectionManager::new(client)).await??;
    let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
    info!(response = %pong, "Redis connection established");
    Ok(conn)
}

pub struct RedisArmStore {
    conn: ConnectionManager,
    prefix: String,
    insert_script: Script,
    cas_script: Script,
}

impl RedisArmStore {
    pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            insert_script: Script::new(INSERT_IF_ABSENT),
            cas_script: Script::new(COMPARE_AND_SWAP),
        }
    }

    fn arm_key(&self, arm_id: &ArmId) -> String {
        format!("{}:arm:{}", self.prefix, arm_id)
    }

    fn campaign_key(&self, campaign_id: &CampaignId) -> String {
        format!("{}:campaign:{}:arms", self.prefix, campaign_id)
    }
}

#[async_trait]
impl ArmStore for RedisArmStore {
    async fn get(&self, arm_id: &ArmId) -> EngineResult<Option<Arm>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn
            .hget(self.arm_key(arm_id), "body")
            .await
            .map_err(store_err)?;
        match body {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn insert_if_absent(&self, arm: Arm) -> EngineResult<Arm> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(&arm)?;
        let stored: String = self
            .insert_script
            .key(self.arm_key(&arm.arm_id))
            .key(self.campaign_key(&arm.campaign_id))
            .arg(arm.version)
            .arg(body)
            .arg(arm.arm_id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(serde_json::from_str(&stored)?)
    }

    async fn compare_and_swap(&self, expected_version: u64, arm: &Arm) -> EngineResult<bool> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(arm)?;
        let outcome: i64 = self
            .cas_script
            .key(self.arm_key(&arm.arm_id))
            .arg(expected_version)
            .arg(arm.version)
            .arg(body)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        match outcome {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(EngineError::ArmNotFound(arm.arm_id.clone())),
        }
    }

    async fn list_campaign(&self, campaign_id: &CampaignId) -> EngineResult<Vec<Arm>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(self.campaign_key(campaign_id))
            .await
            .map_err(store_err)?;

        let mut arms = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(arm) = self.get(&ArmId::new(id)).await? {
                arms.push(arm);
            }
        }
        Ok(arms)
    }
}

/// Event records plus a per-event lease key whose TTL marks a live
/// `Pending` claim.
pub struct RedisEventLog {
    conn: ConnectionManager,
    prefix: String,
    claim_script: Script,
    claim_lease: Duration,
}

impl RedisEventLog {
    pub fn new(conn: ConnectionManager, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            claim_script: Script::new(CLAIM_EVENT),
            claim_lease: Duration::from_secs(30),
        }
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    fn event_key(&self, event_id: &EventId) -> String {
        format!("{}:event:{}", self.prefix, event_id)
    }

    fn lease_key(&self, event_id: &EventId) -> String {
        format!("{}:event-lease:{}", self.prefix, event_id)
    }
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn claim(&self, event: &FeedbackEvent, now: DateTime<Utc>) -> EngineResult<Claim> {
        let mut conn = self.conn.clone();
        let record = serde_json::to_string(&EventRecord::pending(event.clone(), now))?;
        let (outcome, detail): (String, String) = self
            .claim_script
            .key(self.event_key(&event.event_id))
            .key(self.lease_key(&event.event_id))
            .arg(record)
            .arg(now.to_rfc3339())
            .arg(self.claim_lease.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        if outcome == "acquired" {
            let attempt = detail.parse().unwrap_or(1);
            return Ok(Claim::Acquired { attempt });
        }
        let status: EventStatus = serde_json::from_value(serde_json::Value::String(detail))?;
        Ok(Claim::Duplicate(status))
    }

    async fn finish(
        &self,
        event_id: &EventId,
        status: EventStatus,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        // Only the claimer finishes an event, so a plain read-then-write is safe.
        let mut record = self
            .get(event_id)
            .await?
            .ok_or_else(|| EngineError::Store(format!("event {event_id} was never claimed")))?;
        record.status = status;
        record.note = note;
        record.updated_at = now;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .set(self.event_key(event_id), serde_json::to_string(&record)?)
            .ignore()
            .del(self.lease_key(event_id))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn get(&self, event_id: &EventId) -> EngineResult<Option<EventRecord>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(self.event_key(event_id)).await.map_err(store_err)?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
