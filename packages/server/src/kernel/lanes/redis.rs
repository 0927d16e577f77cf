//! Redis-backed lane store.
//!
//! The enqueue and finish primitives each run as a single Lua script, so
//! every worker process observing the same Redis sees the same atomic lane
//! transitions. Keys are namespaced per tenant:
//!
//! ```text
//! chat:{tenant}:lane:{lane_id}:queue    LIST   pending job ids, FIFO
//! chat:{tenant}:lane:{lane_id}:active   STRING the active job id, EX = claim TTL
//! chat:{tenant}:lane:{lane_id}:recent   STRING debounce entry, PX = debounce
//! chat:{tenant}:queued                  SET    every present job id
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::warn;

use super::{FinishOutcome, LaneInfo, LaneLoad, LaneStore};

const ENQUEUE_SCRIPT: &str = r#"
local queue_key = KEYS[1]
local active_key = KEYS[2]
local queued_key = KEYS[3]
local job_id = ARGV[1]
local ttl = tonumber(ARGV[2]) or 0

if redis.call('SISMEMBER', queued_key, job_id) == 1 then
    local pos = redis.call('LPOS', queue_key, job_id)
    if not pos then
        pos = 0
    else
        pos = pos + 1
    end
    local qlen = redis.call('LLEN', queue_key)
    local active = redis.call('EXISTS', active_key)
    return {pos, qlen, active, 0}
end

local active = redis.call('EXISTS', active_key)
if active == 1 then
    local qlen = redis.call('RPUSH', queue_key, job_id)
    redis.call('SADD', queued_key, job_id)
    return {qlen, qlen, 1, 0}
end

redis.call('SADD', queued_key, job_id)
if ttl > 0 then
    redis.call('SET', active_key, job_id, 'EX', ttl)
else
    redis.call('SET', active_key, job_id)
end
local qlen = redis.call('LLEN', queue_key)
return {0, qlen, 1, 1}
"#;

const FINISH_SCRIPT: &str = r#"
local queue_key = KEYS[1]
local active_key = KEYS[2]
local queued_key = KEYS[3]
local job_id = ARGV[1]
local ttl = tonumber(ARGV[2]) or 0

redis.call('SREM', queued_key, job_id)

local active = redis.call('GET', active_key)
if active and active ~= job_id then
    return {0, ''}
end
if active == job_id then
    redis.call('DEL', active_key)
end

local next_job = redis.call('LPOP', queue_key)
if next_job then
    if ttl > 0 then
        redis.call('SET', active_key, next_job, 'EX', ttl)
    else
        redis.call('SET', active_key, next_job)
    end
    return {1, next_job}
end
return {1, ''}
"#;

pub struct RedisLaneStore {
    conn: ConnectionManager,
    prefix: String,
    claim_ttl_sec: u64,
    debounce_ms: u64,
    enqueue_script: Script,
    finish_script: Script,
}

impl RedisLaneStore {
    pub async fn connect(
        url: &str,
        tenant_id: &str,
        claim_ttl_sec: u64,
        debounce_ms: u64,
    ) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid REDIS_URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("redis connection failed")?;

        let tenant = tenant_id.trim();
        let tenant = if tenant.is_empty() { "default" } else { tenant };

        Ok(Self {
            conn,
            prefix: format!("chat:{tenant}"),
            claim_ttl_sec,
            debounce_ms,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            finish_script: Script::new(FINISH_SCRIPT),
        })
    }

    fn queue_key(&self, lane_id: &str) -> String {
        format!("{}:lane:{}:queue", self.prefix, lane_id)
    }

    fn active_key(&self, lane_id: &str) -> String {
        format!("{}:lane:{}:active", self.prefix, lane_id)
    }

    fn recent_key(&self, lane_id: &str) -> String {
        format!("{}:lane:{}:recent", self.prefix, lane_id)
    }

    fn queued_key(&self) -> String {
        format!("{}:queued", self.prefix)
    }
}

#[async_trait]
impl LaneStore for RedisLaneStore {
    async fn lane_load(&self, lane_id: &str) -> Result<LaneLoad> {
        let mut conn = self.conn.clone();
        let queued: usize = conn.llen(self.queue_key(lane_id)).await.unwrap_or(0);
        let active: bool = conn.exists(self.active_key(lane_id)).await.unwrap_or(false);
        let active = usize::from(active);
        Ok(LaneLoad {
            queued,
            active,
            total: queued + active,
        })
    }

    async fn find_position(&self, lane_id: &str, job_id: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let pos: Option<usize> = redis::cmd("LPOS")
            .arg(self.queue_key(lane_id))
            .arg(job_id)
            .query_async(&mut conn)
            .await
            .unwrap_or_else(|e| {
                warn!(lane_id, job_id, error = %e, "LPOS failed");
                None
            });
        Ok(pos.map(|p| p + 1).unwrap_or(0))
    }

    async fn enqueue(&self, job_id: &str, lane_id: &str) -> Result<(LaneInfo, bool)> {
        let mut conn = self.conn.clone();
        let (position, queue_size, active, dispatch): (usize, usize, u8, u8) = self
            .enqueue_script
            .key(self.queue_key(lane_id))
            .key(self.active_key(lane_id))
            .key(self.queued_key())
            .arg(job_id)
            .arg(self.claim_ttl_sec)
            .invoke_async(&mut conn)
            .await
            .context("lane enqueue script failed")?;

        Ok((
            LaneInfo {
                lane_queue_position: position,
                lane_queue_size: queue_size,
                lane_active: active != 0,
            },
            dispatch != 0,
        ))
    }

    async fn finish(&self, job_id: &str, lane_id: &str) -> Result<FinishOutcome> {
        let mut conn = self.conn.clone();
        let (owner, next): (u8, String) = self
            .finish_script
            .key(self.queue_key(lane_id))
            .key(self.active_key(lane_id))
            .key(self.queued_key())
            .arg(job_id)
            .arg(self.claim_ttl_sec)
            .invoke_async(&mut conn)
            .await
            .context("lane finish script failed")?;

        if owner == 0 {
            return Ok(FinishOutcome::NotOwner);
        }
        Ok(FinishOutcome::Finished {
            next: if next.is_empty() { None } else { Some(next) },
        })
    }

    async fn register_recent(&self, lane_id: &str, fingerprint: &str, job_id: &str) -> Result<()> {
        if self.debounce_ms == 0 {
            return Ok(());
        }
        let payload = serde_json::json!({"fp": fingerprint, "job_id": job_id}).to_string();
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("SET")
            .arg(self.recent_key(lane_id))
            .arg(payload)
            .arg("PX")
            .arg(self.debounce_ms)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(lane_id, error = %e, "recent-key SET failed");
        }
        Ok(())
    }

    async fn recent_job(&self, lane_id: &str, fingerprint: &str) -> Result<Option<String>> {
        if self.debounce_ms == 0 {
            return Ok(None);
        }
        let mut conn = self.conn.clone();
        let raw: Option<String> = match conn.get(self.recent_key(lane_id)).await {
            Ok(value) => value,
            Err(e) => {
                warn!(lane_id, error = %e, "recent-key GET failed");
                return Ok(None);
            }
        };
        let Some(raw) = raw else {
            return Ok(None);
        };
        let Ok(data) = serde_json::from_str::<serde_json::Value>(&raw) else {
            warn!(lane_id, "recent-key payload was not JSON");
            return Ok(None);
        };
        if data.get("fp").and_then(|v| v.as_str()) != Some(fingerprint) {
            return Ok(None);
        }
        let job_id = data
            .get("job_id")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or_default();
        Ok(if job_id.is_empty() {
            None
        } else {
            Some(job_id.to_string())
        })
    }
}
