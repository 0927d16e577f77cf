//! Lane store: per-actor FIFO queues with a single active slot.
//!
//! A lane serializes the jobs of one logical actor. Each primitive here is
//! atomic with respect to the others on the same lane — a single mutex
//! region in process, a single Lua script on Redis. Callers never read lane
//! state and write back a derived value.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::config::{Config, QueueBackendKind};

pub mod memory;
pub mod redis;

pub use memory::InMemoryLaneStore;
pub use redis::RedisLaneStore;

/// Aggregate occupancy of a lane.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LaneLoad {
    pub queued: usize,
    /// 0 or 1.
    pub active: usize,
    pub total: usize,
}

/// What the caller learns from an enqueue.
#[derive(Debug, Clone, Serialize)]
pub struct LaneInfo {
    /// 0 when the job took the active slot, else its 1-based queue position.
    pub lane_queue_position: usize,
    pub lane_queue_size: usize,
    pub lane_active: bool,
}

/// Result of releasing a lane's active slot.
///
/// The two cases the original conflated into one nullable return: the
/// caller dispatches `next` exactly once on `Finished`, and must not
/// re-dispatch anything on `NotOwner`: someone else holds the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    Finished { next: Option<String> },
    NotOwner,
}

/// Atomic lane primitives. See `memory` and `redis` for the two backends.
#[async_trait]
pub trait LaneStore: Send + Sync {
    async fn lane_load(&self, lane_id: &str) -> Result<LaneLoad>;

    /// 1-based position of `job_id` in the lane queue, 0 when absent
    /// (including when it holds the active slot).
    async fn find_position(&self, lane_id: &str, job_id: &str) -> Result<usize>;

    /// Enqueue `job_id`, taking the active slot when it is free.
    ///
    /// Idempotent while the job is present: a repeat call reports the
    /// current position with `dispatch = false`. The returned flag is true
    /// exactly once per activation; the caller schedules the job then.
    async fn enqueue(&self, job_id: &str, lane_id: &str) -> Result<(LaneInfo, bool)>;

    /// Release the active slot held by `job_id` and pop the next job.
    async fn finish(&self, job_id: &str, lane_id: &str) -> Result<FinishOutcome>;

    /// Record a debounce fingerprint for this lane.
    async fn register_recent(&self, lane_id: &str, fingerprint: &str, job_id: &str) -> Result<()>;

    /// The job registered for `fingerprint`, if still inside the debounce
    /// window and the fingerprint matches exactly.
    async fn recent_job(&self, lane_id: &str, fingerprint: &str) -> Result<Option<String>>;
}

/// Select and build the lane store for this process.
pub async fn build_lane_store(config: &Config) -> Result<Arc<dyn LaneStore>> {
    config.ensure_backend_allowed()?;
    match config.queue_backend {
        QueueBackendKind::Redis => {
            let store = RedisLaneStore::connect(
                &config.redis_url,
                &config.tenant_id,
                config.claim_ttl_sec,
                config.lane_debounce_ms,
            )
            .await?;
            Ok(Arc::new(store))
        }
        QueueBackendKind::Inline => Ok(Arc::new(InMemoryLaneStore::new(
            Duration::from_secs(config.claim_ttl_sec),
            Duration::from_millis(config.lane_debounce_ms),
        ))),
    }
}
