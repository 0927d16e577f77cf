//! In-process lane store.
//!
//! Single-host backend: all lane state lives under one mutex, which makes
//! every primitive trivially atomic. Semantics mirror the Redis scripts,
//! including active-slot expiry at the claim TTL so a wedged worker cannot
//! block a lane forever.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use super::{FinishOutcome, LaneInfo, LaneLoad, LaneStore};

#[derive(Debug)]
struct RecentEntry {
    fingerprint: String,
    job_id: String,
    expires: Instant,
}

#[derive(Debug, Default)]
struct LaneState {
    queue: VecDeque<String>,
    active: Option<(String, Option<Instant>)>,
    queued: HashSet<String>,
    recent: Option<RecentEntry>,
}

impl LaneState {
    fn active_job(&mut self, now: Instant) -> Option<&str> {
        if let Some((_, Some(expires))) = &self.active {
            if *expires <= now {
                self.active = None;
            }
        }
        self.active.as_ref().map(|(job, _)| job.as_str())
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.active.is_none() && self.queued.is_empty()
            && self.recent.is_none()
    }
}

pub struct InMemoryLaneStore {
    lanes: Mutex<HashMap<String, LaneState>>,
    claim_ttl: Duration,
    debounce: Duration,
}

impl InMemoryLaneStore {
    pub fn new(claim_ttl: Duration, debounce: Duration) -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            claim_ttl,
            debounce,
        }
    }

    fn with_lane<T>(&self, lane_id: &str, f: impl FnOnce(&mut LaneState) -> T) -> T {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        let state = lanes.entry(lane_id.to_string()).or_default();
        let result = f(state);
        if state.is_empty() {
            lanes.remove(lane_id);
        }
        result
    }

    fn active_deadline(&self, now: Instant) -> Option<Instant> {
        if self.claim_ttl.is_zero() {
            None
        } else {
            Some(now + self.claim_ttl)
        }
    }
}

#[async_trait]
impl LaneStore for InMemoryLaneStore {
    async fn lane_load(&self, lane_id: &str) -> Result<LaneLoad> {
        let now = Instant::now();
        Ok(self.with_lane(lane_id, |state| {
            let active = usize::from(state.active_job(now).is_some());
            let queued = state.queue.len();
            LaneLoad {
                queued,
                active,
                total: queued + active,
            }
        }))
    }

    async fn find_position(&self, lane_id: &str, job_id: &str) -> Result<usize> {
        Ok(self.with_lane(lane_id, |state| {
            state
                .queue
                .iter()
                .position(|id| id == job_id)
                .map(|i| i + 1)
                .unwrap_or(0)
        }))
    }

    async fn enqueue(&self, job_id: &str, lane_id: &str) -> Result<(LaneInfo, bool)> {
        let now = Instant::now();
        let deadline = self.active_deadline(now);
        Ok(self.with_lane(lane_id, |state| {
            if state.queued.contains(job_id) {
                let position = state
                    .queue
                    .iter()
                    .position(|id| id == job_id)
                    .map(|i| i + 1)
                    .unwrap_or(0);
                let info = LaneInfo {
                    lane_queue_position: position,
                    lane_queue_size: state.queue.len(),
                    lane_active: state.active_job(now).is_some(),
                };
                return (info, false);
            }

            if state.active_job(now).is_some() {
                state.queue.push_back(job_id.to_string());
                state.queued.insert(job_id.to_string());
                let size = state.queue.len();
                let info = LaneInfo {
                    lane_queue_position: size,
                    lane_queue_size: size,
                    lane_active: true,
                };
                return (info, false);
            }

            state.queued.insert(job_id.to_string());
            state.active = Some((job_id.to_string(), deadline));
            let info = LaneInfo {
                lane_queue_position: 0,
                lane_queue_size: state.queue.len(),
                lane_active: true,
            };
            (info, true)
        }))
    }

    async fn finish(&self, job_id: &str, lane_id: &str) -> Result<FinishOutcome> {
        let now = Instant::now();
        let deadline = self.active_deadline(now);
        Ok(self.with_lane(lane_id, |state| {
            state.queued.remove(job_id);

            let active_owner = state.active_job(now).map(str::to_string);
            match active_owner.as_deref() {
                Some(active) if active != job_id => return FinishOutcome::NotOwner,
                Some(_) => state.active = None,
                None => {}
            }

            let next = state.queue.pop_front();
            if let Some(next_job) = &next {
                state.active = Some((next_job.clone(), deadline));
            }
            FinishOutcome::Finished { next }
        }))
    }

    async fn register_recent(&self, lane_id: &str, fingerprint: &str, job_id: &str) -> Result<()> {
        if self.debounce.is_zero() {
            return Ok(());
        }
        let expires = Instant::now() + self.debounce;
        self.with_lane(lane_id, |state| {
            state.recent = Some(RecentEntry {
                fingerprint: fingerprint.to_string(),
                job_id: job_id.to_string(),
                expires,
            });
        });
        Ok(())
    }

    async fn recent_job(&self, lane_id: &str, fingerprint: &str) -> Result<Option<String>> {
        if self.debounce.is_zero() {
            return Ok(None);
        }
        let now = Instant::now();
        Ok(self.with_lane(lane_id, |state| {
            let expired = matches!(&state.recent, Some(entry) if entry.expires <= now);
            if expired {
                state.recent = None;
                return None;
            }
            match &state.recent {
                Some(entry) if entry.fingerprint == fingerprint => Some(entry.job_id.clone()),
                _ => None,
            }
        }))
    }
}
