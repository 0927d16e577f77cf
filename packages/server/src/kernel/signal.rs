//! In-memory wakeup signals for stream readers.
//!
//! One entry per job id, carrying a monotonically increasing version and a
//! notifier. Stream readers remember the version they last saw and block in
//! [`SignalRegistry::wait`]; the event log bumps the version on every append.
//!
//! The registry is bounded two ways, both amortized: a TTL sweep drops
//! entries untouched for longer than the TTL, and an LRU trim evicts the
//! oldest entries whenever the map exceeds capacity. Eviction runs at most
//! once per sweep interval unless capacity is exceeded, so a notify storm
//! never pays the full sweep on every call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

struct SignalEntry {
    version: AtomicU64,
    notify: Notify,
    last_touched: Mutex<Instant>,
}

impl SignalEntry {
    fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            notify: Notify::new(),
            last_touched: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        if let Ok(mut touched) = self.last_touched.lock() {
            *touched = Instant::now();
        }
    }

    fn touched_at(&self) -> Instant {
        self.last_touched
            .lock()
            .map(|t| *t)
            .unwrap_or_else(|_| Instant::now())
    }
}

/// Registry of per-job wakeup signals.
pub struct SignalRegistry {
    entries: Mutex<SignalState>,
    cap: usize,
    ttl: Duration,
}

struct SignalState {
    map: HashMap<String, Arc<SignalEntry>>,
    last_sweep: Instant,
}

impl SignalRegistry {
    pub fn new(cap: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(SignalState {
                map: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            cap: cap.max(1),
            ttl,
        }
    }

    fn entry(&self, key: &str) -> Arc<SignalEntry> {
        let mut state = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let now = Instant::now();
        let should_sweep = now.duration_since(state.last_sweep) >= SWEEP_INTERVAL;
        if should_sweep || state.map.len() > self.cap {
            self.evict_locked(&mut state, now);
        }

        let entry = state
            .map
            .entry(normalize_key(key))
            .or_insert_with(|| Arc::new(SignalEntry::new()))
            .clone();
        entry.touch();

        self.trim_capacity_locked(&mut state);
        entry
    }

    fn evict_locked(&self, state: &mut SignalState, now: Instant) {
        state
            .map
            .retain(|_, entry| now.duration_since(entry.touched_at()) < self.ttl);
        self.trim_capacity_locked(state);
        state.last_sweep = now;
    }

    fn trim_capacity_locked(&self, state: &mut SignalState) {
        while state.map.len() > self.cap {
            let oldest = state
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.touched_at())
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    state.map.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Bump the version for `key` and wake every blocked reader.
    pub fn notify(&self, key: &str) {
        let entry = self.entry(key);
        entry.version.fetch_add(1, Ordering::AcqRel);
        entry.touch();
        entry.notify.notify_waiters();
    }

    /// Wait until the version for `key` exceeds `last_seen`, or `timeout`
    /// elapses. Returns the current version either way.
    pub async fn wait(&self, key: &str, last_seen: u64, timeout: Duration) -> u64 {
        let entry = self.entry(key);
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before reading the version so a notify
            // between the two cannot be missed.
            let notified = entry.notify.notified();
            let current = entry.version.load(Ordering::Acquire);
            if current > last_seen {
                entry.touch();
                return current;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                entry.touch();
                return current;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                entry.touch();
                return entry.version.load(Ordering::Acquire);
            }
        }
    }

    /// Drop the entry for `key`. Called by the event log on terminal events.
    pub fn clear(&self, key: &str) {
        let mut state = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        state.map.remove(&normalize_key(key));
    }

    pub fn len(&self) -> usize {
        let state = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        state.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize_key(key: &str) -> String {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}
