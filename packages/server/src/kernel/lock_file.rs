//! Advisory claim locks with TTL and PID-liveness reclaim.
//!
//! A claim lock is a single file created with `O_CREAT|O_EXCL` holding
//! `{owner_token, pid, acquired_at}`. The owner token is random and lives
//! only in the acquirer's memory; the PID exists purely so a later process
//! can recycle locks left behind by a crashed owner.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Token proving lock ownership; required for release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerToken(String);

impl OwnerToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockPayload {
    owner_token: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Probe whether a PID is alive. Permission denied means the process exists
/// but belongs to someone else, which counts as alive.
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether an existing lock file may be reclaimed.
///
/// Reclaimable when the recorded PID is dead, or the lock is older than the
/// TTL. Unreadable payloads fall back to the TTL check against the file
/// mtime; stat failures mean "not reclaimable" so we never steal a lock we
/// cannot inspect.
fn is_stale(path: &Path, ttl_sec: u64) -> bool {
    // Only positive ages count; a future-dated lock (clock skew) is not
    // reclaimable by age.
    let age_exceeded = |acquired_at: DateTime<Utc>| {
        let age = Utc::now().signed_duration_since(acquired_at).num_seconds();
        ttl_sec > 0 && age > ttl_sec as i64
    };

    if let Some(payload) = fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LockPayload>(&bytes).ok())
    {
        if !pid_alive(payload.pid) {
            return true;
        }
        return age_exceeded(payload.acquired_at);
    }

    match path.metadata().and_then(|m| m.modified()) {
        Ok(modified) => age_exceeded(DateTime::<Utc>::from(modified)),
        Err(_) => false,
    }
}

/// Try to acquire the lock at `path` with the given TTL.
///
/// Returns the owner token on success. On `EEXIST` the existing lock is
/// checked for staleness (dead PID or age beyond TTL); a stale lock is
/// unlinked and the create retried once. Two attempts total bound liveness
/// under pathological races.
pub fn try_acquire(path: &Path, ttl_sec: u64) -> Option<OwnerToken> {
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return None;
        }
    }

    for attempt in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let token = OwnerToken::generate();
                let payload = LockPayload {
                    owner_token: token.as_str().to_string(),
                    pid: std::process::id(),
                    acquired_at: Utc::now(),
                };
                if let Ok(bytes) = serde_json::to_vec(&payload) {
                    let _ = file.write_all(&bytes);
                    let _ = file.sync_all();
                }
                return Some(token);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if attempt == 0 && is_stale(path, ttl_sec) {
                    debug!(path = %path.display(), "reclaiming stale claim lock");
                    let _ = fs::remove_file(path);
                    continue;
                }
                return None;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "claim lock create failed");
                return None;
            }
        }
    }
    None
}

/// Release the lock at `path` if `token` matches the recorded owner.
///
/// A non-matching token is a no-op: the lock was reclaimed by someone else
/// and unlinking it would release *their* claim.
pub fn release(path: &Path, token: &OwnerToken) {
    let owner = fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LockPayload>(&bytes).ok())
        .map(|payload| payload.owner_token);

    match owner {
        Some(recorded) if recorded == token.as_str() => {
            let _ = fs::remove_file(path);
        }
        Some(_) => {
            debug!(path = %path.display(), "skipping release of foreign claim lock");
        }
        None => {}
    }
}
