//! Idempotent `request_id → job_id` mapping.
//!
//! One tiny file per request id, created with `O_CREAT|O_EXCL` so the first
//! writer wins across processes without any coordination service. A legacy
//! consolidated `request_index.json` is still read on miss and written
//! best-effort; the per-file entry is authoritative.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::common::safe_fs_id;
use crate::kernel::fs_atomic::{atomic_write_json, read_json_opt};

pub struct RequestIndex {
    map_dir: PathBuf,
    legacy_index_path: PathBuf,
    legacy_lock: Mutex<()>,
}

impl RequestIndex {
    pub fn new(root: &Path) -> Self {
        Self {
            map_dir: root.join("requests"),
            legacy_index_path: root.join("request_index.json"),
            legacy_lock: Mutex::new(()),
        }
    }

    fn map_path(&self, request_id: &str) -> PathBuf {
        self.map_dir
            .join(format!("{}.txt", safe_fs_id(request_id, "req")))
    }

    /// Look up the job for `request_id`.
    ///
    /// `job_exists` verifies the referenced record is still on disk; a
    /// mapping that points at a garbage-collected job is unlinked and
    /// treated as a miss.
    pub fn get(&self, request_id: &str, job_exists: impl Fn(&str) -> bool) -> Option<String> {
        let request_id = request_id.trim();
        if request_id.is_empty() {
            return None;
        }

        if let Some(job_id) = self.get_from_map(request_id, &job_exists) {
            return Some(job_id);
        }

        // Legacy consolidated index, read on per-file miss only.
        let legacy = {
            let _guard = self.legacy_lock.lock().unwrap_or_else(|e| e.into_inner());
            read_json_opt::<BTreeMap<String, String>>(&self.legacy_index_path)
                .and_then(|idx| idx.get(request_id).cloned())
        }?;
        if legacy.is_empty() || !job_exists(&legacy) {
            return None;
        }
        Some(legacy)
    }

    fn get_from_map(
        &self,
        request_id: &str,
        job_exists: &impl Fn(&str) -> bool,
    ) -> Option<String> {
        let path = self.map_path(request_id);
        let job_id = fs::read_to_string(&path).ok()?.trim().to_string();
        if job_id.is_empty() {
            return None;
        }
        if !job_exists(&job_id) {
            debug!(request_id, job_id, "unlinking stale request map entry");
            let _ = fs::remove_file(&path);
            return None;
        }
        Some(job_id)
    }

    /// Record `request_id → job_id` if no mapping exists yet.
    ///
    /// Returns false when another writer already holds the slot. The legacy
    /// index is updated best-effort either way.
    pub fn set_if_absent(&self, request_id: &str, job_id: &str) -> bool {
        let request_id = request_id.trim();
        let job_id = job_id.trim();
        if request_id.is_empty() || job_id.is_empty() {
            return false;
        }

        let created = self.create_map_entry(request_id, job_id);
        self.upsert_legacy(request_id, job_id);
        created
    }

    fn create_map_entry(&self, request_id: &str, job_id: &str) -> bool {
        if fs::create_dir_all(&self.map_dir).is_err() {
            return false;
        }
        let path = self.map_path(request_id);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                if let Err(e) = file.write_all(job_id.as_bytes()) {
                    warn!(request_id, error = %e, "request map write failed");
                }
                true
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => false,
            Err(e) => {
                warn!(request_id, error = %e, "request map create failed");
                false
            }
        }
    }

    fn upsert_legacy(&self, request_id: &str, job_id: &str) {
        let _guard = self.legacy_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut index = read_json_opt::<BTreeMap<String, String>>(&self.legacy_index_path)
            .unwrap_or_default();
        index.insert(request_id.to_string(), job_id.to_string());
        if let Err(e) = atomic_write_json(&self.legacy_index_path, &index) {
            debug!(request_id, error = %e, "legacy request index write failed");
        }
    }
}
