//! Per-job directory store.
//!
//! Each job owns `<jobs_root>/<job_id>/` containing `job.json`, the event
//! log pair, and the claim lock. `job.json` is rewritten atomically on
//! every status transition; only the ingress (at creation) and the claim
//! holder write it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use super::job::{ChatJob, JobStatus};
use crate::common::safe_fs_id;
use crate::kernel::fs_atomic::atomic_write_json;

pub fn job_dir(root: &Path, job_id: &str) -> PathBuf {
    root.join(safe_fs_id(job_id, "job"))
}

pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, job_id: &str) -> PathBuf {
        job_dir(&self.root, job_id)
    }

    fn record_path(&self, job_id: &str) -> PathBuf {
        self.dir(job_id).join("job.json")
    }

    pub fn claim_path(&self, job_id: &str) -> PathBuf {
        self.dir(job_id).join("claim.lock")
    }

    pub fn exists(&self, job_id: &str) -> bool {
        self.record_path(job_id).exists()
    }

    /// Persist a freshly created record. Refuses to overwrite an existing
    /// job so ingress bugs cannot clobber a record mid-flight.
    pub fn create(&self, job: &ChatJob) -> Result<()> {
        let path = self.record_path(&job.job_id);
        if path.exists() {
            bail!("job record already exists: {}", job.job_id);
        }
        atomic_write_json(&path, job)
    }

    pub fn load(&self, job_id: &str) -> Result<Option<ChatJob>> {
        let path = self.record_path(job_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context(format!("read job record {job_id}")),
        };
        let job = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse job record {job_id}"))?;
        Ok(Some(job))
    }

    /// Rewrite the record, bumping `updated_at`.
    pub fn save(&self, job: &mut ChatJob) -> Result<()> {
        job.updated_at = chrono::Utc::now();
        atomic_write_json(&self.record_path(&job.job_id), job)
    }

    /// Load-modify-save a status transition. Returns the updated record,
    /// or `None` when the job does not exist.
    pub fn set_status(&self, job_id: &str, status: JobStatus) -> Result<Option<ChatJob>> {
        let Some(mut job) = self.load(job_id)? else {
            return Ok(None);
        };
        job.status = status;
        self.save(&mut job)?;
        Ok(Some(job))
    }

    /// Remove a job directory. Used only for records the ingress abandoned
    /// before they were ever enqueued.
    pub fn remove(&self, job_id: &str) {
        let dir = self.dir(job_id);
        if let Err(e) = fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(job_id, error = %e, "failed to remove job directory");
            }
        }
    }

    /// Crash recovery: every job still `queued` or `processing`.
    ///
    /// Unreadable records are skipped; a half-written directory must not
    /// stall the scan.
    pub fn scan_pending(&self) -> Vec<ChatJob> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut pending = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let record = entry.path().join("job.json");
            if !record.is_file() {
                continue;
            }
            let job: ChatJob = match fs::read(&record)
                .ok()
                .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            {
                Some(job) => job,
                None => {
                    debug!(path = %record.display(), "skipping unreadable job record");
                    continue;
                }
            };
            if matches!(job.status, JobStatus::Queued | JobStatus::Processing) {
                pending.push(job);
            }
        }
        pending
    }
}
