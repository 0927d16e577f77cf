//! Append-only per-job event log.
//!
//! Each job directory holds `events.jsonl` (one event per line) and
//! `events.seq` (the last issued event id). Event ids are strictly
//! increasing from 1 with no gaps; appends are serialized by a process-wide
//! per-job mutex, and the claim lock keeps other processes away from the
//! same job. The seq file is an optimization only; a missing or corrupt
//! seq recovers by scanning the log.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::jobs::store::job_dir;
use super::signal::SignalRegistry;

pub const EVENT_VERSION: u32 = 1;

const DEFAULT_LOAD_LIMIT: usize = 200;
const MAX_LOAD_LIMIT: usize = 1000;

/// The closed set of event types a job can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "job.queued")]
    JobQueued,
    #[serde(rename = "job.processing")]
    JobProcessing,
    #[serde(rename = "tool.start")]
    ToolStart,
    #[serde(rename = "tool.result")]
    ToolResult,
    #[serde(rename = "assistant.delta")]
    AssistantDelta,
    #[serde(rename = "assistant.done")]
    AssistantDone,
    #[serde(rename = "job.done")]
    JobDone,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.cancelled")]
    JobCancelled,
}

impl EventType {
    /// Terminal events end the job's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::JobDone | EventType::JobFailed | EventType::JobCancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobQueued => "job.queued",
            EventType::JobProcessing => "job.processing",
            EventType::ToolStart => "tool.start",
            EventType::ToolResult => "tool.result",
            EventType::AssistantDelta => "assistant.delta",
            EventType::AssistantDone => "assistant.done",
            EventType::JobDone => "job.done",
            EventType::JobFailed => "job.failed",
            EventType::JobCancelled => "job.cancelled",
        }
    }
}

/// One event in a job's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    pub event_id: u64,
    pub event_version: u32,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

/// Append-only event log over the job root.
pub struct EventLog {
    jobs_root: PathBuf,
    signals: Arc<SignalRegistry>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EventLog {
    pub fn new(jobs_root: PathBuf, signals: Arc<SignalRegistry>) -> Self {
        Self {
            jobs_root,
            signals,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn log_path(&self, job_id: &str) -> PathBuf {
        job_dir(&self.jobs_root, job_id).join("events.jsonl")
    }

    fn seq_path(&self, job_id: &str) -> PathBuf {
        job_dir(&self.jobs_root, job_id).join("events.seq")
    }

    fn job_mutex(&self, job_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn current_event_id(&self, job_id: &str) -> u64 {
        let seq_path = self.seq_path(job_id);
        if let Ok(text) = fs::read_to_string(&seq_path) {
            if let Ok(id) = text.trim().parse::<u64>() {
                return id;
            }
        }
        self.max_event_id_from_log(job_id)
    }

    fn max_event_id_from_log(&self, job_id: &str) -> u64 {
        let path = self.log_path(job_id);
        let Ok(file) = fs::File::open(&path) else {
            return 0;
        };
        let mut max_id = 0;
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            match serde_json::from_str::<ChatEvent>(text) {
                Ok(event) => max_id = max_id.max(event.event_id),
                Err(e) => debug!(job_id, error = %e, "skipping malformed event line"),
            }
        }
        max_id
    }

    /// Append one event, assign it the next id, and wake stream readers.
    pub fn append(
        &self,
        job_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<ChatEvent> {
        let mutex = self.job_mutex(job_id);
        let _guard = mutex.lock().unwrap_or_else(|e| e.into_inner());

        let dir = job_dir(&self.jobs_root, job_id);
        fs::create_dir_all(&dir)?;

        let next_id = self.current_event_id(job_id) + 1;
        let event = ChatEvent {
            event_id: next_id,
            event_version: EVENT_VERSION,
            event_type,
            payload,
            ts: Utc::now(),
        };

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(job_id))
            .with_context(|| format!("open event log for job {job_id}"))?;
        file.write_all(line.as_bytes())?;

        // Best-effort: a lost seq write is recovered by scanning the log.
        if let Err(e) = fs::write(self.seq_path(job_id), next_id.to_string()) {
            warn!(job_id, error = %e, "failed to update events.seq");
        }

        self.signals.notify(job_id);
        if event_type.is_terminal() {
            self.signals.clear(job_id);
        }

        Ok(event)
    }

    /// Load events after `after_event_id`, up to `limit`.
    pub fn load(&self, job_id: &str, after_event_id: u64, limit: usize) -> Vec<ChatEvent> {
        self.load_incremental(job_id, after_event_id, None, limit).0
    }

    /// Load events after `after_event_id`, seeking to `offset_hint` first
    /// when it is within the file. Returns the events plus the byte offset
    /// where the next read should resume.
    ///
    /// The offset hint is advisory: out-of-range hints fall back to a scan
    /// from byte zero, and malformed or blank lines are skipped with the
    /// offset advancing past them.
    pub fn load_incremental(
        &self,
        job_id: &str,
        after_event_id: u64,
        offset_hint: Option<u64>,
        limit: usize,
    ) -> (Vec<ChatEvent>, u64) {
        let cap = limit.clamp(1, MAX_LOAD_LIMIT);
        let path = self.log_path(job_id);
        let Ok(file) = fs::File::open(&path) else {
            return (Vec::new(), offset_hint.unwrap_or(0));
        };

        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        let start = match offset_hint {
            Some(hint) if hint <= size => hint,
            _ => 0,
        };

        let mut reader = BufReader::new(file);
        if start > 0 && reader.seek(SeekFrom::Start(start)).is_err() {
            return (Vec::new(), offset_hint.unwrap_or(0));
        }

        let mut events = Vec::new();
        let mut offset = start;
        let mut line = String::new();
        loop {
            line.clear();
            let read = match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(job_id, error = %e, "event log read failed");
                    break;
                }
            };
            offset += read as u64;

            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            let event = match serde_json::from_str::<ChatEvent>(text) {
                Ok(event) => event,
                Err(e) => {
                    debug!(job_id, error = %e, "skipping malformed event line");
                    continue;
                }
            };
            if event.event_id <= after_event_id {
                continue;
            }
            events.push(event);
            if events.len() >= cap {
                break;
            }
        }

        (events, offset)
    }

    /// Default page size for callers that do not specify a limit.
    pub fn default_limit() -> usize {
        DEFAULT_LOAD_LIMIT
    }

    /// Wait for a fresh event signal on this job.
    pub async fn wait_for_activity(&self, job_id: &str, last_seen: u64, timeout: Duration) -> u64 {
        self.signals.wait(job_id, last_seen, timeout).await
    }
}

/// The JSON object carried in an SSE `data:` field for an event.
pub fn sse_data(event: &ChatEvent) -> serde_json::Value {
    serde_json::json!({
        "event_id": event.event_id,
        "event_version": event.event_version,
        "type": event.event_type.as_str(),
        "payload": event.payload,
    })
}

/// Render an event as a raw SSE frame.
pub fn encode_sse(event: &ChatEvent) -> String {
    format!(
        "id: {}\nevent: {}\ndata: {}\n\n",
        event.event_id,
        event.event_type.as_str(),
        sse_data(event)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log() -> (tempfile::TempDir, EventLog) {
        let dir = tempfile::tempdir().unwrap();
        let signals = Arc::new(SignalRegistry::new(64, Duration::from_secs(1800)));
        let log = EventLog::new(dir.path().join("jobs"), signals);
        (dir, log)
    }

    #[test]
    fn test_ids_are_monotonic_from_one() {
        let (_dir, log) = test_log();
        for i in 1..=5u64 {
            let event = log
                .append("job-1", EventType::AssistantDelta, serde_json::json!({}))
                .unwrap();
            assert_eq!(event.event_id, i);
        }
        let events = log.load("job-1", 0, 100);
        let ids: Vec<u64> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_seq_recovery_by_scan() {
        let (_dir, log) = test_log();
        log.append("job-1", EventType::JobQueued, serde_json::json!({}))
            .unwrap();
        log.append("job-1", EventType::JobProcessing, serde_json::json!({}))
            .unwrap();

        // Corrupt the seq file; the next append must recover by scanning.
        fs::write(log.seq_path("job-1"), "not a number").unwrap();
        let event = log
            .append("job-1", EventType::AssistantDone, serde_json::json!({}))
            .unwrap();
        assert_eq!(event.event_id, 3);
    }

    #[test]
    fn test_load_skips_after_cursor() {
        let (_dir, log) = test_log();
        for _ in 0..10 {
            log.append("job-1", EventType::AssistantDelta, serde_json::json!({}))
                .unwrap();
        }
        let events = log.load("job-1", 7, 100);
        let ids: Vec<u64> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![8, 9, 10]);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let (_dir, log) = test_log();
        log.append("job-1", EventType::JobQueued, serde_json::json!({}))
            .unwrap();

        // Inject garbage between valid events
        let mut file = OpenOptions::new()
            .append(true)
            .open(log.log_path("job-1"))
            .unwrap();
        file.write_all(b"{broken\n\n").unwrap();
        drop(file);

        let event = log
            .append("job-1", EventType::JobDone, serde_json::json!({}))
            .unwrap();
        assert_eq!(event.event_id, 2);

        let events = log.load("job-1", 0, 100);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_incremental_offset_resume() {
        let (_dir, log) = test_log();
        for _ in 0..3 {
            log.append("job-1", EventType::AssistantDelta, serde_json::json!({}))
                .unwrap();
        }

        let (first, offset) = log.load_incremental("job-1", 0, None, 2);
        assert_eq!(first.len(), 2);

        let (rest, next_offset) = log.load_incremental("job-1", first.last().unwrap().event_id, Some(offset), 100);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event_id, 3);
        assert!(next_offset > offset);

        // Caught up: nothing more, offset stable
        let (empty, final_offset) =
            log.load_incremental("job-1", 3, Some(next_offset), 100);
        assert!(empty.is_empty());
        assert_eq!(final_offset, next_offset);
    }

    #[test]
    fn test_out_of_range_offset_hint_rescans() {
        let (_dir, log) = test_log();
        log.append("job-1", EventType::JobQueued, serde_json::json!({}))
            .unwrap();
        let (events, _) = log.load_incremental("job-1", 0, Some(1_000_000), 100);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_missing_log_returns_hint() {
        let (_dir, log) = test_log();
        let (events, offset) = log.load_incremental("nope", 0, Some(42), 100);
        assert!(events.is_empty());
        assert_eq!(offset, 42);
    }

    #[tokio::test]
    async fn test_terminal_event_clears_signal() {
        let (_dir, log) = test_log();
        log.append("job-1", EventType::JobQueued, serde_json::json!({}))
            .unwrap();
        assert_eq!(log.signals.len(), 1);
        log.append("job-1", EventType::JobDone, serde_json::json!({}))
            .unwrap();
        assert!(log.signals.is_empty());
    }

    #[test]
    fn test_encode_sse_frame() {
        let event = ChatEvent {
            event_id: 7,
            event_version: EVENT_VERSION,
            event_type: EventType::AssistantDone,
            payload: serde_json::json!({"content": "hi"}),
            ts: Utc::now(),
        };
        let frame = encode_sse(&event);
        assert!(frame.starts_with("id: 7\nevent: assistant.done\ndata: "));
        assert!(frame.ends_with("\n\n"));

        let data_line = frame.lines().nth(2).unwrap();
        let data: serde_json::Value =
            serde_json::from_str(data_line.strip_prefix("data: ").unwrap()).unwrap();
        assert_eq!(data["event_id"], 7);
        assert_eq!(data["type"], "assistant.done");
    }

    #[test]
    fn test_event_type_serde_names() {
        let json = serde_json::to_string(&EventType::JobQueued).unwrap();
        assert_eq!(json, "\"job.queued\"");
        let back: EventType = serde_json::from_str("\"tool.result\"").unwrap();
        assert_eq!(back, EventType::ToolResult);
    }
}
