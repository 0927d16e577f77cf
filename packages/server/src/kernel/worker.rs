//! The worker pool.
//!
//! A fixed number of worker tasks drain the dispatch channel. Each job is
//! claimed (file lock with TTL), processed, terminated, and its lane slot
//! released, popping the next queued job back onto the pool. A periodic
//! scan re-enqueues `queued`/`processing` records so jobs survive crashed
//! workers and restarts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::kernel::chat::processor::{self, ProcessorOutcome};
use crate::kernel::chat_kernel::{ChatKernel, DispatchedJob};
use crate::kernel::event_log::EventType;
use crate::kernel::history::SessionMessage;
use crate::kernel::jobs::{ChatJob, JobError, JobStatus};
use crate::kernel::lanes::FinishOutcome;
use crate::kernel::lock_file;

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the worker tasks plus the periodic pending scan.
    pub fn spawn(
        kernel: Arc<ChatKernel>,
        receiver: mpsc::UnboundedReceiver<DispatchedJob>,
    ) -> Self {
        let receiver = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(kernel.config.worker_pool_size + 1);

        for worker_idx in 0..kernel.config.worker_pool_size {
            let kernel = kernel.clone();
            let receiver = receiver.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(kernel, receiver, worker_idx).await;
            }));
        }

        let scan_kernel = kernel.clone();
        handles.push(tokio::spawn(async move {
            let interval = Duration::from_secs(scan_kernel.config.pending_scan_interval_sec);
            loop {
                tokio::time::sleep(interval).await;
                let count = scan_and_enqueue(&scan_kernel).await;
                if count > 0 {
                    info!(count, "periodic scan re-enqueued pending jobs");
                }
            }
        }));

        Self { handles }
    }

    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn worker_loop(
    kernel: Arc<ChatKernel>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<DispatchedJob>>>,
    worker_idx: usize,
) {
    debug!(worker = worker_idx, "chat worker started");
    loop {
        let next = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        match next {
            Some(dispatched) => process_dispatched(&kernel, dispatched, worker_idx).await,
            None => break,
        }
    }
    debug!(worker = worker_idx, "chat worker stopped");
}

/// Re-enqueue every pending record on its lane. The lane store deduplicates
/// jobs that are already present, so this is safe to run at any time.
pub async fn scan_and_enqueue(kernel: &ChatKernel) -> usize {
    let mut count = 0;
    for job in kernel.jobs.scan_pending() {
        match kernel.lanes.enqueue(&job.job_id, &job.lane_id).await {
            Ok((_, dispatch)) => {
                count += 1;
                if dispatch {
                    kernel.dispatch(&job.job_id, &job.lane_id);
                }
            }
            Err(e) => warn!(job_id = %job.job_id, error = %e, "scan enqueue failed"),
        }
    }
    count
}

async fn process_dispatched(kernel: &ChatKernel, dispatched: DispatchedJob, worker_idx: usize) {
    let job_id = dispatched.job_id.as_str();
    let lane_id = dispatched.lane_id.as_str();

    match kernel.jobs.load(job_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!(job_id, "dispatched job has no record; releasing lane slot");
            finish_lane(kernel, job_id, lane_id).await;
            return;
        }
        Err(e) => {
            error!(job_id, error = %e, "job record unreadable; releasing lane slot");
            finish_lane(kernel, job_id, lane_id).await;
            return;
        }
    }

    let claim_path = kernel.jobs.claim_path(job_id);
    let Some(token) = lock_file::try_acquire(&claim_path, kernel.config.claim_ttl_sec) else {
        info!(job_id, "claim lock held by another worker; skipping");
        return;
    };

    run_claimed(kernel, job_id, worker_idx).await;

    lock_file::release(&claim_path, &token);
    finish_lane(kernel, job_id, lane_id).await;
}

async fn run_claimed(kernel: &ChatKernel, job_id: &str, worker_idx: usize) {
    // Fresh read under the claim: the record may have been cancelled
    // between dispatch and now.
    let job = match kernel.jobs.load(job_id) {
        Ok(Some(job)) => job,
        Ok(None) => {
            warn!(job_id, "job record disappeared under claim");
            return;
        }
        Err(e) => {
            error!(job_id, error = %e, "job record unreadable under claim");
            return;
        }
    };

    match job.status {
        JobStatus::Cancelled => {
            emit(kernel, job_id, EventType::JobCancelled, serde_json::json!({}));
            return;
        }
        JobStatus::Done | JobStatus::Failed => {
            debug!(job_id, status = job.status.as_str(), "job already terminal");
            return;
        }
        JobStatus::Queued | JobStatus::Processing => {}
    }

    let job = match kernel.jobs.set_status(job_id, JobStatus::Processing) {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(e) => {
            error!(job_id, error = %e, "failed to mark job processing");
            return;
        }
    };
    emit(
        kernel,
        job_id,
        EventType::JobProcessing,
        serde_json::json!({"worker": format!("worker-{worker_idx}")}),
    );

    let outcome = processor::run(kernel, &job).await;

    match outcome {
        ProcessorOutcome::Completed { reply } => {
            let mut job = job;
            job.status = JobStatus::Done;
            job.reply = Some(reply.clone());
            if let Err(e) = kernel.jobs.save(&mut job) {
                error!(job_id, error = %e, "failed to persist done status");
            }
            emit(
                kernel,
                job_id,
                EventType::JobDone,
                serde_json::json!({"reply": reply}),
            );
            persist_history(kernel, &job, &reply);
        }
        ProcessorOutcome::Cancelled => {
            if let Err(e) = kernel.jobs.set_status(job_id, JobStatus::Cancelled) {
                error!(job_id, error = %e, "failed to persist cancelled status");
            }
            emit(kernel, job_id, EventType::JobCancelled, serde_json::json!({}));
        }
        ProcessorOutcome::Failed { kind, message } => {
            warn!(job_id, kind = kind.as_str(), message, "chat job failed");
            let mut job = job;
            job.status = JobStatus::Failed;
            job.error = Some(JobError {
                kind,
                message: message.clone(),
            });
            if let Err(e) = kernel.jobs.save(&mut job) {
                error!(job_id, error = %e, "failed to persist failed status");
            }
            emit(
                kernel,
                job_id,
                EventType::JobFailed,
                serde_json::json!({"error_kind": kind, "message": message}),
            );
        }
    }
}

async fn finish_lane(kernel: &ChatKernel, job_id: &str, lane_id: &str) {
    match kernel.lanes.finish(job_id, lane_id).await {
        Ok(FinishOutcome::Finished { next: Some(next) }) => {
            debug!(lane_id, next, "lane slot handed to next job");
            kernel.dispatch(&next, lane_id);
        }
        Ok(FinishOutcome::Finished { next: None }) => {}
        Ok(FinishOutcome::NotOwner) => {
            // The slot was reclaimed (TTL) and someone else owns it now.
            // Dispatching anything here would double-run the lane.
            warn!(job_id, lane_id, "lane slot owned by another job at finish");
        }
        Err(e) => error!(job_id, lane_id, error = %e, "lane finish failed"),
    }
}

/// Mirror the finished turn into the session transcript. Failures here are
/// logged and swallowed; history is a convenience copy, not the record.
fn persist_history(kernel: &ChatKernel, job: &ChatJob, reply: &str) {
    let actor = job.actor_id();
    let user_content = job.last_user_content();

    let user_message = SessionMessage {
        ts: Utc::now(),
        role: "user".to_string(),
        content: user_content.to_string(),
        job_id: Some(job.job_id.clone()),
    };
    let assistant_message = SessionMessage {
        ts: Utc::now(),
        role: "assistant".to_string(),
        content: reply.to_string(),
        job_id: Some(job.job_id.clone()),
    };

    let result = kernel
        .history
        .append_message(job.role, &actor, &job.session_id, &user_message)
        .and_then(|_| {
            kernel
                .history
                .append_message(job.role, &actor, &job.session_id, &assistant_message)
        })
        .and_then(|_| {
            kernel
                .history
                .update_index(job.role, &actor, &job.session_id, reply, 2)
        });
    if let Err(e) = result {
        warn!(job_id = %job.job_id, error = %e, "session history update failed");
    }
}

fn emit(kernel: &ChatKernel, job_id: &str, event_type: EventType, payload: serde_json::Value) {
    if let Err(e) = kernel.events.append(job_id, event_type, payload) {
        warn!(job_id, event = event_type.as_str(), error = %e, "event append failed");
    }
}
