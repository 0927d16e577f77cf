//! The chat kernel: every core dependency in one explicitly-owned bundle.
//!
//! No module-level globals anywhere in the core; tests build a fresh
//! kernel per case over a temp directory and substitute the gateway, lane
//! store, and tool registry at the trait seams.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use llm_client::Gateway;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::Config;
use crate::kernel::event_log::EventLog;
use crate::kernel::history::SessionHistory;
use crate::kernel::idempotency::RequestIndex;
use crate::kernel::jobs::JobStore;
use crate::kernel::lanes::LaneStore;
use crate::kernel::signal::SignalRegistry;
use crate::kernel::tools::ToolRegistry;

/// A job handed to the worker pool.
#[derive(Debug, Clone)]
pub struct DispatchedJob {
    pub job_id: String,
    pub lane_id: String,
}

pub struct ChatKernel {
    pub config: Config,
    pub jobs: JobStore,
    pub events: EventLog,
    pub signals: Arc<SignalRegistry>,
    pub requests: RequestIndex,
    pub lanes: Arc<dyn LaneStore>,
    pub gateway: Arc<dyn Gateway>,
    pub tools: Arc<ToolRegistry>,
    pub history: SessionHistory,
    dispatcher: mpsc::UnboundedSender<DispatchedJob>,
}

impl ChatKernel {
    /// Build a kernel rooted at `config.data_dir`.
    ///
    /// Returns the kernel plus the receiving end of the dispatch channel,
    /// which the worker pool consumes.
    pub fn new(
        config: Config,
        lanes: Arc<dyn LaneStore>,
        gateway: Arc<dyn Gateway>,
        tools: Arc<ToolRegistry>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DispatchedJob>) {
        let chat_root: PathBuf = config.data_dir.join("chat");
        let jobs_root = chat_root.join("jobs");
        let sessions_root = config.data_dir.join("sessions");

        let signals = Arc::new(SignalRegistry::new(
            config.signal_max_entries,
            Duration::from_secs(config.signal_ttl_sec),
        ));

        let (tx, rx) = mpsc::unbounded_channel();

        let kernel = Arc::new(Self {
            jobs: JobStore::new(jobs_root.clone()),
            events: EventLog::new(jobs_root, signals.clone()),
            signals,
            requests: RequestIndex::new(&chat_root),
            history: SessionHistory::new(sessions_root, config.session_index_max_items),
            lanes,
            gateway,
            tools,
            config,
            dispatcher: tx,
        });

        (kernel, rx)
    }

    /// Hand a job to the worker pool.
    pub fn dispatch(&self, job_id: &str, lane_id: &str) {
        let job = DispatchedJob {
            job_id: job_id.to_string(),
            lane_id: lane_id.to_string(),
        };
        if self.dispatcher.send(job).is_err() {
            warn!(job_id, "dispatch channel closed; worker pool is gone");
        }
    }
}
