//! Shared harness for integration tests.
//!
//! Each test builds a fresh kernel over a temp directory with the scripted
//! mock gateway and fake tool registry from the library's test support
//! module. Workers start only when the test asks, so queue states can be
//! observed before anything drains.

use std::sync::Arc;
use std::time::Duration;

use llm_client::{ChatMessage, Gateway, LlmResponse};
use tokio::sync::mpsc;

use server_core::config::Config;
use server_core::kernel::chat::{self, ChatRequest, IngressReceipt};
use server_core::kernel::chat_kernel::{ChatKernel, DispatchedJob};
use server_core::kernel::errors::CoreError;
use server_core::kernel::event_log::ChatEvent;
use server_core::kernel::jobs::{ChatJob, JobStatus};
use server_core::kernel::lanes::InMemoryLaneStore;
use server_core::kernel::test_support::test_tool_registry;
use server_core::kernel::WorkerPool;
use server_core::server::build_router;

pub struct TestApp {
    pub kernel: Arc<ChatKernel>,
    // Held for the lifetime of the test; the directory is removed on drop.
    _dir: tempfile::TempDir,
    receiver: Option<mpsc::UnboundedReceiver<DispatchedJob>>,
    pool: Option<WorkerPool>,
}

impl TestApp {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self::with_config(gateway, |_| {})
    }

    pub fn with_config(gateway: Arc<dyn Gateway>, tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::for_tests(dir.path().to_path_buf());
        tweak(&mut config);

        let lanes = Arc::new(InMemoryLaneStore::new(
            Duration::from_secs(config.claim_ttl_sec),
            Duration::from_millis(config.lane_debounce_ms),
        ));
        let (kernel, receiver) =
            ChatKernel::new(config, lanes, gateway, Arc::new(test_tool_registry()));

        Self {
            kernel,
            _dir: dir,
            receiver: Some(receiver),
            pool: None,
        }
    }

    /// Start the worker pool. Jobs dispatched before this sit in the
    /// channel and are picked up immediately afterwards.
    pub fn start_workers(&mut self) {
        let receiver = self.receiver.take().expect("workers already started");
        self.pool = Some(WorkerPool::spawn(self.kernel.clone(), receiver));
    }

    pub async fn submit(&self, request: ChatRequest) -> Result<IngressReceipt, CoreError> {
        chat::submit(&self.kernel, request).await
    }

    pub fn events(&self, job_id: &str) -> Vec<ChatEvent> {
        self.kernel.events.load(job_id, 0, 1000)
    }

    /// Poll until the job reaches `status` or the timeout expires.
    pub async fn wait_for_status(
        &self,
        job_id: &str,
        status: JobStatus,
        timeout: Duration,
    ) -> ChatJob {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Ok(Some(job)) = self.kernel.jobs.load(job_id) {
                if job.status == status {
                    return job;
                }
                if std::time::Instant::now() >= deadline {
                    panic!(
                        "job {job_id} stuck in status {:?} (wanted {:?}); events: {:?}",
                        job.status,
                        status,
                        self.events(job_id)
                    );
                }
            } else if std::time::Instant::now() >= deadline {
                panic!("job {job_id} never appeared");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Serve the HTTP surface on an ephemeral port; returns the base URL.
    pub async fn spawn_http(&self) -> String {
        let app = build_router(self.kernel.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }
}

/// A teacher request with one user message.
pub fn teacher_request(
    teacher_id: &str,
    session_id: &str,
    text: &str,
    request_id: Option<&str>,
) -> ChatRequest {
    ChatRequest {
        role: "teacher".to_string(),
        messages: vec![ChatMessage::user(text)],
        request_id: request_id.map(str::to_string),
        session_id: Some(session_id.to_string()),
        teacher_id: Some(teacher_id.to_string()),
        student_id: None,
        attachment_ids: None,
    }
}

pub fn text_response(text: &str) -> LlmResponse {
    LlmResponse {
        text: text.to_string(),
        ..Default::default()
    }
}
