//! Shared fakes for unit and integration tests.
//!
//! Real deployments wire `HttpGateway` and skill-provided tools; tests
//! substitute the scripted fakes here at the same trait seams.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use llm_client::{Gateway, LlmError, LlmRequest, LlmResponse, Tool};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::kernel::chat_kernel::{ChatKernel, DispatchedJob};
use crate::kernel::jobs::Role;
use crate::kernel::lanes::InMemoryLaneStore;
use crate::kernel::tools::ToolRegistry;

/// Gateway that replays a scripted sequence of responses.
pub struct MockGateway {
    script: Mutex<Vec<Result<LlmResponse, LlmError>>>,
}

impl MockGateway {
    /// Responses are consumed in order; further calls fail.
    pub fn scripted(responses: Vec<Result<LlmResponse, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(responses),
        })
    }

    /// A script of `count` identical plain-text replies.
    pub fn replies(text: &str, count: usize) -> Arc<Self> {
        let responses = (0..count)
            .map(|_| {
                Ok(LlmResponse {
                    text: text.to_string(),
                    ..Default::default()
                })
            })
            .collect();
        Self::scripted(responses)
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn generate(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        if script.is_empty() {
            return Err(LlmError::Api {
                status: 500,
                message: "mock gateway script exhausted".to_string(),
            });
        }
        script.remove(0)
    }
}

#[derive(Deserialize, JsonSchema)]
pub struct LookupArgs {
    pub query: String,
}

#[derive(Serialize)]
pub struct LookupOutput {
    pub matches: Vec<String>,
}

/// Example-search tool available to both roles.
pub struct LookupTool;

#[async_trait]
impl Tool for LookupTool {
    const NAME: &'static str = "example.lookup";
    type Args = LookupArgs;
    type Output = LookupOutput;
    type Error = std::convert::Infallible;

    fn description(&self) -> &str {
        "Search worked examples by topic"
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        Ok(LookupOutput {
            matches: vec![args.query],
        })
    }
}

#[derive(Deserialize, JsonSchema)]
pub struct ExamMetricsArgs {
    pub exam_id: String,
}

#[derive(Serialize)]
pub struct ExamMetricsOutput {
    pub exam_id: String,
    pub mean_score: f64,
}

/// Teacher-only exam metrics tool.
pub struct ExamMetricsTool;

#[async_trait]
impl Tool for ExamMetricsTool {
    const NAME: &'static str = "exam.metrics";
    type Args = ExamMetricsArgs;
    type Output = ExamMetricsOutput;
    type Error = std::convert::Infallible;

    fn description(&self) -> &str {
        "Aggregate score metrics for one exam"
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        Ok(ExamMetricsOutput {
            exam_id: args.exam_id,
            mean_score: 72.5,
        })
    }
}

/// Registry with the two fake tools: `example.lookup` for everyone,
/// `exam.metrics` gated to teachers.
pub fn test_tool_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(LookupTool), &[Role::Teacher, Role::Student]);
    registry.register(Box::new(ExamMetricsTool), &[Role::Teacher]);
    registry
}

/// Build a kernel over `data_dir` with the in-memory lane store, the fake
/// tool registry, and the given gateway.
pub fn test_kernel_at(
    data_dir: PathBuf,
    gateway: Arc<dyn Gateway>,
) -> (Arc<ChatKernel>, mpsc::UnboundedReceiver<DispatchedJob>) {
    let config = Config::for_tests(data_dir);
    let lanes = Arc::new(InMemoryLaneStore::new(
        Duration::from_secs(config.claim_ttl_sec),
        Duration::from_millis(config.lane_debounce_ms),
    ));
    ChatKernel::new(config, lanes, gateway, Arc::new(test_tool_registry()))
}

#[cfg(test)]
pub fn test_kernel(
    gateway: Arc<dyn Gateway>,
) -> (
    Arc<ChatKernel>,
    mpsc::UnboundedReceiver<DispatchedJob>,
    tempfile::TempDir,
) {
    let dir = tempfile::tempdir().unwrap();
    let (kernel, rx) = test_kernel_at(dir.path().to_path_buf(), gateway);
    (kernel, rx, dir)
}
