//! The LLM gateway: ordered targets, bounded retries, fallback chain.
//!
//! Retry policy: transient failures (connect errors, timeouts, 408/409/425/
//! 429, 5xx) are retried on the same target with exponential backoff plus
//! jitter. Once a target's attempts are exhausted the gateway falls through
//! to the next target in the chain. Non-transient errors skip straight to
//! the next target.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{LlmError, Result};
use crate::target::Target;
use crate::types::{LlmRequest, LlmResponse, ToolCall, Usage};

const BACKOFF_BASE_SEC: f64 = 0.25;
const BACKOFF_CAP_SEC: f64 = 4.0;

/// The seam the orchestration core consumes. Workers and tests depend on
/// this trait, never on `HttpGateway` directly.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse>;
}

/// HTTP gateway over one or more OpenAI-compatible targets.
pub struct HttpGateway {
    targets: Vec<(Target, reqwest::Client)>,
}

impl HttpGateway {
    /// Build a gateway from an ordered target list (primary first).
    pub fn new(targets: Vec<Target>) -> Result<Self> {
        if targets.is_empty() {
            return Err(LlmError::Config("no gateway targets configured".into()));
        }
        let mut built = Vec::with_capacity(targets.len());
        for target in targets {
            let client = reqwest::Client::builder()
                .connect_timeout(target.connect_timeout)
                .timeout(target.read_timeout)
                .build()
                .map_err(|e| LlmError::Config(format!("http client build failed: {e}")))?;
            built.push((target, client));
        }
        Ok(Self { targets: built })
    }

    async fn call_target(
        &self,
        target: &Target,
        client: &reqwest::Client,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let mut body = serde_json::json!({
            "model": target.model,
            "messages": request.messages,
        });
        if let Some(tools) = &request.tools {
            body["tools"] = serde_json::Value::Array(tools.clone());
            body["tool_choice"] = serde_json::json!(request
                .tool_choice
                .as_deref()
                .unwrap_or("auto"));
        }
        if let Some(schema) = &request.json_schema {
            body["response_format"] = serde_json::json!({
                "type": "json_schema",
                "json_schema": schema,
            });
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        let response = client
            .post(format!(
                "{}/chat/completions",
                target.base_url.trim_end_matches('/')
            ))
            .header("Authorization", format!("Bearer {}", target.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: truncate(&message, 500),
            });
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        parse_chat_completion(&value)
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        let mut last_error: Option<LlmError> = None;

        for (target, client) in &self.targets {
            let attempts = target.retries.max(1);
            for attempt in 0..attempts {
                debug!(
                    provider = %target.provider,
                    model = %target.model,
                    attempt = attempt + 1,
                    "gateway attempt"
                );
                match self.call_target(target, client, &request).await {
                    Ok(response) => return Ok(response),
                    Err(err) => {
                        let retry_same = attempt + 1 < attempts && err.is_retryable();
                        warn!(
                            provider = %target.provider,
                            model = %target.model,
                            error = %err,
                            retry_same_target = retry_same,
                            "gateway attempt failed"
                        );
                        last_error = Some(err);
                        if retry_same {
                            tokio::time::sleep(backoff_delay(attempt)).await;
                            continue;
                        }
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LlmError::Config("no gateway targets configured".into())))
    }
}

/// Bounded exponential backoff with jitter: 0.25 s doubling, capped at 4 s.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_SEC * f64::from(2u32.saturating_pow(attempt.min(16)));
    let jitter = rand::thread_rng().gen_range(0.0..0.25);
    Duration::from_secs_f64((base + jitter).min(BACKOFF_CAP_SEC))
}

/// Parse a chat-completions response body into the unified shape.
pub(crate) fn parse_chat_completion(value: &serde_json::Value) -> Result<LlmResponse> {
    let message = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| LlmError::Parse("no message in response".into()))?;

    let text = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let tool_calls: Vec<ToolCall> = message
        .get("tool_calls")
        .and_then(|tc| tc.as_array())
        .map(|calls| calls.iter().filter_map(ToolCall::from_wire).collect())
        .unwrap_or_default();

    let usage: Usage = value
        .get("usage")
        .and_then(|u| serde_json::from_value(u.clone()).ok())
        .unwrap_or_default();

    let finish_reason = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finish_reason"))
        .and_then(|r| r.as_str())
        .map(str::to_string);

    Ok(LlmResponse {
        text,
        tool_calls,
        usage,
        finish_reason,
    })
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
