//! The chat processor: one job through the LLM tool loop.
//!
//! The processor owns everything between `job.processing` and the terminal
//! event: prompt assembly, gateway rounds, tool dispatch, and the
//! incremental `assistant.*` / `tool.*` events. The worker that called it
//! turns the returned outcome into the terminal event and status.

use llm_client::{ChatMessage, LlmRequest};
use tracing::{debug, warn};

use crate::kernel::chat_kernel::ChatKernel;
use crate::kernel::errors::ErrorKind;
use crate::kernel::event_log::EventType;
use crate::kernel::jobs::{ChatJob, JobStatus, Role};
use crate::kernel::tools::ToolContext;

/// How a processing run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorOutcome {
    Completed { reply: String },
    Cancelled,
    Failed { kind: ErrorKind, message: String },
}

/// Best-effort event append: a lost event must not mask the job's outcome.
fn emit(kernel: &ChatKernel, job_id: &str, event_type: EventType, payload: serde_json::Value) {
    if let Err(e) = kernel.events.append(job_id, event_type, payload) {
        warn!(job_id, event = event_type.as_str(), error = %e, "event append failed");
    }
}

fn build_system_prompt(job: &ChatJob) -> String {
    let mut prompt = String::from(
        "You are the assistant of a physics teaching platform. \
         Answer in the language the user writes in. Use the available tools \
         to look up real data instead of guessing; cite tool results when \
         you rely on them.\n",
    );
    match job.role {
        Role::Teacher => {
            prompt.push_str(
                "The user is a teacher. You may help with exam analysis, \
                 assignment preparation, and class records.\n",
            );
            if let Some(teacher_id) = &job.teacher_id {
                prompt.push_str(&format!("Teacher id: {teacher_id}\n"));
            }
        }
        Role::Student => {
            prompt.push_str(
                "The user is a student. Coach them toward the answer instead \
                 of handing it over; keep explanations at their level.\n",
            );
            if let Some(student_id) = &job.student_id {
                prompt.push_str(&format!("Student id: {student_id}\n"));
            }
        }
    }
    prompt.push_str(&format!("Session: {}\n", job.session_id));
    prompt
}

/// Assemble the conversation: system prompt plus the newest turns, capped
/// at the configured message budget.
fn build_messages(kernel: &ChatKernel, job: &ChatJob) -> Vec<ChatMessage> {
    let cap = kernel.config.max_messages;
    let history = if job.messages.len() > cap {
        &job.messages[job.messages.len() - cap..]
    } else {
        &job.messages[..]
    };

    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::system(build_system_prompt(job)));
    messages.extend(history.iter().cloned());
    messages
}

/// Whether the job was cancelled out from under us. Checked before every
/// gateway round so a cancel takes effect at the next round boundary.
fn cancelled(kernel: &ChatKernel, job_id: &str) -> bool {
    match kernel.jobs.load(job_id) {
        Ok(Some(job)) => job.status == JobStatus::Cancelled,
        Ok(None) => false,
        Err(e) => {
            warn!(job_id, error = %e, "cancellation check failed");
            false
        }
    }
}

/// Run the tool loop for one job.
pub async fn run(kernel: &ChatKernel, job: &ChatJob) -> ProcessorOutcome {
    let job_id = job.job_id.as_str();
    let tool_defs = kernel.tools.definitions(job.role, None);
    let context = ToolContext {
        role: job.role,
        teacher_id: job.teacher_id.clone(),
        student_id: job.student_id.clone(),
        audit_tag: job_id.to_string(),
    };

    let mut messages = build_messages(kernel, job);
    let mut rounds: u32 = 0;
    let mut calls_made: u32 = 0;

    loop {
        if cancelled(kernel, job_id) {
            debug!(job_id, "cancelled between rounds");
            return ProcessorOutcome::Cancelled;
        }

        let request = LlmRequest::new(messages.clone()).with_tools(tool_defs.clone());
        let response = match kernel.gateway.generate(request).await {
            Ok(response) => response,
            Err(e) => {
                return ProcessorOutcome::Failed {
                    kind: ErrorKind::GatewayFailure,
                    message: e.to_string(),
                };
            }
        };

        if !response.has_tool_calls() {
            let reply = response.text;
            emit(
                kernel,
                job_id,
                EventType::AssistantDelta,
                serde_json::json!({"content": reply}),
            );
            emit(
                kernel,
                job_id,
                EventType::AssistantDone,
                serde_json::json!({"content": reply, "usage": response.usage}),
            );
            return ProcessorOutcome::Completed { reply };
        }

        rounds += 1;
        calls_made += response.tool_calls.len() as u32;
        if rounds > kernel.config.max_tool_rounds || calls_made > kernel.config.max_tool_calls {
            return ProcessorOutcome::Failed {
                kind: ErrorKind::ToolBudgetExceeded,
                message: format!(
                    "tool budget exceeded: {rounds} rounds, {calls_made} calls"
                ),
            };
        }

        // Echo the assistant's tool-call turn into history before results.
        messages.push(ChatMessage::assistant_tool_calls(
            response.tool_calls.iter().map(|c| c.to_payload()).collect(),
        ));

        for call in &response.tool_calls {
            let args_value: serde_json::Value = serde_json::from_str(&call.arguments)
                .unwrap_or_else(|_| serde_json::Value::String(call.arguments.clone()));

            let issues = kernel.tools.validate(&call.name, &call.arguments);
            let result = if issues.is_empty() {
                emit(
                    kernel,
                    job_id,
                    EventType::ToolStart,
                    serde_json::json!({"tool": call.name, "arguments": args_value}),
                );
                kernel
                    .tools
                    .dispatch(&call.name, &call.arguments, &context, None)
                    .await
            } else {
                serde_json::json!({
                    "error": "invalid_arguments",
                    "tool": call.name,
                    "issues": issues,
                })
            };

            emit(
                kernel,
                job_id,
                EventType::ToolResult,
                serde_json::json!({"tool": call.name, "result": result}),
            );

            let result_text = result.to_string();
            messages.push(ChatMessage::tool_result(call.id.clone(), result_text));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_support::{test_kernel, MockGateway};
    use llm_client::{LlmResponse, ToolCall};

    fn job_with(messages: Vec<ChatMessage>) -> ChatJob {
        ChatJob::new(
            Role::Student,
            "session_main".to_string(),
            None,
            Some("s1".to_string()),
            None,
            messages,
            vec![],
        )
    }

    fn text_response(text: &str) -> LlmResponse {
        LlmResponse {
            text: text.to_string(),
            ..Default::default()
        }
    }

    fn tool_response(name: &str, arguments: &str) -> LlmResponse {
        LlmResponse {
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_plain_reply() {
        let (kernel, _rx, _dir) =
            test_kernel(MockGateway::scripted(vec![Ok(text_response("42"))]));
        let job = job_with(vec![ChatMessage::user("what is 6*7?")]);
        kernel.jobs.create(&job).unwrap();

        let outcome = run(&kernel, &job).await;
        assert_eq!(
            outcome,
            ProcessorOutcome::Completed {
                reply: "42".to_string()
            }
        );

        let events = kernel.events.load(&job.job_id, 0, 100);
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![EventType::AssistantDelta, EventType::AssistantDone]
        );
    }

    #[tokio::test]
    async fn test_tool_round_then_reply() {
        let (kernel, _rx, _dir) = test_kernel(MockGateway::scripted(vec![
            Ok(tool_response("example.lookup", r#"{"query": "energy"}"#)),
            Ok(text_response("found it")),
        ]));
        let job = job_with(vec![ChatMessage::user("look up energy")]);
        kernel.jobs.create(&job).unwrap();

        let outcome = run(&kernel, &job).await;
        assert!(matches!(outcome, ProcessorOutcome::Completed { .. }));

        let events = kernel.events.load(&job.job_id, 0, 100);
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::ToolStart,
                EventType::ToolResult,
                EventType::AssistantDelta,
                EventType::AssistantDone,
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_arguments_skip_tool_start() {
        let (kernel, _rx, _dir) = test_kernel(MockGateway::scripted(vec![
            Ok(tool_response("example.lookup", r#"{"wrong": true}"#)),
            Ok(text_response("recovered")),
        ]));
        let job = job_with(vec![ChatMessage::user("bad args")]);
        kernel.jobs.create(&job).unwrap();

        let outcome = run(&kernel, &job).await;
        assert!(matches!(outcome, ProcessorOutcome::Completed { .. }));

        let events = kernel.events.load(&job.job_id, 0, 100);
        assert_eq!(events[0].event_type, EventType::ToolResult);
        assert_eq!(events[0].payload["result"]["error"], "invalid_arguments");
    }

    #[tokio::test]
    async fn test_round_budget_exceeded() {
        // The model asks for tools forever; the cap is 5 rounds.
        let responses = (0..6)
            .map(|_| Ok(tool_response("example.lookup", r#"{"query": "again"}"#)))
            .collect();
        let (kernel, _rx, _dir) = test_kernel(MockGateway::scripted(responses));
        let job = job_with(vec![ChatMessage::user("loop forever")]);
        kernel.jobs.create(&job).unwrap();

        let outcome = run(&kernel, &job).await;
        assert!(matches!(
            outcome,
            ProcessorOutcome::Failed {
                kind: ErrorKind::ToolBudgetExceeded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_call_budget_exceeded() {
        // 13 calls in one round blows the 12-call budget.
        let calls: Vec<ToolCall> = (0..13)
            .map(|i| ToolCall {
                id: format!("call_{i}"),
                name: "example.lookup".to_string(),
                arguments: r#"{"query": "x"}"#.to_string(),
            })
            .collect();
        let response = LlmResponse {
            tool_calls: calls,
            ..Default::default()
        };
        let (kernel, _rx, _dir) = test_kernel(MockGateway::scripted(vec![Ok(response)]));
        let job = job_with(vec![ChatMessage::user("wide round")]);
        kernel.jobs.create(&job).unwrap();

        let outcome = run(&kernel, &job).await;
        assert!(matches!(
            outcome,
            ProcessorOutcome::Failed {
                kind: ErrorKind::ToolBudgetExceeded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_gateway_failure() {
        let (kernel, _rx, _dir) = test_kernel(MockGateway::scripted(vec![Err(
            llm_client::LlmError::Network("connect refused".into()),
        )]));
        let job = job_with(vec![ChatMessage::user("hi")]);
        kernel.jobs.create(&job).unwrap();

        let outcome = run(&kernel, &job).await;
        assert!(matches!(
            outcome,
            ProcessorOutcome::Failed {
                kind: ErrorKind::GatewayFailure,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancellation_between_rounds() {
        let (kernel, _rx, _dir) =
            test_kernel(MockGateway::scripted(vec![Ok(text_response("unused"))]));
        let job = job_with(vec![ChatMessage::user("hi")]);
        kernel.jobs.create(&job).unwrap();
        kernel
            .jobs
            .set_status(&job.job_id, JobStatus::Cancelled)
            .unwrap();

        let outcome = run(&kernel, &job).await;
        assert_eq!(outcome, ProcessorOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_role_gate_denies_teacher_tool_for_student() {
        let (kernel, _rx, _dir) = test_kernel(MockGateway::scripted(vec![
            Ok(tool_response("exam.metrics", r#"{"exam_id": "e1"}"#)),
            Ok(text_response("sorry")),
        ]));
        let job = job_with(vec![ChatMessage::user("show me exam stats")]);
        kernel.jobs.create(&job).unwrap();

        let outcome = run(&kernel, &job).await;
        assert!(matches!(outcome, ProcessorOutcome::Completed { .. }));

        let events = kernel.events.load(&job.job_id, 0, 100);
        let result_event = events
            .iter()
            .find(|e| e.event_type == EventType::ToolResult)
            .unwrap();
        assert_eq!(result_event.payload["result"]["error"], "permission denied");
    }

    #[test]
    fn test_history_truncated_to_budget() {
        let (kernel, _rx, _dir) = test_kernel(MockGateway::scripted(vec![]));
        let mut turns = Vec::new();
        for i in 0..40 {
            turns.push(ChatMessage::user(format!("turn {i}")));
        }
        let job = job_with(turns);

        let messages = build_messages(&kernel, &job);
        // system prompt + the newest max_messages turns
        assert_eq!(messages.len(), kernel.config.max_messages + 1);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages.last().unwrap().content.as_deref(), Some("turn 39"));
    }
}
