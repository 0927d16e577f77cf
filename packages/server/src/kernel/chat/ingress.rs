//! Request-to-job ingress.
//!
//! Turns a validated POST body into a job record on the right lane:
//! idempotency lookup, fingerprint debounce, saturation check, record
//! creation, lane enqueue, dispatch. Repeated submissions with the same
//! `request_id` return the existing job without creating a new record.

use llm_client::ChatMessage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::common::{lane_id, request_fingerprint};
use crate::kernel::chat_kernel::ChatKernel;
use crate::kernel::errors::CoreError;
use crate::kernel::event_log::EventType;
use crate::kernel::jobs::{actor_id, ChatJob, Role};

/// POST /chat body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub role: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub teacher_id: Option<String>,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub attachment_ids: Option<Vec<String>>,
}

/// What the caller gets back from ingress.
#[derive(Debug, Clone, Serialize)]
pub struct IngressReceipt {
    pub job_id: String,
    pub lane_id: String,
    pub lane_queue_position: usize,
    pub lane_queue_size: usize,
    /// True when an existing job was returned instead of a new one.
    #[serde(skip)]
    pub existing: bool,
}

struct ValidatedRequest {
    role: Role,
    actor: String,
    session_id: String,
    lane_id: String,
    messages: Vec<ChatMessage>,
    attachment_ids: Vec<String>,
    request_id: Option<String>,
    teacher_id: Option<String>,
    student_id: Option<String>,
}

fn validate(kernel: &ChatKernel, request: ChatRequest) -> Result<ValidatedRequest, CoreError> {
    let role = Role::parse(&request.role)
        .ok_or_else(|| CoreError::validation(format!("unsupported role: {}", request.role)))?;

    if request.messages.is_empty() {
        return Err(CoreError::validation("messages must not be empty"));
    }
    let mut messages = Vec::with_capacity(request.messages.len());
    for mut message in request.messages {
        if !matches!(message.role.as_str(), "user" | "assistant" | "system") {
            return Err(CoreError::validation(format!(
                "unsupported message role: {}",
                message.role
            )));
        }
        if let Some(content) = &message.content {
            if content.chars().count() > kernel.config.max_message_chars {
                message.content =
                    Some(content.chars().take(kernel.config.max_message_chars).collect());
            }
        }
        messages.push(message);
    }
    if !messages.iter().any(|m| m.role == "user") {
        return Err(CoreError::validation("at least one user message is required"));
    }

    let attachment_ids = request.attachment_ids.unwrap_or_default();
    for id in &attachment_ids {
        let valid = !id.is_empty()
            && id.len() <= 64
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(CoreError::validation(format!("invalid attachment id: {id}")));
        }
    }

    let session_id = request
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("session_main")
        .to_string();
    let actor = actor_id(role, request.teacher_id.as_deref(), request.student_id.as_deref());
    let lane = lane_id(role.as_str(), &actor, &session_id);

    Ok(ValidatedRequest {
        role,
        actor,
        session_id,
        lane_id: lane,
        messages,
        attachment_ids,
        request_id: request
            .request_id
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty()),
        teacher_id: request.teacher_id,
        student_id: request.student_id,
    })
}

async fn receipt_for_existing(
    kernel: &ChatKernel,
    job_id: String,
    lane: &str,
) -> Result<IngressReceipt, CoreError> {
    let position = kernel.lanes.find_position(lane, &job_id).await?;
    let load = kernel.lanes.lane_load(lane).await?;
    Ok(IngressReceipt {
        job_id,
        lane_id: lane.to_string(),
        lane_queue_position: position,
        lane_queue_size: load.queued,
        existing: true,
    })
}

/// Submit a chat request, creating a job or returning an existing one.
pub async fn submit(
    kernel: &ChatKernel,
    request: ChatRequest,
) -> Result<IngressReceipt, CoreError> {
    let request = validate(kernel, request)?;
    let lane = request.lane_id.clone();

    // Idempotent retry: same request_id maps to the same job.
    if let Some(request_id) = &request.request_id {
        if let Some(job_id) = kernel
            .requests
            .get(request_id, |id| kernel.jobs.exists(id))
        {
            debug!(request_id, job_id, "idempotency hit");
            return receipt_for_existing(kernel, job_id, &lane).await;
        }
    }

    // Debounce: an identical submission inside the window reuses the job.
    let tail = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .and_then(|m| m.content.as_deref())
        .unwrap_or_default();
    let fingerprint =
        request_fingerprint(request.role.as_str(), &request.actor, &request.session_id, tail);
    if let Some(job_id) = kernel.lanes.recent_job(&lane, &fingerprint).await? {
        if kernel.jobs.exists(&job_id) {
            debug!(job_id, lane, "debounce hit");
            return receipt_for_existing(kernel, job_id, &lane).await;
        }
    }

    // Back-pressure before any record is created.
    let load = kernel.lanes.lane_load(&lane).await?;
    if load.queued >= kernel.config.lane_max_queue {
        return Err(CoreError::lane_saturated(&lane));
    }

    let job = ChatJob::new(
        request.role,
        request.session_id,
        request.teacher_id,
        request.student_id,
        request.request_id.clone(),
        request.messages,
        request.attachment_ids,
    );
    let job_id = job.job_id.clone();
    kernel.jobs.create(&job)?;
    kernel
        .events
        .append(&job_id, EventType::JobQueued, serde_json::json!({"lane_id": lane}))?;

    // Lost the request-map race: another ingress created the job first.
    // Our record was never enqueued, so drop it and return the winner.
    if let Some(request_id) = &request.request_id {
        if !kernel.requests.set_if_absent(request_id, &job_id) {
            if let Some(winner) = kernel
                .requests
                .get(request_id, |id| kernel.jobs.exists(id))
            {
                if winner != job_id {
                    kernel.jobs.remove(&job_id);
                    return receipt_for_existing(kernel, winner, &lane).await;
                }
            }
        }
    }

    kernel
        .lanes
        .register_recent(&lane, &fingerprint, &job_id)
        .await?;

    let (info, dispatch) = kernel.lanes.enqueue(&job_id, &lane).await?;
    if dispatch {
        kernel.dispatch(&job_id, &lane);
    }

    info!(
        job_id,
        lane,
        position = info.lane_queue_position,
        dispatched = dispatch,
        "chat job accepted"
    );

    Ok(IngressReceipt {
        job_id,
        lane_id: lane,
        lane_queue_position: info.lane_queue_position,
        lane_queue_size: info.lane_queue_size,
        existing: false,
    })
}
