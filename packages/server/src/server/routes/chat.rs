//! Chat ingress, cancel, and the non-streaming events endpoint.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::kernel::chat::{self, ChatRequest, IngressReceipt};
use crate::kernel::errors::CoreError;
use crate::kernel::event_log::{ChatEvent, EventLog};
use crate::kernel::jobs::JobStatus;
use crate::server::app::AppState;
use crate::server::error::ApiError;
use crate::server::routes::{authorize, CallerIdentity};

/// POST /chat
pub async fn submit_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<IngressReceipt>, ApiError> {
    let receipt = chat::submit(&state.kernel, request).await?;
    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub job_id: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub teacher_id: Option<String>,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: String,
    pub status: &'static str,
}

/// POST /chat/cancel: flip a non-terminal job to `cancelled`.
///
/// Only the record is updated here; the terminal `job.cancelled` event is
/// appended by the worker that next touches the job, keeping the event log
/// single-writer. The signal nudge lets attached streams notice promptly.
pub async fn cancel_handler(
    State(state): State<AppState>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<CancelResponse>, ApiError> {
    let kernel = &state.kernel;
    let job = kernel
        .jobs
        .load(&request.job_id)?
        .ok_or_else(|| CoreError::not_found(&request.job_id))?;

    let identity = CallerIdentity {
        role: request.role,
        teacher_id: request.teacher_id,
        student_id: request.student_id,
        session_id: request.session_id,
    };
    authorize(&job, &identity)?;

    if job.status.is_terminal() {
        return Ok(Json(CancelResponse {
            job_id: job.job_id,
            status: job.status.as_str(),
        }));
    }

    kernel
        .jobs
        .set_status(&job.job_id, JobStatus::Cancelled)?;
    kernel.signals.notify(&job.job_id);
    info!(job_id = %job.job_id, "chat job cancelled");

    Ok(Json(CancelResponse {
        job_id: job.job_id,
        status: "cancelled",
    }))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub job_id: String,
    #[serde(default)]
    pub after_event_id: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub teacher_id: Option<String>,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<ChatEvent>,
    pub next_offset: u64,
}

/// GET /chat/events: one JSON page of a job's event log.
pub async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    let kernel = &state.kernel;
    let job = kernel
        .jobs
        .load(&query.job_id)?
        .ok_or_else(|| CoreError::not_found(&query.job_id))?;

    let identity = CallerIdentity {
        role: query.role,
        teacher_id: query.teacher_id,
        student_id: query.student_id,
        session_id: query.session_id,
    };
    authorize(&job, &identity)?;

    let (events, next_offset) = kernel.events.load_incremental(
        &query.job_id,
        query.after_event_id.unwrap_or(0),
        query.offset,
        query.limit.unwrap_or_else(EventLog::default_limit),
    );

    Ok(Json(EventsResponse {
        events,
        next_offset,
    }))
}
