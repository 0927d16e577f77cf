//! SSE streaming endpoint.
//!
//! GET /chat/stream?job_id=…&last_event_id=N
//!
//! Replays events past the client's cursor, then tails the job by blocking
//! on its signal, emitting each event as an SSE frame:
//!
//! ```text
//! id: <event_id>
//! event: <type>
//! data: {"event_id":N,"event_version":1,"type":T,"payload":P}
//! ```
//!
//! The effective cursor is the larger of the `last_event_id` query param
//! and the `Last-Event-ID` header (what EventSource sends on reconnect);
//! malformed values are ignored. The stream closes after a terminal event.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::kernel::chat_kernel::ChatKernel;
use crate::kernel::errors::CoreError;
use crate::kernel::event_log::{sse_data, ChatEvent, EventLog};
use crate::server::app::AppState;
use crate::server::error::ApiError;
use crate::server::routes::{authorize, CallerIdentity};

/// How long one signal wait blocks before re-checking the log anyway.
/// Kept short so a cleared signal entry (terminal event racing the tail
/// loop) costs at most one wait interval.
const TAIL_WAIT: Duration = Duration::from_secs(1);
/// Grace wait for the terminal event when the record is already terminal.
const TERMINAL_GRACE: Duration = Duration::from_secs(1);
/// Re-send the `retry:` hint roughly this often, in tail iterations.
const RETRY_HINT_INTERVAL: u32 = 15;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub job_id: String,
    #[serde(default)]
    pub last_event_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub teacher_id: Option<String>,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// GET /chat/stream
pub async fn stream_handler(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<ReceiverStream<Result<Event, Infallible>>>, ApiError> {
    let kernel = state.kernel.clone();
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

    let cursor = effective_cursor(query.last_event_id.as_deref(), &headers);

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(32);
    tokio::spawn(tail_job(kernel, query.job_id, cursor, tx));

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

/// max(query param, Last-Event-ID header), ignoring anything unparseable.
fn effective_cursor(query_value: Option<&str>, headers: &HeaderMap) -> u64 {
    let from_query = query_value.and_then(|v| v.trim().parse::<u64>().ok());
    let from_header = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    from_query.unwrap_or(0).max(from_header.unwrap_or(0))
}

fn frame(event: &ChatEvent) -> Event {
    Event::default()
        .id(event.event_id.to_string())
        .event(event.event_type.as_str())
        .data(sse_data(event).to_string())
}

/// Replay-then-tail loop feeding the SSE channel.
///
/// Exits on: a terminal event, a terminal job record with a drained log
/// (cancel can terminate a job that never ran), or client disconnect.
async fn tail_job(
    kernel: Arc<ChatKernel>,
    job_id: String,
    mut cursor: u64,
    tx: mpsc::Sender<Result<Event, Infallible>>,
) {
    // Reconnect backoff hint for EventSource clients.
    let retry_hint = || Event::default().retry(Duration::from_millis(1000));
    if tx.send(Ok(retry_hint())).await.is_err() {
        return;
    }

    let mut offset: Option<u64> = None;
    let mut version: u64 = 0;
    let mut grace_used = false;
    let mut iterations: u32 = 0;

    loop {
        if tx.is_closed() {
            debug!(job_id, "stream client disconnected");
            return;
        }

        let (events, next_offset) =
            kernel
                .events
                .load_incremental(&job_id, cursor, offset, EventLog::default_limit());
        offset = Some(next_offset);

        let mut saw_terminal = false;
        for event in &events {
            cursor = event.event_id;
            saw_terminal |= event.event_type.is_terminal();
            if tx.send(Ok(frame(event))).await.is_err() {
                return;
            }
        }
        if saw_terminal {
            return;
        }

        // A terminal record without a terminal event: either the worker is
        // appending it right now (grace catches it) or it never will
        // (cancelled before any worker touched it) — close either way.
        let record_terminal = matches!(
            kernel.jobs.load(&job_id),
            Ok(Some(job)) if job.status.is_terminal()
        );
        if record_terminal {
            if grace_used {
                return;
            }
            grace_used = true;
            version = kernel
                .events
                .wait_for_activity(&job_id, version, TERMINAL_GRACE)
                .await;
            continue;
        }

        version = kernel
            .events
            .wait_for_activity(&job_id, version, TAIL_WAIT)
            .await;

        iterations += 1;
        if iterations % RETRY_HINT_INTERVAL == 0 {
            if tx.send(Ok(retry_hint())).await.is_err() {
                return;
            }
        }
    }
}
