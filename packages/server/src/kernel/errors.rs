//! Error kinds the core defines.
//!
//! One closed set shared by the HTTP surface (status mapping) and the job
//! lifecycle (terminal `job.failed` payloads).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed ingress body, invalid attachment id, unsupported role.
    Validation,
    /// Lane queue depth exceeded; retry later.
    LaneSaturated,
    /// Caller does not own the targeted job.
    NotOwner,
    /// Unknown job id.
    NotFound,
    /// Tool argument schema validation failed (lives inside the job, not
    /// on the HTTP surface).
    ToolInvalidArguments,
    /// Tool round/call budget exhausted.
    ToolBudgetExceeded,
    /// The gateway exhausted retries and fallbacks.
    GatewayFailure,
    /// Retried at lower levels; never surfaced.
    Transient,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::LaneSaturated => "lane_saturated",
            ErrorKind::NotOwner => "not_owner",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ToolInvalidArguments => "tool_invalid_arguments",
            ErrorKind::ToolBudgetExceeded => "tool_budget_exceeded",
            ErrorKind::GatewayFailure => "gateway_failure",
            ErrorKind::Transient => "transient",
            ErrorKind::Internal => "internal",
        }
    }
}

/// A kinded error crossing a core boundary.
#[derive(Debug, Clone, Error)]
#[error("{}: {message}", kind.as_str())]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(job_id: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("unknown job: {job_id}"))
    }

    pub fn not_owner() -> Self {
        Self::new(ErrorKind::NotOwner, "caller does not own this job")
    }

    pub fn lane_saturated(lane_id: &str) -> Self {
        Self::new(
            ErrorKind::LaneSaturated,
            format!("lane {lane_id} is saturated; retry later"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(error.to_string())
    }
}
