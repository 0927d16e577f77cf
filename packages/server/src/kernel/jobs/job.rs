//! The chat job record.

use chrono::{DateTime, Utc};
use llm_client::ChatMessage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::lane_id;
use crate::kernel::errors::ErrorKind;

/// Who is speaking to the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Terminal error recorded on a failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

/// One chat request, persisted as `job.json` inside the job directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatJob {
    pub job_id: String,
    pub role: Role,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teacher_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub attachment_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
    pub lane_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl ChatJob {
    /// Create a fresh queued job with a host-generated id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: Role,
        session_id: String,
        teacher_id: Option<String>,
        student_id: Option<String>,
        request_id: Option<String>,
        messages: Vec<ChatMessage>,
        attachment_ids: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        let actor = actor_id(role, teacher_id.as_deref(), student_id.as_deref());
        let lane = lane_id(role.as_str(), &actor, &session_id);
        Self {
            job_id: format!("job_{}", Uuid::new_v4().simple()),
            role,
            session_id,
            teacher_id,
            student_id,
            request_id,
            messages,
            attachment_ids,
            created_at: now,
            updated_at: now,
            status: JobStatus::Queued,
            lane_id: lane,
            reply: None,
            error: None,
        }
    }

    /// The actor coordinate this job routes on.
    pub fn actor_id(&self) -> String {
        actor_id(self.role, self.teacher_id.as_deref(), self.student_id.as_deref())
    }

    /// Content of the last user turn, used for fingerprints and history.
    pub fn last_user_content(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .and_then(|m| m.content.as_deref())
            .unwrap_or_default()
    }
}

/// Resolve the actor id for a role, falling back to the role name itself
/// for single-actor deployments that never send explicit ids.
pub fn actor_id(role: Role, teacher_id: Option<&str>, student_id: Option<&str>) -> String {
    let explicit = match role {
        Role::Teacher => teacher_id,
        Role::Student => student_id,
    };
    match explicit.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => role.as_str().to_string(),
    }
}
