// HTTP routes

pub mod chat;
pub mod health;
pub mod stream;

use crate::kernel::errors::CoreError;
use crate::kernel::jobs::{actor_id, ChatJob, Role};

/// Caller identity accompanying stream/events/cancel requests.
///
/// Authentication proper is outside the core; this check only enforces
/// that the supplied identity matches the job record so one actor cannot
/// read another's stream by guessing job ids.
#[derive(Debug, Clone, Default)]
pub struct CallerIdentity {
    pub role: Option<String>,
    pub teacher_id: Option<String>,
    pub student_id: Option<String>,
    pub session_id: Option<String>,
}

/// Verify the caller owns `job`: same role, same actor, same session.
pub fn authorize(job: &ChatJob, identity: &CallerIdentity) -> Result<(), CoreError> {
    let role = identity
        .role
        .as_deref()
        .and_then(Role::parse)
        .ok_or_else(CoreError::not_owner)?;
    if role != job.role {
        return Err(CoreError::not_owner());
    }

    let caller_actor = actor_id(
        role,
        identity.teacher_id.as_deref(),
        identity.student_id.as_deref(),
    );
    if caller_actor != job.actor_id() {
        return Err(CoreError::not_owner());
    }

    let caller_session = identity
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("session_main");
    if caller_session != job.session_id {
        return Err(CoreError::not_owner());
    }

    Ok(())
}
