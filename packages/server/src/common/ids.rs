//! Identifier sanitization, lane routing keys, and request fingerprints.
//!
//! External identifiers (request ids, session ids, actor ids) come from
//! clients and end up in filenames and store keys, so everything passes
//! through [`safe_fs_id`] first.

use sha2::{Digest, Sha256};

/// Maximum length of a sanitized identifier before it is shortened.
const MAX_ID_LEN: usize = 64;
/// Kept prefix when shortening, leaving room for the hash suffix.
const SHORTENED_PREFIX_LEN: usize = 48;

/// Sanitize an external identifier into a filesystem-safe token.
///
/// Keeps alphanumerics plus `-`, `_`, and `.`; every other character becomes
/// `_`. Empty or all-invalid input yields `<prefix>_unknown`. Inputs longer
/// than 64 characters are truncated and suffixed with a short content hash
/// so distinct long ids stay distinct.
pub fn safe_fs_id(raw: &str, prefix: &str) -> String {
    let sanitized: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() || sanitized.chars().all(|c| c == '_' || c == '.') {
        return format!("{prefix}_unknown");
    }

    if sanitized.len() > MAX_ID_LEN {
        let digest = Sha256::digest(raw.as_bytes());
        let suffix = hex::encode(&digest[..6]);
        return format!("{}-{}", &sanitized[..SHORTENED_PREFIX_LEN], suffix);
    }

    sanitized
}

/// Build a lane routing key from the actor coordinates.
///
/// A lane serializes all jobs of one logical actor in one session, e.g.
/// `teacher:T123:session_main`.
pub fn lane_id(role: &str, actor_id: &str, session_id: &str) -> String {
    let session = if session_id.trim().is_empty() {
        "session_main".to_string()
    } else {
        safe_fs_id(session_id, "session")
    };
    format!(
        "{}:{}:{}",
        role,
        safe_fs_id(actor_id, "actor"),
        session
    )
}

/// Stable fingerprint of an ingress request, used for short-window debounce.
///
/// Hashes the actor coordinates plus the trimmed content of the last user
/// message, so an accidental double-submit maps to the same fingerprint
/// while any edit to the message produces a new one.
pub fn request_fingerprint(role: &str, actor_id: &str, session_id: &str, tail: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(role.as_bytes());
    hasher.update(b"\n");
    hasher.update(actor_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(session_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(tail.trim().as_bytes());
    hex::encode(hasher.finalize())
}
