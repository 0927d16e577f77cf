//! Gateway targets and timeout resolution.
//!
//! A target is one provider endpoint the gateway may send a request to.
//! The gateway tries the primary target first, then walks the fallback
//! chain in order.

use std::time::Duration;

const DEFAULT_READ_TIMEOUT_SEC: f64 = 120.0;
const MAX_READ_TIMEOUT_SEC: f64 = 300.0;
const MAX_CONNECT_TIMEOUT_SEC: f64 = 120.0;

/// One LLM endpoint the gateway can call.
#[derive(Debug, Clone)]
pub struct Target {
    pub provider: String,
    pub model: String,
    /// Base URL; the chat completions path is appended.
    pub base_url: String,
    pub api_key: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Attempts per target, including the first. Clamped to at least 1.
    pub retries: u32,
}

impl Target {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let (connect, read) = resolve_timeouts(None, None, None);
        Self {
            provider: provider.into(),
            model: model.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            connect_timeout: connect,
            read_timeout: read,
            retries: 2,
        }
    }

    pub fn with_timeouts(
        mut self,
        timeout: Option<&str>,
        connect: Option<&str>,
        read: Option<&str>,
    ) -> Self {
        let (connect, read) = resolve_timeouts(timeout, connect, read);
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }
}

/// Parse a raw timeout string; "none"/"0"/"inf"/empty/garbage all mean
/// "no usable value" and fall through to the default.
fn parse_timeout_candidate(raw: Option<&str>) -> Option<f64> {
    let text = raw?.trim().to_ascii_lowercase();
    if text.is_empty() || matches!(text.as_str(), "0" | "none" | "inf" | "infinite" | "null") {
        return None;
    }
    text.parse::<f64>().ok()
}

fn clamp_timeout(value: Option<f64>, default: f64, max: f64) -> f64 {
    let parsed = match value {
        Some(v) if v > 0.0 => v,
        _ => default,
    };
    parsed.clamp(1.0, max)
}

/// Resolve (connect, read) timeouts from raw config strings.
///
/// Read defaults to 120 s within [1, 300]. Connect defaults to
/// `min(10, read)` within [1, 120] and is never allowed above read, so a
/// short read timeout also bounds connection establishment.
pub fn resolve_timeouts(
    timeout: Option<&str>,
    connect: Option<&str>,
    read: Option<&str>,
) -> (Duration, Duration) {
    let base_read = clamp_timeout(
        parse_timeout_candidate(timeout),
        DEFAULT_READ_TIMEOUT_SEC,
        MAX_READ_TIMEOUT_SEC,
    );
    let read_sec = clamp_timeout(parse_timeout_candidate(read), base_read, MAX_READ_TIMEOUT_SEC);
    let connect_default = read_sec.min(10.0);
    let connect_sec = clamp_timeout(
        parse_timeout_candidate(connect),
        connect_default,
        MAX_CONNECT_TIMEOUT_SEC,
    )
    .min(read_sec);
    (
        Duration::from_secs_f64(connect_sec),
        Duration::from_secs_f64(read_sec),
    )
}
