//! Application configuration loaded from environment variables.
//!
//! Numeric parsing is forgiving: an unparseable value falls back to the
//! default, and each knob has a floor so misconfiguration cannot disable a
//! safety bound entirely.

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Result};
use dotenvy::dotenv;

use llm_client::Target;

/// Which lane-store backend the process runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackendKind {
    /// In-process store; single-host only.
    Inline,
    /// Redis-backed store shared across processes.
    Redis,
}

impl QueueBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueBackendKind::Inline => "inline",
            QueueBackendKind::Redis => "redis",
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for job records, request maps, and session history.
    pub data_dir: PathBuf,
    pub port: u16,

    pub worker_pool_size: usize,
    pub lane_max_queue: usize,
    pub lane_debounce_ms: u64,
    pub claim_ttl_sec: u64,
    pub signal_max_entries: usize,
    pub signal_ttl_sec: u64,
    pub max_tool_rounds: u32,
    pub max_tool_calls: u32,
    pub max_messages: usize,
    pub max_message_chars: usize,
    pub pending_scan_interval_sec: u64,
    pub session_index_max_items: usize,

    pub queue_backend: QueueBackendKind,
    pub redis_url: String,
    pub tenant_id: String,

    pub app_env: String,
    pub allow_inline_fallback_in_prod: bool,

    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_timeout_sec: Option<String>,
    pub llm_connect_timeout_sec: Option<String>,
    pub llm_retries: u32,
    pub llm_fallback_models: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let config = Self {
            data_dir: PathBuf::from(env_str("CHAT_DATA_DIR", "./data")),
            port: env_parse("PORT", 8080u16),

            worker_pool_size: env_parse("CHAT_WORKER_POOL_SIZE", 4usize).max(1),
            lane_max_queue: env_parse("CHAT_LANE_MAX_QUEUE", 6usize).max(1),
            lane_debounce_ms: env_parse("CHAT_LANE_DEBOUNCE_MS", 500u64),
            claim_ttl_sec: env_parse("CHAT_JOB_CLAIM_TTL_SEC", 600u64).max(10),
            signal_max_entries: env_parse("CHAT_STREAM_SIGNAL_MAX_ENTRIES", 4096usize).max(1),
            signal_ttl_sec: env_parse("CHAT_STREAM_SIGNAL_TTL_SEC", 1800u64).max(1),
            max_tool_rounds: env_parse("CHAT_MAX_TOOL_ROUNDS", 5u32).max(1),
            max_tool_calls: env_parse("CHAT_MAX_TOOL_CALLS", 12u32).max(1),
            max_messages: env_parse("CHAT_MAX_MESSAGES", 14usize).max(4),
            max_message_chars: env_parse("CHAT_MAX_MESSAGE_CHARS", 2000usize).max(256),
            pending_scan_interval_sec: env_parse("CHAT_PENDING_SCAN_INTERVAL_SEC", 60u64).max(5),
            session_index_max_items: env_parse("SESSION_INDEX_MAX_ITEMS", 500usize).max(50),

            queue_backend: parse_backend(&env_str("JOB_QUEUE_BACKEND", "inline")),
            redis_url: env_str("REDIS_URL", "redis://localhost:6379/0"),
            tenant_id: non_empty(env_str("TENANT_ID", ""), "default"),

            app_env: env_str("APP_ENV", "development").trim().to_lowercase(),
            allow_inline_fallback_in_prod: env_bool("ALLOW_INLINE_FALLBACK_IN_PROD"),

            llm_base_url: env_str("LLM_BASE_URL", "https://api.openai.com/v1"),
            llm_api_key: env_str("LLM_API_KEY", ""),
            llm_model: env_str("LLM_MODEL", "gpt-4o"),
            llm_timeout_sec: env::var("LLM_TIMEOUT_SEC").ok(),
            llm_connect_timeout_sec: env::var("LLM_CONNECT_TIMEOUT_SEC").ok(),
            llm_retries: env_parse("LLM_RETRIES", 2u32).max(1),
            llm_fallback_models: env_str("LLM_FALLBACK_MODELS", "")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        };

        config.ensure_backend_allowed()?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        matches!(self.app_env.as_str(), "prod" | "production")
    }

    /// The inline backend is a single-process fallback; refuse it in
    /// production unless the operator explicitly opted in.
    pub fn ensure_backend_allowed(&self) -> Result<()> {
        if self.queue_backend == QueueBackendKind::Inline
            && self.is_production()
            && !self.allow_inline_fallback_in_prod
        {
            bail!(
                "inline queue backend is not allowed in production; \
                 set JOB_QUEUE_BACKEND=redis or ALLOW_INLINE_FALLBACK_IN_PROD=1"
            );
        }
        Ok(())
    }

    /// Build the gateway target chain: primary model first, then fallbacks,
    /// all sharing the endpoint, credentials, and timeout settings.
    pub fn gateway_targets(&self) -> Vec<Target> {
        std::iter::once(&self.llm_model)
            .chain(self.llm_fallback_models.iter())
            .map(|model| {
                Target::new(
                    "openai",
                    model.as_str(),
                    self.llm_base_url.as_str(),
                    self.llm_api_key.as_str(),
                )
                .with_timeouts(
                    self.llm_timeout_sec.as_deref(),
                    self.llm_connect_timeout_sec.as_deref(),
                    None,
                )
                .with_retries(self.llm_retries)
            })
            .collect()
    }

    /// A config suitable for tests: tempdir-rooted, inline backend, small
    /// floors left intact.
    pub fn for_tests(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            port: 0,
            worker_pool_size: 2,
            lane_max_queue: 6,
            lane_debounce_ms: 500,
            claim_ttl_sec: 600,
            signal_max_entries: 4096,
            signal_ttl_sec: 1800,
            max_tool_rounds: 5,
            max_tool_calls: 12,
            max_messages: 14,
            max_message_chars: 2000,
            pending_scan_interval_sec: 60,
            session_index_max_items: 500,
            queue_backend: QueueBackendKind::Inline,
            redis_url: "redis://localhost:6379/0".to_string(),
            tenant_id: "default".to_string(),
            app_env: "test".to_string(),
            allow_inline_fallback_in_prod: false,
            llm_base_url: "http://localhost:1".to_string(),
            llm_api_key: String::new(),
            llm_model: "test-model".to_string(),
            llm_timeout_sec: None,
            llm_connect_timeout_sec: None,
            llm_retries: 1,
            llm_fallback_models: Vec::new(),
        }
    }
}

/// `rq` and `redis-rq` are legacy names for the distributed backend.
fn parse_backend(raw: &str) -> QueueBackendKind {
    match raw.trim().to_lowercase().as_str() {
        "redis" | "rq" | "redis-rq" => QueueBackendKind::Redis,
        _ => QueueBackendKind::Inline,
    }
}

fn env_str(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str) -> bool {
    matches!(
        env_str(name, "").trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn non_empty(value: String, default: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}
