//! Unified LLM gateway client.
//!
//! A minimal client for OpenAI-compatible chat completion endpoints with
//! per-target retries, an ordered fallback chain, and type-safe tool
//! definitions. Carries no domain logic; the orchestration core consumes it
//! through the [`Gateway`] trait.
//!
//! # Example
//!
//! ```rust,ignore
//! use llm_client::{ChatMessage, Gateway, HttpGateway, LlmRequest, Target};
//!
//! let gateway = HttpGateway::new(vec![
//!     Target::new("openai", "gpt-4o", "https://api.openai.com/v1", api_key),
//! ])?;
//!
//! let response = gateway
//!     .generate(LlmRequest::new(vec![ChatMessage::user("Hello!")]))
//!     .await?;
//! ```

pub mod error;
pub mod gateway;
pub mod target;
pub mod tool;
pub mod types;

pub use error::{LlmError, Result};
pub use gateway::{Gateway, HttpGateway};
pub use target::{resolve_timeouts, Target};
pub use tool::{ErasedTool, Tool, ToolDefinition, ToolError};
pub use types::{
    ChatMessage, FunctionCall, LlmRequest, LlmResponse, ToolCall, ToolCallPayload, Usage,
};
