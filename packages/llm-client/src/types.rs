//! Gateway request and response types.
//!
//! The wire format follows the OpenAI-compatible chat completions shape,
//! which every configured target is expected to speak.

use serde::{Deserialize, Serialize};

/// A single chat message.
///
/// `content` is optional because assistant messages that carry tool calls
/// may have no text, and tool messages carry their payload in `content`
/// with the originating call referenced by `tool_call_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", "assistant", or "tool"
    pub role: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Tool calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallPayload>>,

    /// The call a tool-role message is responding to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text("assistant", content)
    }

    /// An assistant message carrying tool calls (no text).
    pub fn assistant_tool_calls(calls: Vec<ToolCallPayload>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// A tool-result message answering `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Wire form of a tool call inside an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: String,

    /// Always "function" for the targets we speak to.
    #[serde(rename = "type")]
    pub kind: String,

    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,

    /// Raw JSON string, exactly as the provider returned it.
    pub arguments: String,
}

/// A tool call extracted from a response, ready for dispatch.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// The ID of this tool call (for matching results back).
    pub id: String,

    /// The name of the tool to call.
    pub name: String,

    /// The arguments as a JSON string.
    pub arguments: String,
}

impl ToolCall {
    /// Parse a tool call from the provider wire format.
    ///
    /// Returns `None` when the value is missing required fields.
    pub fn from_wire(value: &serde_json::Value) -> Option<Self> {
        Some(Self {
            id: value.get("id")?.as_str()?.to_string(),
            name: value.get("function")?.get("name")?.as_str()?.to_string(),
            arguments: value
                .get("function")?
                .get("arguments")?
                .as_str()
                .unwrap_or_default()
                .to_string(),
        })
    }

    /// Convert back to the wire form for echoing into message history.
    pub fn to_payload(&self) -> ToolCallPayload {
        ToolCallPayload {
            id: self.id.clone(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: self.name.clone(),
                arguments: self.arguments.clone(),
            },
        }
    }
}

/// Unified request handed to the gateway.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,

    /// Tool definitions in wire format, if the caller allows tool use.
    pub tools: Option<Vec<serde_json::Value>>,

    /// Tool-choice directive ("auto" when tools are present).
    pub tool_choice: Option<String>,

    /// JSON schema for constrained output.
    pub json_schema: Option<serde_json::Value>,

    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

impl LlmRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Attach tool definitions; sets `tool_choice` to "auto".
    pub fn with_tools(mut self, tools: Vec<serde_json::Value>) -> Self {
        if !tools.is_empty() {
            self.tools = Some(tools);
            self.tool_choice = Some("auto".to_string());
        }
        self
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Unified response from the gateway.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    /// Final text, empty when the model only requested tools.
    pub text: String,

    pub tool_calls: Vec<ToolCall>,

    pub usage: Usage,

    pub finish_reason: Option<String>,
}

impl LlmResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}
