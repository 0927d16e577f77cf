//! Tool calling traits and types.
//!
//! Provides a type-safe API for defining tools the model can call. Argument
//! validation is split from execution so callers can reject bad arguments
//! without running the tool.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//! use llm_client::Tool;
//!
//! #[derive(Deserialize, JsonSchema)]
//! struct SearchArgs {
//!     query: String,
//! }
//!
//! struct ExampleSearch;
//!
//! #[async_trait]
//! impl Tool for ExampleSearch {
//!     const NAME: &'static str = "example_search";
//!     type Args = SearchArgs;
//!     type Output = Vec<String>;
//!     type Error = anyhow::Error;
//!
//!     fn description(&self) -> &str {
//!         "Search worked examples by topic"
//!     }
//!
//!     async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
//!         Ok(vec![format!("results for: {}", args.query)])
//!     }
//! }
//! ```

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A tool that can be called by the model.
///
/// Tools have typed arguments and outputs, with automatic schema generation.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    const NAME: &'static str;

    /// The argument type (must derive `Deserialize` and `JsonSchema`).
    type Args: DeserializeOwned + JsonSchema + Send;

    /// The output type (must derive `Serialize`).
    type Output: Serialize + Send;

    /// The error type for this tool.
    type Error: std::error::Error + Send + Sync + 'static;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// Execute the tool with the given arguments.
    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error>;

    /// Generate the tool definition for this tool.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: self.description().to_string(),
            parameters: schema_value::<Self::Args>(),
        }
    }
}

/// Generate a JSON schema value for a type, falling back to a bare object
/// schema if serialization of the schema itself fails.
fn schema_value<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::gen::SchemaGenerator::default().into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// Provider-agnostic tool definition.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,

    pub description: String,

    /// JSON schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Convert to the wire format the gateway sends.
    pub fn to_wire_format(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters
            }
        })
    }
}

/// Error type for erased tool calls.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Failed to parse tool arguments.
    #[error("Failed to parse arguments: {0}")]
    ArgumentParse(String),

    /// Tool execution failed.
    #[error("Tool execution failed: {0}")]
    Execution(String),

    /// Failed to serialize tool output.
    #[error("Failed to serialize output: {0}")]
    OutputSerialize(String),
}

/// Type-erased tool for storing heterogeneous tools in collections.
#[async_trait]
pub trait ErasedTool: Send + Sync {
    /// Get the tool's name.
    fn name(&self) -> &str;

    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Check JSON arguments against the declared argument type without
    /// executing. Returns human-readable issues; empty means valid.
    fn validate(&self, arguments: &str) -> Vec<String>;

    /// Execute the tool with JSON arguments, returning JSON output.
    async fn call_erased(&self, arguments: &str) -> Result<String, ToolError>;
}

/// Blanket implementation of `ErasedTool` for all `Tool` implementors.
#[async_trait]
impl<T: Tool> ErasedTool for T {
    fn name(&self) -> &str {
        T::NAME
    }

    fn definition(&self) -> ToolDefinition {
        Tool::definition(self)
    }

    fn validate(&self, arguments: &str) -> Vec<String> {
        match serde_json::from_str::<T::Args>(arguments) {
            Ok(_) => Vec::new(),
            Err(e) => vec![e.to_string()],
        }
    }

    async fn call_erased(&self, arguments: &str) -> Result<String, ToolError> {
        let args: T::Args = serde_json::from_str(arguments)
            .map_err(|e| ToolError::ArgumentParse(e.to_string()))?;

        let output = self
            .call(args)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        serde_json::to_string(&output).map_err(|e| ToolError::OutputSerialize(e.to_string()))
    }
}
