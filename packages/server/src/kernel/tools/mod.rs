//! Tool registry with per-role allowlists.
//!
//! Skills register their tools here at startup; the chat processor asks
//! for the caller's allowlisted definitions and dispatches calls through
//! [`ToolRegistry::dispatch`]. Every failure mode becomes a structured
//! result object rather than an error; a broken tool call never fails the
//! job it runs in.

use std::collections::{BTreeMap, HashMap, HashSet};

use llm_client::{ErasedTool, ToolDefinition};
use tracing::warn;

use crate::kernel::jobs::Role;

const MAX_REPORTED_ISSUES: usize = 20;

/// Per-call context handed to dispatched tools.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub role: Role,
    pub teacher_id: Option<String>,
    pub student_id: Option<String>,
    /// Tag tying tool activity back to the job that ran it.
    pub audit_tag: String,
}

struct Registration {
    tool: Box<dyn ErasedTool>,
    roles: HashSet<Role>,
}

/// Registry mapping tool names to implementations and allowed roles.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Registration>,
    /// Optional skill-scoped allowlists layered on top of the role gate.
    skill_allowlists: HashMap<String, HashSet<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool for the given roles.
    pub fn register(&mut self, tool: Box<dyn ErasedTool>, roles: &[Role]) {
        let name = tool.name().to_string();
        self.tools.insert(
            name,
            Registration {
                tool,
                roles: roles.iter().copied().collect(),
            },
        );
    }

    /// Restrict a skill to a subset of the registered tools.
    pub fn set_skill_allowlist(&mut self, skill: &str, tools: &[&str]) {
        self.skill_allowlists.insert(
            skill.to_string(),
            tools.iter().map(|s| s.to_string()).collect(),
        );
    }

    fn allowed(&self, name: &str, role: Role, skill: Option<&str>) -> bool {
        let Some(registration) = self.tools.get(name) else {
            return false;
        };
        if !registration.roles.contains(&role) {
            return false;
        }
        match skill.and_then(|s| self.skill_allowlists.get(s)) {
            Some(allowlist) => allowlist.contains(name),
            None => true,
        }
    }

    /// Names of the tools the caller may use.
    pub fn list(&self, role: Role, skill: Option<&str>) -> Vec<String> {
        self.tools
            .keys()
            .filter(|name| self.allowed(name, role, skill))
            .cloned()
            .collect()
    }

    /// Wire-format definitions for the caller's allowlist, ready to hand
    /// to the gateway.
    pub fn definitions(&self, role: Role, skill: Option<&str>) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .filter(|(name, _)| self.allowed(name, role, skill))
            .map(|(_, reg)| reg.tool.definition().to_wire_format())
            .collect()
    }

    /// The declared input schema of a tool, if registered.
    pub fn schema(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.get(name).map(|reg| reg.tool.definition())
    }

    /// Validate arguments without executing. Unknown tools report no
    /// issues here; dispatch surfaces the unknown-tool error instead.
    pub fn validate(&self, name: &str, arguments: &str) -> Vec<String> {
        match self.tools.get(name) {
            Some(reg) => {
                let mut issues = reg.tool.validate(arguments);
                issues.truncate(MAX_REPORTED_ISSUES);
                issues
            }
            None => Vec::new(),
        }
    }

    /// Execute a tool call, returning a structured result value.
    ///
    /// Unknown tools, the role gate, argument validation, and execution
    /// failures all map to `{"error": …}` shapes so the processor can emit
    /// them as `tool.result` payloads verbatim.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: &str,
        context: &ToolContext,
        skill: Option<&str>,
    ) -> serde_json::Value {
        let Some(registration) = self.tools.get(name) else {
            return serde_json::json!({"error": format!("unknown tool: {name}")});
        };

        if !self.allowed(name, context.role, skill) {
            return serde_json::json!({
                "error": "permission denied",
                "detail": format!("{name} is not allowed for role {}", context.role.as_str()),
            });
        }

        let issues = self.validate(name, arguments);
        if !issues.is_empty() {
            return serde_json::json!({
                "error": "invalid_arguments",
                "tool": name,
                "issues": issues,
            });
        }

        match registration.tool.call_erased(arguments).await {
            Ok(raw) => serde_json::from_str(&raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw)),
            Err(e) => {
                warn!(
                    tool = name,
                    audit_tag = %context.audit_tag,
                    error = %e,
                    "tool execution failed"
                );
                serde_json::json!({"error": e.to_string()})
            }
        }
    }
}
