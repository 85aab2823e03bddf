//! Tool Registry (C2): stores named tool capabilities and resolves names to typed
//! invocations.
//!
//! Narrowed from a richer multi-protocol tool router (`ToolProtocol` + MCP discovery):
//! this registry is a flat name→tool map, so the protocol-routing layer is dropped and
//! [`ToolMetadata`]/[`ToolParameter`]/[`ToolResult`] are kept close to their original shape.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::core::tool_registry::{Tool, ToolMetadata, ToolParameter, ToolParameterType, ToolRegistry, ToolResult};
//! use async_trait::async_trait;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Tool for Echo {
//!     fn metadata(&self) -> ToolMetadata {
//!         ToolMetadata::new("echo", "Echoes its input back")
//!             .with_parameter(ToolParameter::new("text", ToolParameterType::String).required())
//!     }
//!
//!     async fn invoke(&self, args: serde_json::Value) -> Result<ToolResult, ToolError> {
//!         let text = args.get("text").and_then(|v| v.as_str()).unwrap_or_default();
//!         Ok(ToolResult::success(serde_json::json!(text)))
//!     }
//! }
//!
//! # use agentmesh::core::tool_registry::ToolError;
//! # async {
//! let mut registry = ToolRegistry::new();
//! registry.register(std::sync::Arc::new(Echo));
//! let result = registry.invoke("echo", serde_json::json!({"text": "hi"})).await.unwrap();
//! assert_eq!(result.output, serde_json::json!("hi"));
//! # };
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The outcome of a tool invocation (§3: `invoke(args) → result`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: serde_json::Value,
    pub error: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ToolResult {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// JSON-Schema-shaped parameter type used when serializing a tool's schema for a
/// provider's function-calling API (§4.2).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

/// A single parameter in a tool's input schema.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ToolParameterType,
    pub description: Option<String>,
    pub required: bool,
}

impl ToolParameter {
    pub fn new(name: impl Into<String>, param_type: ToolParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: None,
            required: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// `(name, description, input schema)` — the `invoke` and `fails-with` parts of §3's
/// Tool record live on the [`Tool`] trait itself.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, param: ToolParameter) -> Self {
        self.parameters.push(param);
        self
    }

    /// Validate a raw JSON argument object against `self.parameters`' required flags.
    /// Full JSON-Schema validation is out of scope; this checks the one thing the
    /// Agent Executor's tool-failure policy (§4.4) cares about: whether a required
    /// argument is present at all.
    pub fn validate(&self, args: &serde_json::Value) -> Result<(), String> {
        let obj = args
            .as_object()
            .ok_or_else(|| "tool arguments must be a JSON object".to_string())?;
        for param in &self.parameters {
            if param.required && !obj.contains_key(&param.name) {
                return Err(format!("missing required parameter: {}", param.name));
            }
        }
        Ok(())
    }
}

/// Failure kinds a tool invocation may raise (§4.2, §7).
#[derive(Debug, Clone)]
pub enum ToolError {
    /// Resolved name does not match any registered tool.
    NotFound(String),
    /// Arguments failed schema validation before `invoke` was called.
    ToolInputInvalid(String),
    /// `invoke` ran and failed at runtime.
    ToolExecutionFailed(String),
    /// `invoke` did not complete within its deadline.
    ToolTimeout,
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "tool not found: {}", name),
            ToolError::ToolInputInvalid(msg) => write!(f, "invalid tool input: {}", msg),
            ToolError::ToolExecutionFailed(msg) => write!(f, "tool execution failed: {}", msg),
            ToolError::ToolTimeout => write!(f, "tool invocation timed out"),
        }
    }
}

impl std::error::Error for ToolError {}

/// A single, side-effecting, named capability an agent may invoke indirectly (§3).
#[async_trait]
pub trait Tool: Send + Sync {
    /// Identity, description, and input schema.
    fn metadata(&self) -> ToolMetadata;

    /// Run the tool. Implementations should not validate required arguments
    /// themselves — the registry calls [`ToolMetadata::validate`] first.
    async fn invoke(&self, args: serde_json::Value) -> Result<ToolResult, ToolError>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.metadata().name).finish()
    }
}

/// `register(tool)`, `resolve(name) → tool | NotFound`, `list() → names` (§4.2).
///
/// Names are unique; re-registering a name replaces the previous tool. Invocations are
/// single-shot — the registry never retries internally; retry decisions belong to the
/// Agent Executor (§4.2 policy).
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any previous tool registered under the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.metadata().name;
        self.tools.insert(name, tool);
    }

    /// Resolve a tool by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    /// List all registered tool names, in no particular order.
    pub fn list(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Resolve, validate input against the schema, then invoke — the full §4.2 path a
    /// caller (typically the Agent Executor) exercises for one tool call.
    pub async fn invoke(&self, name: &str, args: serde_json::Value) -> Result<ToolResult, ToolError> {
        let tool = self.resolve(name)?;
        tool.metadata()
            .validate(&args)
            .map_err(ToolError::ToolInputInvalid)?;
        tool.invoke(args).await
    }
}
