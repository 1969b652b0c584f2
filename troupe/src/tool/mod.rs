//! Tools — the uniform interface for anything an agent can invoke.
//!
//! A capability implements the typed [`Tool`] trait; [`DynTool`] provides
//! the object-safe form registered in a [`ToolSet`]. Argument schemas are
//! derived from the `Args` type via `schemars`, so the definition shown to
//! the model always matches what `call` will accept.
//!
//! Failures are values: a tool returns a [`ToolError`] carrying a
//! wire-stable [`ErrorKind`], and the execution loop reports it in a
//! `tool_call_completed` event without aborting the run.

pub mod knowledge_search;
pub mod memory_search;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::context::CancelToken;
use crate::error::ErrorKind;

/// Machine-readable description of a tool for the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique snake_case name.
    pub name: String,
    /// What the tool does; guides the model's choice.
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Creates a definition.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A failed tool invocation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("tool error ({kind}): {message}")]
pub struct ToolError {
    kind: ErrorKind,
    message: String,
}

impl ToolError {
    /// Creates an error with an explicit kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Malformed or unexpected arguments, or an unknown tool/member name.
    #[must_use]
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgs, message)
    }

    /// The requested entity does not exist.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// The caller may not access the entity.
    #[must_use]
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    /// A collaborator behind the tool failed.
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnavailable, message)
    }

    /// The per-tool deadline elapsed.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// The run was cancelled while the tool was in flight.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "invocation cancelled")
    }

    /// Unclassified failure inside the tool.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// The wire classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable description.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Identity and control surface handed to every invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The user on whose behalf the tool runs; scopes all store access.
    pub user_id: String,
    /// The enclosing run.
    pub run_id: String,
    /// Cooperative cancellation signal; long-running tools should observe it.
    pub cancel: CancelToken,
}

impl ToolContext {
    /// Creates a context.
    #[must_use]
    pub fn new(user_id: impl Into<String>, run_id: impl Into<String>, cancel: CancelToken) -> Self {
        Self {
            user_id: user_id.into(),
            run_id: run_id.into(),
            cancel,
        }
    }
}

/// A tool result: human-readable content plus optional structured data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Text fed back to the model.
    pub content: String,
    /// Structured form of the same result, when meaningful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolOutput {
    /// Wraps a serialized output value.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let content = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            content,
            data: Some(value),
        }
    }
}

/// The typed tool interface.
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    /// Unique snake_case name.
    const NAME: &'static str;

    /// Argument type; its derived schema is shown to the model.
    type Args: DeserializeOwned + JsonSchema + Send;

    /// Output type, serialized into the tool result.
    type Output: Serialize + Send;

    /// Returns the tool name.
    fn name(&self) -> &'static str {
        Self::NAME
    }

    /// Describes the tool for the model.
    fn description(&self) -> String;

    /// JSON Schema of [`Self::Args`], derived via `schemars`.
    fn parameters_schema(&self) -> Value {
        schema_for::<Self::Args>()
    }

    /// Whether a timed-out invocation may be retried once.
    fn idempotent(&self) -> bool {
        false
    }

    /// Executes the tool.
    async fn call(&self, ctx: &ToolContext, args: Self::Args) -> Result<Self::Output, ToolError>;
}

/// Generates a parameter schema for an argument type.
#[must_use]
pub fn schema_for<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_default();
    if let Value::Object(ref mut map) = value {
        map.remove("$schema");
        map.remove("title");
    }
    value
}

/// Object-safe tool interface used by the registry and execution loop.
#[async_trait]
pub trait DynTool: Send + Sync {
    /// Tool name.
    fn name(&self) -> &str;

    /// Definition offered to the model.
    fn definition(&self) -> ToolDefinition;

    /// Whether a timed-out invocation may be retried once.
    fn idempotent(&self) -> bool;

    /// Executes with JSON arguments.
    async fn call_json(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError>;
}

#[async_trait]
impl<T: Tool> DynTool for T {
    fn name(&self) -> &str {
        Tool::name(self)
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(Tool::name(self), self.description(), self.parameters_schema())
    }

    fn idempotent(&self) -> bool {
        Tool::idempotent(self)
    }

    async fn call_json(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput, ToolError> {
        let args: T::Args = serde_json::from_value(args)
            .map_err(|e| ToolError::invalid_args(format!("malformed arguments: {e}")))?;
        let output = self.call(ctx, args).await?;
        let value = serde_json::to_value(output)
            .map_err(|e| ToolError::internal(format!("unserializable output: {e}")))?;
        Ok(ToolOutput::from_value(value))
    }
}

/// A named collection of tools available to one agent.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Vec<Arc<dyn DynTool>>,
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a typed tool.
    pub fn add<T: Tool>(&mut self, tool: T) {
        self.tools.push(Arc::new(tool));
    }

    /// Adds an already-boxed tool.
    pub fn add_dyn(&mut self, tool: Arc<dyn DynTool>) {
        self.tools.push(tool);
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` when no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Returns `true` when a tool named `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    /// Registered tool names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Definitions for every registered tool.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Looks up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn DynTool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Whether `name` names an idempotent tool.
    #[must_use]
    pub fn is_idempotent(&self, name: &str) -> bool {
        self.get(name).is_some_and(|t| t.idempotent())
    }

    /// Invokes a tool with a deadline, racing cancellation.
    ///
    /// An unknown name maps to `invalid_args` so the model can correct
    /// itself on the next turn.
    pub async fn invoke(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::invalid_args(format!("unknown tool '{name}'")))?;

        tokio::select! {
            () = ctx.cancel.cancelled() => Err(ToolError::cancelled()),
            result = tokio::time::timeout(timeout, tool.call_json(ctx, args)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(ToolError::timeout(format!(
                        "'{name}' exceeded {}ms",
                        timeout.as_millis()
                    ))),
                }
            }
        }
    }
}
