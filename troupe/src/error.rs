//! Error types for the troupe runtime.
//!
//! Every error that crosses a component boundary is a typed value carrying
//! an [`ErrorKind`] from the wire-stable taxonomy. Inside a component,
//! `?`-propagation over the component's own error enum is the norm; the
//! conversions below collapse them into [`RuntimeError`] at the seams.

use serde::{Deserialize, Serialize};

/// A type alias for `Result<T, RuntimeError>`.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Wire-stable error classification.
///
/// Serialized in `tool_call_completed`, `error`, and `run_failed` event
/// payloads, so variant names must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    /// Arguments failed validation or referenced an unknown tool/member.
    InvalidArgs,
    /// The requested entity does not exist.
    NotFound,
    /// The caller is not allowed to access the entity.
    PermissionDenied,
    /// A collaborator (LLM, store) is unreachable or misbehaving.
    UpstreamUnavailable,
    /// A deadline elapsed.
    Timeout,
    /// Unclassified runtime failure.
    Internal,
    /// The operation was cancelled cooperatively.
    Cancelled,
    /// A usage quota was exhausted.
    QuotaExhausted,
}

impl ErrorKind {
    /// Returns the wire string for this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgs => "invalid_args",
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
            Self::Cancelled => "cancelled",
            Self::QuotaExhausted => "quota_exhausted",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The umbrella error for runtime operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// LLM backend failure.
    #[error(transparent)]
    Llm(#[from] crate::llm::LlmError),

    /// Record store failure.
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    /// Vector store failure.
    #[error(transparent)]
    Vector(#[from] crate::store::VectorError),

    /// Tool invocation failure that escaped the agent loop.
    #[error(transparent)]
    Tool(#[from] crate::tool::ToolError),

    /// Embedding failure.
    #[error(transparent)]
    Embed(#[from] crate::embedding::EmbedError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// Agent or team specification is invalid.
    #[error("invalid spec '{spec}': {message}")]
    Spec {
        /// Spec identifier.
        spec: String,
        /// What is wrong with it.
        message: String,
    },

    /// Access to an entity owned by another user.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A run, tool, or member deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The run was cancelled cooperatively.
    #[error("run was cancelled")]
    Cancelled,

    /// Unclassified internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Creates a spec validation error.
    #[must_use]
    pub fn spec(spec: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Spec {
            spec: spec.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Maps this error onto the wire taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Llm(e) => e.kind(),
            Self::Store(_) | Self::Vector(_) | Self::Embed(_) => ErrorKind::UpstreamUnavailable,
            Self::Tool(e) => e.kind(),
            Self::Spec { .. } | Self::Config(_) => ErrorKind::InvalidArgs,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` if the error is terminal for a run.
    ///
    /// Non-fatal errors (tool failures, member failures) are handled inside
    /// the agent loop and never reach the coordinator as `RuntimeError`.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_strings_are_stable() {
        assert_eq!(ErrorKind::InvalidArgs.as_str(), "invalid_args");
        assert_eq!(ErrorKind::PermissionDenied.as_str(), "permission_denied");
        assert_eq!(ErrorKind::UpstreamUnavailable.as_str(), "upstream_unavailable");
        assert_eq!(ErrorKind::QuotaExhausted.as_str(), "quota_exhausted");
    }

    #[test]
    fn kind_serde_roundtrip() {
        let json = serde_json::to_string(&ErrorKind::Timeout).expect("serialize");
        assert_eq!(json, "\"timeout\"");
        let parsed: ErrorKind = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, ErrorKind::Timeout);
    }

    #[test]
    fn runtime_error_maps_to_kind() {
        assert_eq!(
            RuntimeError::PermissionDenied("session".into()).kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(RuntimeError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            RuntimeError::spec("team", "cycle").kind(),
            ErrorKind::InvalidArgs
        );
    }
}
