//! The language-model seam.
//!
//! The runtime treats the model provider as an opaque [`LlmBackend`]: it
//! takes an assembled [`ChatRequest`] (messages + tool schemas) and returns
//! either text or tool-call requests, in one shot or as a chunk stream.
//!
//! [`StreamAggregator`] rebuilds a complete [`ChatResponse`] from streamed
//! chunks so the execution loop can classify the turn exactly once,
//! independent of transport.

pub mod mock;
pub mod openai;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;
use crate::tool::ToolDefinition;
use crate::usage::Usage;

/// Errors from a model backend.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LlmError {
    /// Credentials rejected. Fatal for the run.
    #[error("backend authentication failed: {0}")]
    Auth(String),

    /// Rate or spend limit exhausted.
    #[error("backend quota exhausted: {0}")]
    Quota(String),

    /// Transport-level failure.
    #[error("backend request failed: {0}")]
    Http(String),

    /// The backend returned something the runtime cannot interpret.
    #[error("backend protocol error: {0}")]
    Protocol(String),

    /// The backend does not implement the requested capability.
    #[error("backend does not support {0}")]
    NotSupported(&'static str),
}

impl LlmError {
    /// Maps onto the wire taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::PermissionDenied,
            Self::Quota(_) => ErrorKind::QuotaExhausted,
            Self::Http(_) => ErrorKind::UpstreamUnavailable,
            Self::Protocol(_) | Self::NotSupported(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` when the failure should mark the run failed rather
    /// than be retried or reported as a non-fatal event.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Quota(_))
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Result alias for backend operations.
pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool result fed back to the model.
    Tool,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back in the tool result.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments as parsed JSON. Malformed provider JSON is preserved as a
    /// string value so the loop can report `invalid_args`.
    pub arguments: Value,
}

impl ToolCall {
    /// Creates a tool call, parsing `arguments` from a JSON string when
    /// possible.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: &str) -> Self {
        let parsed = serde_json::from_str(arguments)
            .unwrap_or_else(|_| Value::String(arguments.to_owned()));
        Self {
            id: id.into(),
            name: name.into(),
            arguments: parsed,
        }
    }
}

/// One message in a model conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: Role,
    /// Text content, absent for pure tool-call turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls attached to an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Call id this message answers, for `Tool` turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Creates an assistant text message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Creates an assistant turn consisting of tool calls.
    #[must_use]
    pub const fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Creates a tool result message answering `tool_call_id`.
    #[must_use]
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Returns `true` when the message carries tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Controls how the model may use tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    /// The model decides.
    #[default]
    Auto,
    /// The model must not call tools (forces a content turn).
    None,
    /// The model must call at least one tool.
    Required,
}

/// A completion request assembled by the execution loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier.
    pub model: String,
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,
    /// Tool schemas offered to the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    /// Tool usage policy.
    #[serde(default)]
    pub tool_choice: ToolChoice,
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Completion token cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Whether a streamed response is requested.
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// Creates a request for `model` with `messages`.
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Self::default()
        }
    }

    /// Offers tool schemas to the model.
    #[must_use]
    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Sets the tool usage policy.
    #[must_use]
    pub const fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    /// Requests a streamed response.
    #[must_use]
    pub const fn stream(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum StopReason {
    /// Natural end of response.
    #[default]
    Stop,
    /// Token limit reached.
    Length,
    /// The model requested tool calls.
    ToolCalls,
    /// Output suppressed by a safety filter.
    ContentFilter,
}

impl StopReason {
    /// Parses a provider `finish_reason` string.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "length" | "max_tokens" => Self::Length,
            "tool_calls" | "tool_use" => Self::ToolCalls,
            "content_filter" => Self::ContentFilter,
            _ => Self::Stop,
        }
    }
}

/// A complete model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The generated assistant message.
    pub message: ChatMessage,
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// Token accounting, when the provider reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// Creates a plain text response.
    #[must_use]
    pub fn from_text(content: impl Into<String>) -> Self {
        Self {
            message: ChatMessage::assistant(content),
            stop_reason: StopReason::Stop,
            usage: None,
        }
    }

    /// Returns the text content, if any.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.message.content.as_deref()
    }

    /// Returns the requested tool calls.
    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.message.tool_calls
    }
}

/// One chunk of a streamed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum StreamChunk {
    /// Incremental text.
    Text(String),
    /// Incremental reasoning content.
    Reasoning(String),
    /// A tool call is starting.
    ToolCallStart {
        /// Position of this call within the turn.
        index: usize,
        /// Provider-assigned call id.
        id: String,
        /// Tool name.
        name: String,
    },
    /// Partial JSON arguments for an in-progress tool call.
    ToolCallDelta {
        /// Position of the call being extended.
        index: usize,
        /// Argument fragment.
        partial_json: String,
    },
    /// Usage accounting (typically the final data chunk).
    Usage(Usage),
    /// End of stream.
    Done {
        /// Stop reason, when the provider reports one.
        stop_reason: Option<StopReason>,
    },
}

/// Boxed stream of chunks from a backend.
pub type ChunkStream = Pin<Box<dyn Stream<Item = LlmResult<StreamChunk>> + Send>>;

/// An opaque completion endpoint.
///
/// Implementations must be thread-safe; the runtime shares one backend
/// across concurrent runs and member sub-runs.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Completes a request in one shot.
    async fn chat(&self, request: &ChatRequest) -> LlmResult<ChatResponse>;

    /// Completes a request as a chunk stream.
    ///
    /// The default adapter calls [`chat`](Self::chat) and replays the result
    /// as a two-chunk stream, for backends without native streaming.
    async fn chat_stream(&self, request: &ChatRequest) -> LlmResult<ChunkStream> {
        let response = self.chat(request).await?;
        let mut chunks: Vec<LlmResult<StreamChunk>> = Vec::new();

        for (index, call) in response.message.tool_calls.iter().enumerate() {
            chunks.push(Ok(StreamChunk::ToolCallStart {
                index,
                id: call.id.clone(),
                name: call.name.clone(),
            }));
            chunks.push(Ok(StreamChunk::ToolCallDelta {
                index,
                partial_json: call.arguments.to_string(),
            }));
        }
        if let Some(text) = response.text() {
            chunks.push(Ok(StreamChunk::Text(text.to_owned())));
        }
        if let Some(usage) = response.usage {
            chunks.push(Ok(StreamChunk::Usage(usage)));
        }
        chunks.push(Ok(StreamChunk::Done {
            stop_reason: Some(response.stop_reason),
        }));

        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    /// Provider name for logs and error messages.
    fn backend_name(&self) -> &'static str;

    /// Model used when a spec does not name one.
    fn default_model(&self) -> &str;
}

/// Rebuilds a [`ChatResponse`] from streamed chunks.
#[derive(Debug, Clone, Default)]
pub struct StreamAggregator {
    text: String,
    reasoning: String,
    tool_calls: std::collections::BTreeMap<usize, ToolCallBuilder>,
    usage: Option<Usage>,
    stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

impl StreamAggregator {
    /// Creates an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one chunk into the accumulated state.
    pub fn apply(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::Text(text) => self.text.push_str(text),
            StreamChunk::Reasoning(text) => self.reasoning.push_str(text),
            StreamChunk::ToolCallStart { index, id, name } => {
                self.tool_calls.insert(
                    *index,
                    ToolCallBuilder {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: String::new(),
                    },
                );
            }
            StreamChunk::ToolCallDelta {
                index,
                partial_json,
            } => {
                if let Some(builder) = self.tool_calls.get_mut(index) {
                    builder.arguments.push_str(partial_json);
                }
            }
            StreamChunk::Usage(usage) => self.usage = Some(*usage),
            StreamChunk::Done { stop_reason } => self.stop_reason = *stop_reason,
        }
    }

    /// Accumulated reasoning content.
    #[must_use]
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Converts the accumulated chunks into a response.
    #[must_use]
    pub fn into_response(self) -> ChatResponse {
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .into_values()
            .map(|b| ToolCall::new(b.id, b.name, &b.arguments))
            .collect();

        let message = if tool_calls.is_empty() {
            ChatMessage::assistant(self.text)
        } else {
            let mut msg = ChatMessage::assistant_tool_calls(tool_calls);
            if !self.text.is_empty() {
                msg.content = Some(self.text);
            }
            msg
        };

        let stop_reason = self.stop_reason.unwrap_or({
            if message.has_tool_calls() {
                StopReason::ToolCalls
            } else {
                StopReason::Stop
            }
        });

        ChatResponse {
            message,
            stop_reason,
            usage: self.usage,
        }
    }
}
