//! OpenAI-compatible HTTP backend.
//!
//! Speaks the `/chat/completions` and `/embeddings` surface that OpenAI,
//! Azure, and most self-hosted gateways expose. Streaming uses SSE via
//! [`eventsource_stream`]; tool-call argument fragments are forwarded as
//! [`StreamChunk::ToolCallDelta`]s and reassembled by the caller's
//! aggregator.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::{
    ChatMessage, ChatRequest, ChatResponse, ChunkStream, LlmBackend, LlmError, LlmResult, Role,
    StopReason, StreamChunk, ToolCall, ToolChoice,
};
use crate::embedding::{EmbedError, Embedder};
use crate::usage::Usage;

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Bearer token.
    pub api_key: String,
    /// API root, without a trailing slash.
    pub base_url: String,
    /// Model used when a spec does not name one.
    pub model: String,
    /// Embedding model for [`OpenAiEmbedder`].
    pub embedding_model: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_owned(),
            model: "gpt-4o-mini".to_owned(),
            embedding_model: "text-embedding-3-small".to_owned(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// An [`LlmBackend`] over an OpenAI-compatible HTTP API.
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiBackend {
    /// Creates a backend from connection settings.
    pub fn new(config: OpenAiConfig) -> LlmResult<Self> {
        if config.api_key.is_empty() {
            return Err(LlmError::Auth("api key is required".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Protocol(format!("failed to build http client: {e}")))?;

        Ok(Self { config, client })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/embeddings", self.config.base_url)
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> LlmError {
        match status.as_u16() {
            401 | 403 => LlmError::Auth(body.to_owned()),
            429 => LlmError::Quota(body.to_owned()),
            _ => LlmError::Http(format!("status {status}: {body}")),
        }
    }

    fn build_wire_request(&self, request: &ChatRequest, stream: bool) -> WireRequest {
        let model = if request.model.is_empty() {
            self.config.model.clone()
        } else {
            request.model.clone()
        };

        WireRequest {
            model,
            messages: request.messages.iter().map(WireMessage::from).collect(),
            tools: (!request.tools.is_empty()).then(|| {
                request
                    .tools
                    .iter()
                    .map(|t| WireTool {
                        kind: "function",
                        function: WireFunctionDef {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        },
                    })
                    .collect()
            }),
            tool_choice: match request.tool_choice {
                ToolChoice::Auto => None,
                ToolChoice::None => Some("none"),
                ToolChoice::Required => Some("required"),
            },
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
            stream_options: stream.then_some(WireStreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn chat(&self, request: &ChatRequest) -> LlmResult<ChatResponse> {
        let wire = self.build_wire_request(request, false);
        let response = self.post(&self.chat_url()).json(&wire).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Protocol(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Protocol("response carried no choices".into()))?;

        Ok(ChatResponse {
            message: choice.message.into_message(),
            stop_reason: choice
                .finish_reason
                .as_deref()
                .map(StopReason::parse)
                .unwrap_or_default(),
            usage: parsed.usage.map(WireUsage::into_usage),
        })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> LlmResult<ChunkStream> {
        let wire = self.build_wire_request(request, true);
        let response = self.post(&self.chat_url()).json(&wire).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        let mut events = response.bytes_stream().eventsource();
        let stream = async_stream::try_stream! {
            while let Some(event) = events.next().await {
                let event = event.map_err(|e| LlmError::Http(e.to_string()))?;
                if event.data.trim() == "[DONE]" {
                    yield StreamChunk::Done { stop_reason: None };
                    continue;
                }
                match serde_json::from_str::<WireStreamChunk>(&event.data) {
                    Ok(chunk) => {
                        for piece in convert_stream_chunk(chunk) {
                            yield piece;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "unparseable sse chunk, skipping");
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn backend_name(&self) -> &'static str {
        "openai"
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }
}

fn convert_stream_chunk(chunk: WireStreamChunk) -> Vec<StreamChunk> {
    let mut out = Vec::new();

    if let Some(usage) = chunk.usage {
        out.push(StreamChunk::Usage(usage.into_usage()));
    }

    for choice in chunk.choices {
        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            out.push(StreamChunk::Text(content));
        }
        if let Some(reasoning) = choice.delta.reasoning_content
            && !reasoning.is_empty()
        {
            out.push(StreamChunk::Reasoning(reasoning));
        }
        for tc in choice.delta.tool_calls.unwrap_or_default() {
            if let (Some(id), Some(name)) = (
                tc.id.as_deref(),
                tc.function.as_ref().and_then(|f| f.name.as_deref()),
            ) {
                out.push(StreamChunk::ToolCallStart {
                    index: tc.index,
                    id: id.to_owned(),
                    name: name.to_owned(),
                });
            }
            if let Some(args) = tc.function.as_ref().and_then(|f| f.arguments.as_deref())
                && !args.is_empty()
            {
                out.push(StreamChunk::ToolCallDelta {
                    index: tc.index,
                    partial_json: args.to_owned(),
                });
            }
        }
        if let Some(reason) = choice.finish_reason.as_deref() {
            out.push(StreamChunk::Done {
                stop_reason: Some(StopReason::parse(reason)),
            });
        }
    }
    out
}

/// An [`Embedder`] over the same endpoint's `/embeddings` surface.
#[derive(Debug, Clone)]
pub struct OpenAiEmbedder {
    backend: OpenAiBackend,
    dimension: usize,
}

impl OpenAiEmbedder {
    /// Creates an embedder sharing the backend's connection settings.
    #[must_use]
    pub const fn new(backend: OpenAiBackend, dimension: usize) -> Self {
        Self { backend, dimension }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = WireEmbedRequest {
            model: self.backend.config.embedding_model.clone(),
            input: texts.to_vec(),
            dimensions: Some(self.dimension),
        };
        let response = self
            .backend
            .post(&self.backend.embeddings_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbedError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Upstream(format!("status {status}: {body}")));
        }

        let mut parsed: WireEmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::Upstream(e.to_string()))?;
        parsed.data.sort_by_key(|d| d.index);

        for item in &parsed.data {
            if item.embedding.len() != self.dimension {
                return Err(EmbedError::Dimension {
                    expected: self.dimension,
                    actual: item.embedding.len(),
                });
            }
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<WireStreamOptions>,
}

#[derive(Debug, Serialize)]
struct WireStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        Self {
            role: role.to_owned(),
            content: message.content.clone(),
            tool_calls: (!message.tool_calls.is_empty()).then(|| {
                message
                    .tool_calls
                    .iter()
                    .map(|c| WireToolCall {
                        id: Some(c.id.clone()),
                        kind: Some("function".to_owned()),
                        function: WireFunctionCall {
                            name: c.name.clone(),
                            arguments: c.arguments.to_string(),
                        },
                    })
                    .collect()
            }),
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

impl WireMessage {
    fn into_message(self) -> ChatMessage {
        let tool_calls = self
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| {
                ToolCall::new(
                    c.id.unwrap_or_default(),
                    c.function.name,
                    &c.function.arguments,
                )
            })
            .collect();
        ChatMessage {
            role: Role::Assistant,
            content: self.content,
            tool_calls,
            tool_call_id: self.tool_call_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl WireUsage {
    const fn into_usage(self) -> Usage {
        Usage::new(self.prompt_tokens, self.completion_tokens)
    }
}

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireStreamToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct WireStreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireEmbedRequest {
    model: String,
    input: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WireEmbedResponse {
    data: Vec<WireEmbedding>,
}

#[derive(Debug, Deserialize)]
struct WireEmbedding {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}
