//! Scripted backend for tests.
//!
//! [`MockBackend`] answers from canned [`MockTurn`]s without any network.
//! Turns can be queued globally (consumed in order) or keyed to a rule that
//! matches a substring of the request, which lets one backend serve a
//! leader and several members in the same test: key each rule to a
//! distinctive fragment of the agent's instructions.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;

use super::{
    ChatMessage, ChatRequest, ChatResponse, ChunkStream, LlmBackend, LlmError, LlmResult,
    StopReason, StreamChunk, ToolCall, ToolChoice,
};
use crate::usage::Usage;

/// One canned model turn.
#[derive(Debug, Clone, Default)]
pub struct MockTurn {
    /// Text content, streamed in whitespace-preserving pieces.
    pub text: String,
    /// Reasoning content streamed before the text.
    pub reasoning: Option<String>,
    /// Tool calls the model "requests".
    pub tool_calls: Vec<ToolCall>,
    /// Delay inserted before each streamed chunk.
    pub chunk_delay: Duration,
}

impl MockTurn {
    /// A plain text turn.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            text: content.into(),
            ..Self::default()
        }
    }

    /// Adds a tool call to the turn.
    #[must_use]
    pub fn tool_call(mut self, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        let id = format!("call-{}", self.tool_calls.len() + 1);
        self.tool_calls.push(ToolCall {
            id,
            name: name.into(),
            arguments,
        });
        self
    }

    /// Adds reasoning content.
    #[must_use]
    pub fn reasoning(mut self, content: impl Into<String>) -> Self {
        self.reasoning = Some(content.into());
        self
    }

    /// Sets a per-chunk streaming delay.
    #[must_use]
    pub const fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    fn into_response(self, request: &ChatRequest) -> ChatResponse {
        // A `tool_choice: none` request forces a content-only turn even if
        // the canned turn carries tool calls.
        let tool_calls = if request.tool_choice == ToolChoice::None {
            Vec::new()
        } else {
            self.tool_calls
        };

        let message = if tool_calls.is_empty() {
            ChatMessage::assistant(self.text)
        } else {
            let mut msg = ChatMessage::assistant_tool_calls(tool_calls);
            if !self.text.is_empty() {
                msg.content = Some(self.text);
            }
            msg
        };
        let stop_reason = if message.has_tool_calls() {
            StopReason::ToolCalls
        } else {
            StopReason::Stop
        };
        let usage = Usage::new(prompt_tokens(request), (message_len(&message) / 4) as u64 + 1);

        ChatResponse {
            message,
            stop_reason,
            usage: Some(usage),
        }
    }
}

fn prompt_tokens(request: &ChatRequest) -> u64 {
    let chars: usize = request
        .messages
        .iter()
        .map(|m| m.content.as_deref().map_or(0, str::len))
        .sum();
    (chars / 4) as u64 + 1
}

fn message_len(message: &ChatMessage) -> usize {
    message.content.as_deref().map_or(0, str::len)
}

struct Rule {
    needle: String,
    turns: VecDeque<MockTurn>,
    last: MockTurn,
}

/// A scripted [`LlmBackend`].
#[derive(Default)]
pub struct MockBackend {
    script: Mutex<VecDeque<MockTurn>>,
    rules: Mutex<Vec<Rule>>,
    fallback: MockTurn,
    requests: Mutex<Vec<ChatRequest>>,
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend").finish_non_exhaustive()
    }
}

impl MockBackend {
    /// Creates an empty backend that answers `"ok"` to everything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fallback: MockTurn::text("ok"),
            ..Self::default()
        }
    }

    /// Queues a turn consumed before any rule is consulted.
    #[must_use]
    pub fn then(self, turn: MockTurn) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(turn);
        }
        self
    }

    /// Registers turns for requests containing `needle`.
    ///
    /// Matching requests consume the turns in order; once only one remains
    /// it is repeated for every further match.
    #[must_use]
    pub fn on(self, needle: impl Into<String>, turns: Vec<MockTurn>) -> Self {
        let mut turns: VecDeque<MockTurn> = turns.into();
        let last = turns.back().cloned().unwrap_or_else(|| MockTurn::text("ok"));
        turns.pop_back();
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                needle: needle.into(),
                turns,
                last,
            });
        }
        self
    }

    /// Overrides the fallback turn.
    #[must_use]
    pub fn otherwise(mut self, turn: MockTurn) -> Self {
        self.fallback = turn;
        self
    }

    /// All requests seen so far, for assertions.
    #[must_use]
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn select(&self, request: &ChatRequest) -> MockTurn {
        if let Ok(mut script) = self.script.lock()
            && let Some(turn) = script.pop_front()
        {
            return turn;
        }

        let haystack: String = request
            .messages
            .iter()
            .filter_map(|m| m.content.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        if let Ok(mut rules) = self.rules.lock() {
            for rule in rules.iter_mut() {
                if haystack.contains(&rule.needle) {
                    return rule.turns.pop_front().unwrap_or_else(|| rule.last.clone());
                }
            }
        }
        self.fallback.clone()
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    async fn chat(&self, request: &ChatRequest) -> LlmResult<ChatResponse> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        Ok(self.select(request).into_response(request))
    }

    async fn chat_stream(&self, request: &ChatRequest) -> LlmResult<ChunkStream> {
        let turn = self.select(request);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let delay = turn.chunk_delay;
        let response = turn.clone().into_response(request);

        let mut chunks: Vec<LlmResult<StreamChunk>> = Vec::new();
        if let Some(reasoning) = &turn.reasoning {
            chunks.push(Ok(StreamChunk::Reasoning(reasoning.clone())));
        }
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
        if let Some(text) = response.message.content.as_deref() {
            for piece in text.split_inclusive(' ') {
                chunks.push(Ok(StreamChunk::Text(piece.to_owned())));
            }
        }
        if let Some(usage) = response.usage {
            chunks.push(Ok(StreamChunk::Usage(usage)));
        }
        chunks.push(Ok(StreamChunk::Done {
            stop_reason: Some(response.stop_reason),
        }));

        let stream = futures::stream::iter(chunks).then(move |chunk| async move {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            chunk
        });
        Ok(Box::pin(stream))
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }
}

/// A backend whose every call fails, for fatal-error paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingBackend;

#[async_trait]
impl LlmBackend for FailingBackend {
    async fn chat(&self, _request: &ChatRequest) -> LlmResult<ChatResponse> {
        Err(LlmError::Auth("invalid api key".into()))
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }

    fn default_model(&self) -> &str {
        "failing-model"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_turns_are_consumed_in_order() {
        let backend = MockBackend::new()
            .then(MockTurn::text("first"))
            .then(MockTurn::text("second"));
        let request = ChatRequest::new("mock-model", vec![ChatMessage::user("hi")]);

        let r1 = backend.chat(&request).await.expect("chat");
        let r2 = backend.chat(&request).await.expect("chat");
        let r3 = backend.chat(&request).await.expect("chat");

        assert_eq!(r1.text(), Some("first"));
        assert_eq!(r2.text(), Some("second"));
        assert_eq!(r3.text(), Some("ok"));
    }

    #[tokio::test]
    async fn rules_match_and_repeat_last_turn() {
        let backend = MockBackend::new().on(
            "weather",
            vec![MockTurn::text("sunny"), MockTurn::text("still sunny")],
        );

        let weather = ChatRequest::new("m", vec![ChatMessage::user("weather in Tokyo")]);
        let other = ChatRequest::new("m", vec![ChatMessage::user("unrelated")]);

        assert_eq!(
            backend.chat(&weather).await.expect("chat").text(),
            Some("sunny")
        );
        assert_eq!(
            backend.chat(&other).await.expect("chat").text(),
            Some("ok")
        );
        assert_eq!(
            backend.chat(&weather).await.expect("chat").text(),
            Some("still sunny")
        );
        assert_eq!(
            backend.chat(&weather).await.expect("chat").text(),
            Some("still sunny")
        );
    }

    #[tokio::test]
    async fn tool_choice_none_suppresses_tool_calls() {
        let backend = MockBackend::new().then(
            MockTurn::text("fallback text").tool_call("search", serde_json::json!({"q": "x"})),
        );
        let request = ChatRequest::new("m", vec![ChatMessage::user("hi")])
            .tool_choice(ToolChoice::None);

        let response = backend.chat(&request).await.expect("chat");
        assert!(response.tool_calls().is_empty());
        assert_eq!(response.text(), Some("fallback text"));
    }

    #[tokio::test]
    async fn stream_splits_text_and_ends_with_done() {
        let backend = MockBackend::new().then(MockTurn::text("a b c"));
        let request = ChatRequest::new("m", vec![ChatMessage::user("hi")]);

        let mut stream = backend.chat_stream(&request).await.expect("stream");
        let mut text = String::new();
        let mut saw_done = false;
        while let Some(chunk) = stream.next().await {
            match chunk.expect("chunk") {
                StreamChunk::Text(piece) => text.push_str(&piece),
                StreamChunk::Done { .. } => saw_done = true,
                _ => {}
            }
        }
        assert_eq!(text, "a b c");
        assert!(saw_done);
    }

    #[tokio::test]
    async fn failing_backend_reports_fatal_auth() {
        let err = FailingBackend
            .chat(&ChatRequest::default())
            .await
            .expect_err("must fail");
        assert!(err.is_fatal());
    }
}
