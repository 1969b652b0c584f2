//! Agent execution.
//!
//! [`AgentExecution`] drives one agent through its reasoning loop:
//!
//! 1. Assemble context: instructions ∥ rolling history ∥ optional hints ∥
//!    user input
//! 2. Stream a model turn, forwarding text as `content_delta` events
//! 3. Classify the turn: tool calls continue the loop, plain content ends it
//! 4. Execute tool calls with per-tool deadlines and report both lifecycle
//!    events, feeding results back as tool messages
//!
//! The loop ends on a final content turn, on cancellation, or at the tool
//! round cap — the cap forces one last content-only turn so the run still
//! succeeds.
//!
//! Tool failures never abort the loop: unknown names, malformed arguments,
//! and timeouts all become structured `tool_call_completed` errors the
//! model can react to.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt as _;
use tracing::{Instrument as _, debug, info, info_span};

use crate::bus::Producer;
use crate::context::RunContext;
use crate::error::{ErrorKind, Result};
use crate::event::EventBody;
use crate::llm::{
    ChatMessage, ChatRequest, ChatResponse, LlmBackend, StreamAggregator, StreamChunk, ToolCall,
    ToolChoice,
};
use crate::session::Exchange;
use crate::spec::AgentSpec;
use crate::tool::{ToolContext, ToolDefinition, ToolError, ToolOutput, ToolSet};
use crate::usage::Usage;

/// Result of one agent (or leader) execution.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Final text content.
    pub content: String,
    /// Accumulated usage across every model turn.
    pub usage: Usage,
}

/// One agent run over a prepared context.
pub(crate) struct AgentExecution {
    pub spec: Arc<AgentSpec>,
    pub backend: Arc<dyn LlmBackend>,
    pub tools: ToolSet,
    pub ctx: RunContext,
    pub producer: Producer,
    pub input: String,
    pub history: Vec<Exchange>,
    pub memory_hints: Vec<String>,
    pub knowledge_hints: Vec<String>,
    pub extra_context: Vec<String>,
}

impl AgentExecution {
    /// Runs the loop to completion.
    pub(crate) async fn run(self) -> Result<AgentOutcome> {
        let span = info_span!(
            "agent",
            agent.name = %self.spec.name,
            run_id = %self.ctx.run_id,
            producer = %self.producer.id(),
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> Result<AgentOutcome> {
        let mut messages = self.assemble_context();
        let definitions = self.tools.definitions();
        let mut usage = Usage::zero();
        let mut reasoning_index = 0u64;
        let max_rounds = self.ctx.config.max_tool_rounds.max(1);

        for round in 1..=max_rounds {
            self.ctx.ensure_active()?;
            debug!(agent = %self.spec.name, round, "starting round");

            let response = stream_turn(
                self.backend.as_ref(),
                &self.ctx,
                &self.producer,
                &self.spec.model,
                messages.clone(),
                definitions.clone(),
                ToolChoice::Auto,
                &mut reasoning_index,
            )
            .await?;
            if let Some(turn_usage) = response.usage {
                usage += turn_usage;
            }

            if response.tool_calls().is_empty() {
                let content = response.text().unwrap_or_default().to_owned();
                info!(agent = %self.spec.name, rounds = round, "agent run completed");
                return Ok(AgentOutcome { content, usage });
            }

            messages.push(response.message.clone());
            let results = run_tool_calls(
                &self.tools,
                &self.ctx,
                &self.producer,
                response.tool_calls(),
            )
            .await?;
            messages.extend(results);
        }

        // Round cap: report it and force a content-only final turn. The
        // run still succeeds.
        self.producer
            .emit(EventBody::Error {
                error_kind: ErrorKind::Internal,
                message: format!("tool round cap ({max_rounds}) reached; forcing final answer"),
                fatal: false,
            })
            .await;

        let response = stream_turn(
            self.backend.as_ref(),
            &self.ctx,
            &self.producer,
            &self.spec.model,
            messages,
            Vec::new(),
            ToolChoice::None,
            &mut reasoning_index,
        )
        .await?;
        if let Some(turn_usage) = response.usage {
            usage += turn_usage;
        }
        Ok(AgentOutcome {
            content: response.text().unwrap_or_default().to_owned(),
            usage,
        })
    }

    fn assemble_context(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::new();

        let instructions = if self.spec.instructions.is_empty() {
            format!("You are {}.", self.spec.name)
        } else {
            self.spec.instructions.clone()
        };
        messages.push(ChatMessage::system(instructions));

        if self.spec.add_history_to_context {
            for exchange in &self.history {
                messages.push(ChatMessage::user(exchange.user_input.clone()));
                messages.push(ChatMessage::assistant(exchange.final_output.clone()));
            }
        }

        if !self.memory_hints.is_empty() {
            messages.push(ChatMessage::system(format!(
                "What you remember about this user:\n{}",
                bullet_list(&self.memory_hints)
            )));
        }
        if !self.knowledge_hints.is_empty() {
            messages.push(ChatMessage::system(format!(
                "Relevant passages from the user's documents:\n{}",
                bullet_list(&self.knowledge_hints)
            )));
        }
        for extra in &self.extra_context {
            messages.push(ChatMessage::system(extra.clone()));
        }

        messages.push(ChatMessage::user(self.input.clone()));
        messages
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Streams one model turn, forwarding displayable chunks as events, and
/// returns the reassembled response.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn stream_turn(
    backend: &dyn LlmBackend,
    ctx: &RunContext,
    producer: &Producer,
    model: &str,
    messages: Vec<ChatMessage>,
    definitions: Vec<ToolDefinition>,
    tool_choice: ToolChoice,
    reasoning_index: &mut u64,
) -> Result<ChatResponse> {
    let model = if model.is_empty() {
        backend.default_model().to_owned()
    } else {
        model.to_owned()
    };
    let request = ChatRequest::new(model, messages)
        .tools(definitions)
        .tool_choice(tool_choice)
        .stream();

    let mut stream = backend.chat_stream(&request).await?;
    let mut aggregator = StreamAggregator::new();

    while let Some(chunk) = stream.next().await {
        ctx.ensure_active()?;
        let chunk = chunk?;
        match &chunk {
            StreamChunk::Text(delta) => {
                producer
                    .emit(EventBody::ContentDelta {
                        text: delta.clone(),
                    })
                    .await;
            }
            StreamChunk::Reasoning(delta) => {
                *reasoning_index += 1;
                producer
                    .emit(EventBody::ReasoningStep {
                        index: *reasoning_index,
                        title: reasoning_title(delta),
                        detail: Some(delta.clone()),
                    })
                    .await;
            }
            _ => {}
        }
        aggregator.apply(&chunk);
    }

    Ok(aggregator.into_response())
}

fn reasoning_title(fragment: &str) -> String {
    const MAX: usize = 60;
    let line = fragment.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= MAX {
        line.to_owned()
    } else {
        line.chars().take(MAX).collect()
    }
}

/// Executes a batch of tool calls and returns their result messages in
/// call order.
///
/// Invocations run concurrently; events are emitted sequentially (all
/// `tool_call_started` frames, then the completions) so the producer's
/// sequence stays strictly ordered.
pub(crate) async fn run_tool_calls(
    tools: &ToolSet,
    ctx: &RunContext,
    producer: &Producer,
    calls: &[ToolCall],
) -> Result<Vec<ChatMessage>> {
    for call in calls {
        producer
            .emit(EventBody::ToolCallStarted {
                tool_name: call.name.clone(),
                tool_args: call.arguments.clone(),
            })
            .await;
    }

    let tool_ctx = ToolContext::new(&ctx.user_id, &ctx.run_id, ctx.cancel.clone());
    let timeout = ctx.config.tool_timeout;
    let invocations = calls
        .iter()
        .map(|call| invoke_with_retry(tools, &tool_ctx, call, timeout));
    let outcomes = futures::future::join_all(invocations).await;

    let mut messages = Vec::with_capacity(calls.len());
    for (call, (result, duration_ms)) in calls.iter().zip(outcomes) {
        match result {
            Ok(output) => {
                producer
                    .emit(EventBody::ToolCallCompleted {
                        tool_name: call.name.clone(),
                        result: output.data.clone(),
                        error_kind: None,
                        duration_ms,
                    })
                    .await;
                ctx.messages
                    .push_tool(&call.name, &output.content, Some(call.arguments.clone()));
                messages.push(ChatMessage::tool(&call.id, &output.content));
            }
            Err(error) => {
                producer
                    .emit(EventBody::ToolCallCompleted {
                        tool_name: call.name.clone(),
                        result: None,
                        error_kind: Some(error.kind()),
                        duration_ms,
                    })
                    .await;
                let text = format!("Tool '{}' failed ({}): {}", call.name, error.kind(), error.message());
                ctx.messages
                    .push_tool(&call.name, &text, Some(call.arguments.clone()));
                messages.push(ChatMessage::tool(&call.id, text));
            }
        }
    }
    Ok(messages)
}

/// Invokes one tool, retrying once on timeout when the tool declares
/// idempotency.
async fn invoke_with_retry(
    tools: &ToolSet,
    ctx: &ToolContext,
    call: &ToolCall,
    timeout: std::time::Duration,
) -> (std::result::Result<ToolOutput, ToolError>, u64) {
    let started = Instant::now();

    let mut result = tools
        .invoke(ctx, &call.name, call.arguments.clone(), timeout)
        .await;

    if let Err(error) = &result
        && error.kind() == ErrorKind::Timeout
        && tools.is_idempotent(&call.name)
    {
        debug!(tool = %call.name, "retrying idempotent tool after timeout");
        result = tools
            .invoke(ctx, &call.name, call.arguments.clone(), timeout)
            .await;
    }

    (result, started.elapsed().as_millis() as u64)
}
