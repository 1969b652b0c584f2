//! Team execution — a leader with delegation.
//!
//! A team behaves as an agent whose system prompt carries a roster of its
//! members and whose tool set includes the synthetic
//! `delegate_task_to_member` (and, unless every delegation fans out to all
//! members, `stop_delegation`). Delegations in one leader turn form one
//! round and execute concurrently as member sub-runs; each sub-run streams
//! through its own child producer, bracketed by `run_started` /
//! `run_completed` events, and returns a synthetic tool result the leader
//! sees on its next turn.
//!
//! The per-run phase progression is `Planning → (Delegating ⇌ Collecting)*
//! → Synthesizing → Done`: a leader turn with no delegation ends the run
//! directly; `respond_directly` ends it with the member output; the
//! delegation round cap forces synthesis with a non-fatal `error` event.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Value, json};
use tracing::{Instrument as _, info, info_span, warn};

use crate::agent::{AgentExecution, AgentOutcome, run_tool_calls, stream_turn};
use crate::bus::Producer;
use crate::context::RunContext;
use crate::error::{ErrorKind, Result, RuntimeError};
use crate::event::EventBody;
use crate::llm::{ChatMessage, LlmBackend, ToolCall, ToolChoice};
use crate::model::RunStatus;
use crate::session::Exchange;
use crate::spec::{MemberSpec, TeamSpec, ToolRegistry};
use crate::tool::ToolDefinition;
use crate::usage::Usage;

/// Name of the synthetic delegation tool.
pub const DELEGATE_TOOL: &str = "delegate_task_to_member";
/// Name of the synthetic delegation-phase terminator.
pub const STOP_TOOL: &str = "stop_delegation";

/// Shared collaborators handed down the delegation tree.
#[derive(Clone)]
pub(crate) struct TeamDeps {
    pub backend: Arc<dyn LlmBackend>,
    pub tools: Arc<ToolRegistry>,
}

/// One team run over a prepared context.
pub(crate) struct TeamExecution {
    pub spec: Arc<TeamSpec>,
    pub deps: TeamDeps,
    pub ctx: RunContext,
    pub producer: Producer,
    pub input: String,
    pub history: Vec<Exchange>,
}

/// A parsed, validated delegation out of one leader turn.
struct PlannedDelegation {
    member: MemberSpec,
    task: String,
    expected_output: String,
}

/// What one member sub-run produced.
struct MemberReport {
    member_id: String,
    task: String,
    status: RunStatus,
    output: String,
    error_kind: Option<ErrorKind>,
    usage: Usage,
    output_ref: Option<String>,
}

impl MemberReport {
    fn to_json(&self) -> Value {
        let mut value = json!({
            "member_id": self.member_id,
            "status": self.status,
            "output": self.output,
            "metrics": {
                "tokens_in": self.usage.input_tokens,
                "tokens_out": self.usage.output_tokens,
            },
        });
        if let Some(kind) = self.error_kind
            && let Some(map) = value.as_object_mut()
        {
            map.insert("error_kind".to_owned(), json!(kind));
        }
        value
    }
}

impl TeamExecution {
    /// Runs the leader loop to completion. Boxed so nested teams can
    /// recurse through member execution.
    pub(crate) fn run(self) -> BoxFuture<'static, Result<AgentOutcome>> {
        let span = info_span!(
            "team",
            team.name = %self.spec.name,
            run_id = %self.ctx.run_id,
            members = self.spec.members.len(),
        );
        Box::pin(self.run_inner().instrument(span))
    }

    async fn run_inner(self) -> Result<AgentOutcome> {
        let spec = Arc::clone(&self.spec);
        let config = Arc::clone(&self.ctx.config);
        let flags = spec.flags;

        let leader_tools = self.deps.tools.resolve(&spec.tools)?;
        let delegation_enabled =
            !spec.members.is_empty() && config.max_delegation_rounds > 0;

        let mut base_definitions = leader_tools.definitions();
        if delegation_enabled {
            base_definitions.push(delegate_definition(&spec));
            if !flags.delegate_to_all_members {
                base_definitions.push(stop_definition());
            }
        }

        let mut messages = self.assemble_leader_context();
        let mut usage = Usage::zero();
        let mut reasoning_index = 0u64;
        let mut delegation_round = 0usize;
        let mut delegation_closed = !delegation_enabled;
        let mut interactions: Vec<String> = Vec::new();
        let mut child_producers: HashMap<String, Producer> = HashMap::new();
        let max_rounds = config.max_tool_rounds.max(1);

        for _round in 1..=max_rounds {
            self.ctx.ensure_active()?;

            let definitions = if delegation_closed {
                leader_tools.definitions()
            } else {
                base_definitions.clone()
            };
            let response = stream_turn(
                self.deps.backend.as_ref(),
                &self.ctx,
                &self.producer,
                &spec.leader_model,
                messages.clone(),
                definitions,
                ToolChoice::Auto,
                &mut reasoning_index,
            )
            .await?;
            if let Some(turn_usage) = response.usage {
                usage += turn_usage;
            }

            if response.tool_calls().is_empty() {
                info!(team = %spec.name, "leader produced final content");
                return Ok(AgentOutcome {
                    content: response.text().unwrap_or_default().to_owned(),
                    usage,
                });
            }
            messages.push(response.message.clone());

            let mut delegations: Vec<ToolCall> = Vec::new();
            let mut stops: Vec<ToolCall> = Vec::new();
            let mut regular: Vec<ToolCall> = Vec::new();
            for call in response.tool_calls() {
                match call.name.as_str() {
                    DELEGATE_TOOL => delegations.push(call.clone()),
                    STOP_TOOL => stops.push(call.clone()),
                    _ => regular.push(call.clone()),
                }
            }

            if !regular.is_empty() {
                let results =
                    run_tool_calls(&leader_tools, &self.ctx, &self.producer, &regular).await?;
                messages.extend(results);
            }

            for call in &stops {
                self.emit_synthetic_completion(call, Ok(json!({"status": "delegation_closed"})))
                    .await;
                messages.push(ChatMessage::tool(
                    &call.id,
                    "Delegation phase closed. Produce the final answer from the gathered results.",
                ));
                delegation_closed = true;
            }

            if delegations.is_empty() {
                continue;
            }

            if delegation_closed {
                for call in &delegations {
                    self.emit_synthetic_completion(
                        call,
                        Err((ErrorKind::InvalidArgs, "delegation phase is closed")),
                    )
                    .await;
                    messages.push(ChatMessage::tool(
                        &call.id,
                        "Delegation is closed for this run; answer with what you have.",
                    ));
                }
                continue;
            }

            delegation_round += 1;
            if delegation_round > config.max_delegation_rounds {
                self.producer
                    .emit(EventBody::Error {
                        error_kind: ErrorKind::Internal,
                        message: format!(
                            "delegation round cap ({}) reached; synthesizing",
                            config.max_delegation_rounds
                        ),
                        fatal: false,
                    })
                    .await;
                delegation_closed = true;
                for call in &delegations {
                    self.emit_synthetic_completion(
                        call,
                        Err((ErrorKind::Internal, "delegation round cap reached")),
                    )
                    .await;
                    messages.push(ChatMessage::tool(
                        &call.id,
                        "Delegation round cap reached; answer with what you have.",
                    ));
                }
                continue;
            }

            // Parse calls, resolve members, expand delegate_to_all.
            let (plan, call_messages) = self.plan_round(&delegations, &mut messages).await;
            if plan.is_empty() {
                continue;
            }

            let reports = self
                .run_members(&plan, &mut child_producers, &interactions)
                .await;

            for report in &reports {
                self.producer
                    .emit(EventBody::MemberCompleted {
                        member_id: report.member_id.clone(),
                        status: report.status,
                        output_ref: report.output_ref.clone(),
                    })
                    .await;
                usage += report.usage;
                interactions.push(format!(
                    "{}: task: {} | output: {}",
                    report.member_id, report.task, report.output
                ));
            }

            // Answer each delegation call with its synthetic tool result.
            // `tool_call_started` was already emitted at plan time; the
            // completion follows every member's own `run_completed` (§5).
            for (call_id, report_indices) in call_messages {
                let payload: Value = if report_indices.len() == 1 {
                    reports[report_indices[0]].to_json()
                } else {
                    Value::Array(report_indices.iter().map(|&i| reports[i].to_json()).collect())
                };
                let failed_kind = report_indices
                    .iter()
                    .filter(|&&i| reports[i].status != RunStatus::Succeeded)
                    .find_map(|&i| reports[i].error_kind.or(Some(ErrorKind::Internal)));
                self.emit_call_completed(
                    match failed_kind {
                        Some(kind) => Err(kind),
                        None => Ok(payload.clone()),
                    },
                )
                .await;
                messages.push(ChatMessage::tool(&call_id, payload.to_string()));
            }

            if flags.delegate_to_all_members
                && let Some(failed) = reports.iter().find(|r| r.status != RunStatus::Succeeded)
            {
                let kind = failed.error_kind.unwrap_or(ErrorKind::Internal);
                let message = format!(
                    "member '{}' failed ({kind}) during fan-out delegation",
                    failed.member_id
                );
                return Err(match kind {
                    ErrorKind::Timeout => RuntimeError::Timeout(message),
                    ErrorKind::Cancelled => RuntimeError::Cancelled,
                    _ => RuntimeError::Internal(message),
                });
            }

            if flags.respond_directly {
                let outputs: Vec<&str> = reports
                    .iter()
                    .filter(|r| r.status == RunStatus::Succeeded)
                    .map(|r| r.output.as_str())
                    .collect();
                if outputs.is_empty() {
                    return Err(RuntimeError::internal(
                        "respond_directly: every delegated member failed",
                    ));
                }
                info!(team = %spec.name, "adopting member output as run output");
                return Ok(AgentOutcome {
                    content: outputs.join("\n\n"),
                    usage,
                });
            }
        }

        // Leader tool-round cap: force synthesis.
        self.producer
            .emit(EventBody::Error {
                error_kind: ErrorKind::Internal,
                message: format!("tool round cap ({max_rounds}) reached; forcing final answer"),
                fatal: false,
            })
            .await;
        let response = stream_turn(
            self.deps.backend.as_ref(),
            &self.ctx,
            &self.producer,
            &spec.leader_model,
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

    /// Parses one turn's delegation calls into a concurrent round.
    ///
    /// Returns the planned delegations plus, per originating call id, the
    /// indices of the reports that will answer it. Unknown members and
    /// malformed arguments turn into synthetic tool errors the leader can
    /// react to on its next turn.
    async fn plan_round(
        &self,
        delegations: &[ToolCall],
        messages: &mut Vec<ChatMessage>,
    ) -> (Vec<PlannedDelegation>, Vec<(String, Vec<usize>)>) {
        let flags = self.spec.flags;
        let mut plan: Vec<PlannedDelegation> = Vec::new();
        let mut call_map: Vec<(String, Vec<usize>)> = Vec::new();

        // Every delegation call is announced before any member starts.
        for call in delegations {
            self.producer
                .emit(EventBody::ToolCallStarted {
                    tool_name: call.name.clone(),
                    tool_args: call.arguments.clone(),
                })
                .await;
        }

        if flags.delegate_to_all_members {
            // One fan-out round: every member receives the same task. Extra
            // delegations in the turn are merged; every call id is answered
            // with the full result set.
            let task = delegations
                .first()
                .and_then(|call| parse_delegation(&call.arguments).ok())
                .map_or_else(|| self.input.clone(), |(_, task, _)| task);
            let expected = delegations
                .first()
                .and_then(|call| parse_delegation(&call.arguments).ok())
                .map(|(_, _, expected)| expected)
                .unwrap_or_default();

            for member in &self.spec.members {
                plan.push(PlannedDelegation {
                    member: member.clone(),
                    task: task.clone(),
                    expected_output: expected.clone(),
                });
            }
            let all: Vec<usize> = (0..plan.len()).collect();
            for call in delegations {
                call_map.push((call.id.clone(), all.clone()));
            }
            return (plan, call_map);
        }

        // A member appears at most once per round (repeat delegations in
        // the same turn merge onto the first), so one sub-run per producer
        // is in flight at a time.
        let mut planned_members: HashMap<String, usize> = HashMap::new();
        for call in delegations {
            match parse_delegation(&call.arguments) {
                Ok((member_id, task, expected_output)) => {
                    match self.spec.find_member(&member_id) {
                        Some(member) => {
                            let index = *planned_members
                                .entry(member.id().to_owned())
                                .or_insert_with(|| {
                                    plan.push(PlannedDelegation {
                                        member: member.clone(),
                                        task,
                                        expected_output,
                                    });
                                    plan.len() - 1
                                });
                            call_map.push((call.id.clone(), vec![index]));
                        }
                        None => {
                            warn!(member = %member_id, "delegation to unknown member");
                            self.emit_call_completed(Err(ErrorKind::InvalidArgs)).await;
                            messages.push(ChatMessage::tool(
                                &call.id,
                                format!("Unknown member '{member_id}'. Known members are listed in your instructions."),
                            ));
                        }
                    }
                }
                Err(message) => {
                    self.emit_call_completed(Err(ErrorKind::InvalidArgs)).await;
                    messages.push(ChatMessage::tool(
                        &call.id,
                        format!("Malformed delegation arguments: {message}"),
                    ));
                }
            }
        }
        (plan, call_map)
    }

    /// Executes one delegation round concurrently and returns the reports
    /// in plan order.
    async fn run_members(
        &self,
        plan: &[PlannedDelegation],
        child_producers: &mut HashMap<String, Producer>,
        interactions: &[String],
    ) -> Vec<MemberReport> {
        let flags = self.spec.flags;

        // Announce every delegation before any member starts, so the
        // leader's event sequence stays strictly ordered.
        for planned in plan {
            let member_id = planned.member.id().to_owned();
            self.producer
                .emit(EventBody::MemberDelegation {
                    from: self.spec.name.clone(),
                    to: member_id.clone(),
                    task: planned.task.clone(),
                    expected_output: planned.expected_output.clone(),
                })
                .await;
            self.producer
                .emit(EventBody::MemberStarted {
                    member_id: member_id.clone(),
                    task: planned.task.clone(),
                })
                .await;
            self.ctx.messages.push_delegation(
                &self.spec.name,
                &planned.task,
                json!({
                    "member_id": member_id,
                    "task_description": planned.task,
                    "expected_output": planned.expected_output,
                }),
            );
        }

        let mut join_set = tokio::task::JoinSet::new();
        for (index, planned) in plan.iter().enumerate() {
            let member_id = planned.member.id().to_owned();
            let producer = child_producers
                .entry(member_id.clone())
                .or_insert_with(|| self.producer.child(&member_id))
                .clone();

            let job = MemberJob {
                member: planned.member.clone(),
                deps: self.deps.clone(),
                ctx: self.ctx.clone(),
                producer,
                task: planned.task.clone(),
                input: if flags.determine_input_for_members {
                    planned.task.clone()
                } else {
                    self.input.clone()
                },
                history: if flags.add_team_history_to_members {
                    self.history.clone()
                } else {
                    Vec::new()
                },
                interactions: if flags.share_member_interactions {
                    interactions.to_vec()
                } else {
                    Vec::new()
                },
            };
            join_set.spawn(async move { (index, execute_member(job).await) });
        }

        let mut slots: Vec<Option<MemberReport>> = (0..plan.len()).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(e) => warn!(error = %e, "member task join failed"),
            }
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| MemberReport {
                    member_id: plan[index].member.id().to_owned(),
                    task: plan[index].task.clone(),
                    status: RunStatus::Failed,
                    output: String::new(),
                    error_kind: Some(ErrorKind::Internal),
                    usage: Usage::zero(),
                    output_ref: None,
                })
            })
            .collect()
    }

    /// Emits the completion frame for a synthetic (delegation-family) call.
    async fn emit_call_completed(&self, result: std::result::Result<Value, ErrorKind>) {
        let body = match result {
            Ok(value) => EventBody::ToolCallCompleted {
                tool_name: DELEGATE_TOOL.to_owned(),
                result: Some(value),
                error_kind: None,
                duration_ms: 0,
            },
            Err(kind) => EventBody::ToolCallCompleted {
                tool_name: DELEGATE_TOOL.to_owned(),
                result: None,
                error_kind: Some(kind),
                duration_ms: 0,
            },
        };
        self.producer.emit(body).await;
    }

    /// Emits both lifecycle frames for a synthetic call handled without a
    /// member round (stop, closed-phase, and cap refusals).
    async fn emit_synthetic_completion(
        &self,
        call: &ToolCall,
        result: std::result::Result<Value, (ErrorKind, &str)>,
    ) {
        self.producer
            .emit(EventBody::ToolCallStarted {
                tool_name: call.name.clone(),
                tool_args: call.arguments.clone(),
            })
            .await;
        let body = match result {
            Ok(value) => EventBody::ToolCallCompleted {
                tool_name: call.name.clone(),
                result: Some(value),
                error_kind: None,
                duration_ms: 0,
            },
            Err((kind, _)) => EventBody::ToolCallCompleted {
                tool_name: call.name.clone(),
                result: None,
                error_kind: Some(kind),
                duration_ms: 0,
            },
        };
        self.producer.emit(body).await;
    }

    fn assemble_leader_context(&self) -> Vec<ChatMessage> {
        let spec = &self.spec;
        let mut system = if spec.instructions.is_empty() {
            format!("You are {}, the leader of a team of specialists.", spec.name)
        } else {
            spec.instructions.clone()
        };

        if !spec.members.is_empty() {
            system.push_str("\n\nYour team members:\n");
            for member in &spec.members {
                system.push_str(&format!("- id: {} | name: {}", member.id(), member.name()));
                if !member.role().is_empty() {
                    system.push_str(&format!(" | role: {}", member.role()));
                }
                if spec.flags.add_member_tools_to_context {
                    let tools = member.tool_names();
                    if !tools.is_empty() {
                        system.push_str(&format!(" | tools: {}", tools.join(", ")));
                    }
                }
                system.push('\n');
            }
            system.push_str(
                "\nTo hand a subtask to a member, call delegate_task_to_member with the \
                 member's id, a task description, and the expected output. Delegate when a \
                 member is better suited; answer directly when you can.",
            );
            if !spec.flags.delegate_to_all_members {
                system.push_str(
                    " Call stop_delegation once the gathered results are sufficient.",
                );
            }
        }

        let mut messages = vec![ChatMessage::system(system)];
        for exchange in &self.history {
            messages.push(ChatMessage::user(exchange.user_input.clone()));
            messages.push(ChatMessage::assistant(exchange.final_output.clone()));
        }
        messages.push(ChatMessage::user(self.input.clone()));
        messages
    }
}

/// Everything one member sub-run needs, owned.
struct MemberJob {
    member: MemberSpec,
    deps: TeamDeps,
    ctx: RunContext,
    producer: Producer,
    task: String,
    input: String,
    history: Vec<Exchange>,
    interactions: Vec<String>,
}

/// Runs one member sub-run and reports its outcome.
///
/// The sub-run is bracketed by `run_started` / terminal events on the
/// member's own producer; its output is persisted as a tool message whose
/// id becomes the report's `output_ref`.
async fn execute_member(job: MemberJob) -> MemberReport {
    let member_id = job.member.id().to_owned();
    let task = job.task.clone();
    job.producer.emit(EventBody::RunStarted {}).await;

    let member_timeout = job.ctx.config.member_timeout;
    let outcome = tokio::time::timeout(member_timeout, run_member(&job)).await;

    match outcome {
        Ok(Ok(outcome)) => {
            let output_ref = job
                .ctx
                .messages
                .push_tool(&member_id, &outcome.content, None);
            job.producer
                .emit(EventBody::RunCompleted {
                    output_ref: Some(output_ref.clone()),
                })
                .await;
            MemberReport {
                member_id,
                task,
                status: RunStatus::Succeeded,
                output: outcome.content,
                error_kind: None,
                usage: outcome.usage,
                output_ref: Some(output_ref),
            }
        }
        Ok(Err(RuntimeError::Cancelled)) => {
            job.producer.emit(EventBody::RunCancelled {}).await;
            MemberReport {
                member_id,
                task,
                status: RunStatus::Cancelled,
                output: String::new(),
                error_kind: Some(ErrorKind::Cancelled),
                usage: Usage::zero(),
                output_ref: None,
            }
        }
        Ok(Err(error)) => {
            warn!(member = %member_id, error = %error, "member sub-run failed");
            job.producer
                .emit(EventBody::RunFailed {
                    error_kind: error.kind(),
                    message: error.to_string(),
                })
                .await;
            MemberReport {
                member_id,
                task,
                status: RunStatus::Failed,
                output: String::new(),
                error_kind: Some(error.kind()),
                usage: Usage::zero(),
                output_ref: None,
            }
        }
        Err(_elapsed) => {
            warn!(member = %member_id, "member sub-run timed out");
            job.producer
                .emit(EventBody::RunFailed {
                    error_kind: ErrorKind::Timeout,
                    message: format!("member exceeded {}s", member_timeout.as_secs()),
                })
                .await;
            MemberReport {
                member_id,
                task,
                status: RunStatus::Failed,
                output: String::new(),
                error_kind: Some(ErrorKind::Timeout),
                usage: Usage::zero(),
                output_ref: None,
            }
        }
    }
}

async fn run_member(job: &MemberJob) -> Result<AgentOutcome> {
    let mut extra_context = Vec::new();
    if !job.interactions.is_empty() {
        extra_context.push(format!(
            "Earlier in this request, other members reported:\n{}",
            job.interactions.join("\n")
        ));
    }

    match &job.member {
        MemberSpec::Agent(agent) => {
            let tools = job.deps.tools.resolve(&agent.tools)?;
            AgentExecution {
                spec: Arc::clone(agent),
                backend: Arc::clone(&job.deps.backend),
                tools,
                ctx: job.ctx.clone(),
                producer: job.producer.clone(),
                input: job.input.clone(),
                history: job.history.clone(),
                memory_hints: Vec::new(),
                knowledge_hints: Vec::new(),
                extra_context,
            }
            .run()
            .await
        }
        MemberSpec::Team(team) => {
            TeamExecution {
                spec: Arc::clone(team),
                deps: job.deps.clone(),
                ctx: job.ctx.clone(),
                producer: job.producer.clone(),
                input: job.input.clone(),
                history: job.history.clone(),
            }
            .run()
            .await
        }
    }
}

fn parse_delegation(arguments: &Value) -> std::result::Result<(String, String, String), &'static str> {
    let object = arguments.as_object().ok_or("arguments must be an object")?;
    let member_id = object
        .get("member_id")
        .and_then(Value::as_str)
        .ok_or("missing member_id")?;
    let task = object
        .get("task_description")
        .and_then(Value::as_str)
        .ok_or("missing task_description")?;
    let expected = object
        .get("expected_output")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Ok((member_id.to_owned(), task.to_owned(), expected.to_owned()))
}

fn delegate_definition(spec: &TeamSpec) -> ToolDefinition {
    let ids: Vec<&str> = spec.members.iter().map(MemberSpec::id).collect();
    ToolDefinition::new(
        DELEGATE_TOOL,
        format!(
            "Assign a task to one team member and receive its result. \
             Known member ids: {}.",
            ids.join(", ")
        ),
        json!({
            "type": "object",
            "properties": {
                "member_id": {
                    "type": "string",
                    "description": "Id of the member to delegate to"
                },
                "task_description": {
                    "type": "string",
                    "description": "The task the member should perform"
                },
                "expected_output": {
                    "type": "string",
                    "description": "What the member is expected to return"
                }
            },
            "required": ["member_id", "task_description"]
        }),
    )
}

fn stop_definition() -> ToolDefinition {
    ToolDefinition::new(
        STOP_TOOL,
        "Signal that the gathered member results are sufficient and no further \
         delegation is needed.",
        json!({"type": "object", "properties": {}}),
    )
}
