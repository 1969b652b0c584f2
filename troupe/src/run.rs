//! Run coordination.
//!
//! [`RunCoordinator`] owns the lifecycle of a single run: it creates the
//! run record, wires the event channel, drives the team (or bare agent)
//! execution under the run deadline, enforces the cancellation grace
//! period, persists messages and events in batches, and emits the terminal
//! frame that closes the stream.
//!
//! Persistence checkpoints: the run row is written synchronously at start
//! and at every status transition; messages and events flush in batches
//! with at-least-once semantics (replays are absorbed by idempotent
//! keys). On startup, [`RunCoordinator::recover`] marks any run left
//! non-terminal by a crash as failed.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::agent::{AgentExecution, AgentOutcome};
use crate::bus::{EventBus, Producer, RunEvents};
use crate::config::RuntimeConfig;
use crate::context::{CancelToken, MessageSink, RunContext};
use crate::error::{ErrorKind, Result, RuntimeError};
use crate::event::{Event, EventBody};
use crate::llm::LlmBackend;
use crate::memory::{MemorySubsystem, compact_transcript};
use crate::model::{RunRecord, RunStatus, fresh_id};
use crate::session::SessionManager;
use crate::spec::{RunnableSpec, ToolRegistry};
use crate::store::RecordStore;
use crate::team::{TeamDeps, TeamExecution};
use crate::usage::Usage;

/// Handle to a started run: its event stream plus cancellation.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    events: RunEvents,
    cancel: CancelToken,
}

impl RunHandle {
    /// The run's identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Requests cooperative cancellation.
    ///
    /// In-flight tools are asked to stop and new delegations are refused;
    /// after the grace period the coordinator drops remaining producers
    /// and emits the terminal `run_cancelled` frame.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Receives the next event, or `None` once the stream has closed.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.next().await
    }

    /// Drains the stream to completion.
    pub async fn collect(self) -> Vec<Event> {
        self.events.collect().await
    }
}

/// Coordinates run execution against the stores and the spec registry.
pub struct RunCoordinator {
    records: Arc<dyn RecordStore>,
    sessions: Arc<SessionManager>,
    memory: Option<Arc<MemorySubsystem>>,
    deps: TeamDeps,
    config: Arc<RuntimeConfig>,
}

impl std::fmt::Debug for RunCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCoordinator").finish_non_exhaustive()
    }
}

impl RunCoordinator {
    /// Creates a coordinator.
    pub fn new(
        records: Arc<dyn RecordStore>,
        sessions: Arc<SessionManager>,
        memory: Option<Arc<MemorySubsystem>>,
        backend: Arc<dyn LlmBackend>,
        tools: Arc<ToolRegistry>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            records,
            sessions,
            memory,
            deps: TeamDeps { backend, tools },
            config,
        }
    }

    /// Startup recovery: any run a previous process left non-terminal is
    /// marked failed.
    pub async fn recover(&self) -> Result<Vec<String>> {
        let swept = self
            .records
            .sweep_unfinished_runs("process terminated before the run completed")
            .await?;
        for run_id in &swept {
            info!(run_id = %run_id, "recovered crashed run as failed");
        }
        Ok(swept)
    }

    /// Starts a run and returns its handle.
    ///
    /// The run record is created synchronously (`status = pending`) before
    /// the handle is returned; execution proceeds on a background task.
    pub async fn start(
        &self,
        user_id: &str,
        session_id: &str,
        input: &str,
        spec: RunnableSpec,
    ) -> Result<RunHandle> {
        let run_id = fresh_id();
        let run = RunRecord {
            run_id: run_id.clone(),
            session_id: session_id.to_owned(),
            user_id: user_id.to_owned(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            input_ref: None,
            output_ref: None,
            error: None,
        };
        self.records.insert_run(&run).await?;
        self.records.touch_session(session_id, &run_id).await?;

        let (bus, internal) = EventBus::channel(&run_id, self.config.event_buffer);
        let cancel = CancelToken::new();
        let ctx = RunContext {
            run_id: run_id.clone(),
            session_id: session_id.to_owned(),
            user_id: user_id.to_owned(),
            bus: bus.clone(),
            cancel: cancel.clone(),
            messages: MessageSink::new(&run_id),
            config: Arc::clone(&self.config),
        };

        let (public_tx, public_rx) = mpsc::channel(self.config.event_buffer);
        tokio::spawn(forward_events(
            internal,
            public_tx,
            Arc::clone(&self.records),
        ));

        let driver = Driver {
            records: Arc::clone(&self.records),
            sessions: Arc::clone(&self.sessions),
            memory: self.memory.clone(),
            deps: self.deps.clone(),
            spec,
            ctx,
            bus,
            input: input.to_owned(),
        };
        tokio::spawn(driver.drive());

        Ok(RunHandle {
            run_id,
            events: RunEvents::from_receiver(public_rx),
            cancel,
        })
    }
}

struct Driver {
    records: Arc<dyn RecordStore>,
    sessions: Arc<SessionManager>,
    memory: Option<Arc<MemorySubsystem>>,
    deps: TeamDeps,
    spec: RunnableSpec,
    ctx: RunContext,
    bus: EventBus,
    input: String,
}

impl Driver {
    async fn drive(self) {
        let root = self.bus.producer(self.spec.name());
        let run_id = self.ctx.run_id.clone();

        if let Err(e) = self.transition(RunStatus::Streaming, None, None).await {
            error!(run_id = %run_id, error = %e, "failed to mark run streaming");
        }
        root.emit(EventBody::RunStarted {}).await;

        let input_ref = self.ctx.messages.push_user(&self.input);
        if let Err(e) = self.records.set_run_input_ref(&run_id, &input_ref).await {
            warn!(run_id = %run_id, error = %e, "failed to record input ref");
        }

        let outcome = self.execute().await;
        self.finish(&root, outcome).await;
        // Dropping the driver (bus, context, root producer) closes the
        // internal channel; the forwarder then flushes and closes the
        // public stream.
    }

    /// Runs the execution under the run deadline and the cancellation
    /// grace period.
    async fn execute(&self) -> Result<AgentOutcome> {
        let history = self.load_history().await;
        let memory_hints = self.load_memory_hints().await;

        let work = self.execute_spec(history, memory_hints);
        let mut work = std::pin::pin!(work);

        let deadline = tokio::time::sleep(self.ctx.config.run_timeout);
        let mut deadline = std::pin::pin!(deadline);

        tokio::select! {
            outcome = &mut work => outcome,
            () = self.ctx.cancel.cancelled() => {
                // Cooperative unwind first; the hard deadline then drops
                // the execution future, aborting member tasks.
                match tokio::time::timeout(self.ctx.config.cancel_grace, &mut work).await {
                    Ok(Ok(outcome)) => Ok(outcome),
                    Ok(Err(e)) => Err(e),
                    Err(_elapsed) => {
                        warn!(run_id = %self.ctx.run_id, "cancellation grace elapsed; dropping producers");
                        Err(RuntimeError::Cancelled)
                    }
                }
            }
            () = &mut deadline => {
                Err(RuntimeError::Timeout(format!(
                    "run exceeded {}s",
                    self.ctx.config.run_timeout.as_secs()
                )))
            }
        }
    }

    async fn execute_spec(
        &self,
        history: Vec<crate::session::Exchange>,
        memory_hints: Vec<String>,
    ) -> Result<AgentOutcome> {
        match &self.spec {
            RunnableSpec::Agent(agent) => {
                let tools = self.deps.tools.resolve(&agent.tools)?;
                AgentExecution {
                    spec: Arc::clone(agent),
                    backend: Arc::clone(&self.deps.backend),
                    tools,
                    ctx: self.ctx.clone(),
                    producer: self.bus.producer(&agent.name),
                    input: self.input.clone(),
                    history,
                    memory_hints,
                    knowledge_hints: Vec::new(),
                    extra_context: Vec::new(),
                }
                .run()
                .await
            }
            RunnableSpec::Team(team) => {
                TeamExecution {
                    spec: Arc::clone(team),
                    deps: self.deps.clone(),
                    ctx: self.ctx.clone(),
                    producer: self.bus.producer(&team.name),
                    input: self.input.clone(),
                    history,
                }
                .run()
                .await
            }
        }
    }

    async fn load_history(&self) -> Vec<crate::session::Exchange> {
        let (wanted, n) = match &self.spec {
            RunnableSpec::Agent(agent) => (agent.add_history_to_context, agent.num_history_runs),
            RunnableSpec::Team(team) => (true, team.num_history_runs),
        };
        if !wanted || n == 0 {
            return Vec::new();
        }
        match self.sessions.history(&self.ctx.session_id, n).await {
            Ok(history) => history,
            Err(e) => {
                warn!(run_id = %self.ctx.run_id, error = %e, "history unavailable");
                Vec::new()
            }
        }
    }

    async fn load_memory_hints(&self) -> Vec<String> {
        let RunnableSpec::Agent(agent) = &self.spec else {
            return Vec::new();
        };
        if !agent.add_memories_to_context {
            return Vec::new();
        }
        let Some(memory) = &self.memory else {
            return Vec::new();
        };
        // Best-effort: a degraded memory store must not block the run.
        match memory.search(&self.ctx.user_id, &[], &self.input, 5).await {
            Ok(hits) => hits.into_iter().map(|hit| hit.memory.text).collect(),
            Err(e) => {
                warn!(run_id = %self.ctx.run_id, error = %e, "memory hints unavailable");
                Vec::new()
            }
        }
    }

    async fn finish(&self, root: &Producer, outcome: Result<AgentOutcome>) {
        let run_id = &self.ctx.run_id;
        let cancelled = self.ctx.cancel.is_cancelled();

        match outcome {
            Ok(outcome) if !cancelled => {
                let output_ref = self.ctx.messages.push_agent(self.spec.name(), &outcome.content);
                self.flush_messages().await;
                if let Err(e) = self
                    .transition(RunStatus::Succeeded, Some(&output_ref), None)
                    .await
                {
                    error!(run_id = %run_id, error = %e, "failed to mark run succeeded");
                }

                self.extract_memories(root, &outcome).await;
                emit_metrics(root, outcome.usage).await;
                root.emit(EventBody::RunCompleted {
                    output_ref: Some(output_ref),
                })
                .await;
                info!(run_id = %run_id, "run completed");
            }
            Ok(_) | Err(RuntimeError::Cancelled) => {
                self.flush_messages().await;
                if let Err(e) = self.transition(RunStatus::Cancelled, None, None).await {
                    error!(run_id = %run_id, error = %e, "failed to mark run cancelled");
                }
                root.emit(EventBody::RunCancelled {}).await;
                info!(run_id = %run_id, "run cancelled");
            }
            Err(e) => {
                self.flush_messages().await;
                let kind = e.kind();
                let message = e.to_string();
                if let Err(store_err) = self
                    .transition(RunStatus::Failed, None, Some(&message))
                    .await
                {
                    error!(run_id = %run_id, error = %store_err, "failed to mark run failed");
                }
                root.emit(EventBody::RunFailed {
                    error_kind: kind,
                    message,
                })
                .await;
                warn!(run_id = %run_id, kind = %kind, "run failed");
            }
        }
    }

    /// Post-run memory extraction. Failures are reported as a non-fatal
    /// event and never affect the run outcome.
    async fn extract_memories(&self, root: &Producer, outcome: &AgentOutcome) {
        let Some(memory) = &self.memory else {
            return;
        };
        let transcript = compact_transcript(&self.input, &outcome.content, &[]);
        if let Err(e) = memory
            .create(&self.ctx.user_id, Some(&self.ctx.run_id), &transcript)
            .await
        {
            warn!(run_id = %self.ctx.run_id, error = %e, "memory extraction failed");
            root.emit(EventBody::Error {
                error_kind: ErrorKind::Internal,
                message: format!("memory extraction failed: {e}"),
                fatal: false,
            })
            .await;
        }
    }

    async fn flush_messages(&self) {
        let pending = self.ctx.messages.drain();
        if pending.is_empty() {
            return;
        }
        if let Err(e) = self.records.insert_messages(&pending).await {
            warn!(run_id = %self.ctx.run_id, error = %e, "message flush failed");
        }
    }

    async fn transition(
        &self,
        status: RunStatus,
        output_ref: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool> {
        let finished = status.is_terminal().then(Utc::now);
        Ok(self
            .records
            .update_run_status(&self.ctx.run_id, status, finished, output_ref, error)
            .await?)
    }
}

async fn emit_metrics(root: &Producer, usage: Usage) {
    root.emit(EventBody::Metrics {
        tokens_in: usage.input_tokens,
        tokens_out: usage.output_tokens,
        cost_in: usage.cost_in,
        cost_out: usage.cost_out,
    })
    .await;
}

/// Forwards internal events to the public stream while persisting them in
/// batches. Runs until the internal channel closes, then flushes.
async fn forward_events(
    mut internal: RunEvents,
    public: mpsc::Sender<Event>,
    records: Arc<dyn RecordStore>,
) {
    const BATCH: usize = 32;
    let mut batch = Vec::with_capacity(BATCH);

    while let Some(event) = internal.next().await {
        batch.push(event.to_record());
        // A dropped handle stops forwarding but never persistence.
        let _ = public.send(event).await;

        if batch.len() >= BATCH {
            flush(&records, &mut batch).await;
        }
    }
    flush(&records, &mut batch).await;
}

async fn flush(records: &Arc<dyn RecordStore>, batch: &mut Vec<crate::model::EventRecord>) {
    if batch.is_empty() {
        return;
    }
    if let Err(e) = records.insert_events(batch).await {
        warn!(error = %e, dropped = batch.len(), "event flush failed");
    }
    batch.clear();
}
