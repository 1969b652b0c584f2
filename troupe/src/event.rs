//! Run event frames.
//!
//! Every observable step of a run — content tokens, tool calls, member
//! delegations, lifecycle transitions — is an [`Event`] pushed through the
//! [`EventBus`](crate::bus::EventBus). The `kind`/`payload` encoding is
//! wire-stable: front-ends and the archival projection both depend on it.
//!
//! Ordering: `seq` is strictly increasing and gap-free per
//! `(run_id, producer_id)`; `run_seq` is a coordinator-wide monotonic
//! counter that lets a consumer re-interleave per-producer slices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;
use crate::model::{EventRecord, RunStatus};

/// Payload of an event, tagged by its wire kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EventBody {
    /// A run (or member sub-run) has started.
    RunStarted {},

    /// Terminal: the run succeeded. Closes the stream for the root producer.
    RunCompleted {
        /// Message id of the persisted final output.
        output_ref: Option<String>,
    },

    /// Terminal: the run failed.
    RunFailed {
        /// Classified failure kind.
        error_kind: ErrorKind,
        /// Human-readable description.
        message: String,
    },

    /// Terminal: the run was cancelled.
    RunCancelled {},

    /// Incremental text produced by a model.
    ContentDelta {
        /// The text fragment.
        text: String,
    },

    /// A tool invocation is beginning.
    ToolCallStarted {
        /// Tool name.
        tool_name: String,
        /// Arguments as supplied by the model.
        tool_args: Value,
    },

    /// A tool invocation finished, successfully or not.
    ToolCallCompleted {
        /// Tool name.
        tool_name: String,
        /// Structured result on success.
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Failure classification, when the call failed.
        #[serde(skip_serializing_if = "Option::is_none")]
        error_kind: Option<ErrorKind>,
        /// Wall-clock duration of the invocation.
        duration_ms: u64,
    },

    /// A member sub-run is beginning.
    MemberStarted {
        /// Member identifier.
        member_id: String,
        /// The task handed to the member.
        task: String,
    },

    /// A member sub-run finished.
    MemberCompleted {
        /// Member identifier.
        member_id: String,
        /// Outcome of the sub-run.
        status: RunStatus,
        /// Message id of the persisted member output, when available.
        output_ref: Option<String>,
    },

    /// The leader directed a task to a member.
    MemberDelegation {
        /// Delegating producer (leader identity).
        from: String,
        /// Target member identifier.
        to: String,
        /// Task description.
        task: String,
        /// What the leader expects back.
        expected_output: String,
    },

    /// A model reasoning fragment surfaced to observers.
    ReasoningStep {
        /// Position within the producer's reasoning sequence.
        index: u64,
        /// Short label.
        title: String,
        /// Full fragment, when longer than the title.
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// Usage/cost accounting snapshot.
    Metrics {
        /// Prompt tokens.
        tokens_in: u64,
        /// Completion tokens.
        tokens_out: u64,
        /// Cost attributed to input.
        cost_in: f64,
        /// Cost attributed to output.
        cost_out: f64,
    },

    /// A non-terminal (or, when `fatal`, terminal-adjacent) error report.
    Error {
        /// Classified kind.
        error_kind: ErrorKind,
        /// Human-readable description.
        message: String,
        /// `true` when the run cannot continue.
        fatal: bool,
    },
}

impl EventBody {
    /// Returns the wire kind string.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted {} => "run_started",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled {} => "run_cancelled",
            Self::ContentDelta { .. } => "content_delta",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallCompleted { .. } => "tool_call_completed",
            Self::MemberStarted { .. } => "member_started",
            Self::MemberCompleted { .. } => "member_completed",
            Self::MemberDelegation { .. } => "member_delegation",
            Self::ReasoningStep { .. } => "reasoning_step",
            Self::Metrics { .. } => "metrics",
            Self::Error { .. } => "error",
        }
    }

    /// Returns `true` if this body closes the run stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled {}
        )
    }
}

/// One framed event in a run stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub event_id: String,
    /// Run this event belongs to.
    pub run_id: String,
    /// Emitting producer (agent/team identity plus delegation path).
    pub producer_id: String,
    /// Per-`(run_id, producer_id)` sequence number, starting at 1, gap-free.
    pub seq: u64,
    /// Coordinator-assigned interleaving order across producers.
    pub run_seq: u64,
    /// Kind and payload.
    #[serde(flatten)]
    pub body: EventBody,
    /// Emission timestamp.
    pub ts: DateTime<Utc>,
}

impl Event {
    /// Returns the wire kind string.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.body.kind()
    }

    /// Returns `true` if this event closes the stream when emitted by the
    /// root producer.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.body.is_terminal()
    }

    /// Projects the event into its persisted row form.
    #[must_use]
    pub fn to_record(&self) -> EventRecord {
        let payload = match serde_json::to_value(&self.body) {
            Ok(Value::Object(map)) => map.get("payload").cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        };
        EventRecord {
            event_id: self.event_id.clone(),
            run_id: self.run_id.clone(),
            producer_id: self.producer_id.clone(),
            kind: self.kind().to_owned(),
            payload,
            ts: self.ts,
            seq: self.seq,
            run_seq: self.run_seq,
        }
    }
}
