//! Persisted entities.
//!
//! These are the row types stored by a [`RecordStore`](crate::store::RecordStore).
//! Ownership is strictly parent→child: sessions own runs, runs own messages
//! and events, users own memories and knowledge documents. Reverse
//! navigation is by indexed lookup, never by reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generates a fresh identifier.
#[must_use]
pub fn fresh_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// An end user. Created by the auth collaborator; the runtime only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Stable identifier scoping every other entity.
    pub user_id: String,
    /// Contact address.
    pub email: String,
    /// Display name.
    pub display_name: String,
    /// Role label (free-form, e.g. "admin").
    pub role: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A container for an ordered sequence of runs by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier.
    pub session_id: String,
    /// Owning user.
    pub user_id: String,
    /// Display name (defaults from the first input).
    pub name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Most recent run, if any.
    pub last_run_id: Option<String>,
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet executing.
    Pending,
    /// Executing and emitting events.
    Streaming,
    /// Terminal: finished with output.
    Succeeded,
    /// Terminal: finished with an error.
    Failed,
    /// Terminal: cancelled by the caller.
    Cancelled,
}

impl RunStatus {
    /// Returns the storage string for this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses a storage string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "streaming" => Some(Self::Streaming),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states admit no further transition.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run identifier.
    pub run_id: String,
    /// Owning session.
    pub session_id: String,
    /// Owning user.
    pub user_id: String,
    /// Current lifecycle state.
    pub status: RunStatus,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Completion time, once terminal.
    pub finished_at: Option<DateTime<Utc>>,
    /// Message id of the persisted user input.
    pub input_ref: Option<String>,
    /// Message id of the persisted final output.
    pub output_ref: Option<String>,
    /// Failure description, when `status == Failed`.
    pub error: Option<String>,
}

/// Role of a persisted run message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// The end user's input.
    User,
    /// Output authored by an agent or team leader.
    Agent,
    /// The leader's directive to a member.
    Delegation,
    /// A tool's structured output.
    Tool,
}

impl MessageRole {
    /// Returns the storage string for this role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::Delegation => "delegation",
            Self::Tool => "tool",
        }
    }

    /// Parses a storage string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "agent" => Some(Self::Agent),
            "delegation" => Some(Self::Delegation),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// Archival record of one exchange element within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Message identifier (idempotency key for batched writes).
    pub message_id: String,
    /// Owning run.
    pub run_id: String,
    /// Who authored it.
    pub role: MessageRole,
    /// Agent or team name that produced it.
    pub author_id: String,
    /// Text content.
    pub content: String,
    /// Tool calls attached to an agent message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<Value>,
    /// Arguments, for `Tool`/`Delegation` rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Monotonic position within the run.
    pub seq: u64,
}

/// Persisted projection of an [`Event`](crate::event::Event).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event identifier.
    pub event_id: String,
    /// Owning run.
    pub run_id: String,
    /// Emitting producer.
    pub producer_id: String,
    /// Wire kind string.
    pub kind: String,
    /// Payload JSON.
    pub payload: Value,
    /// Emission time.
    pub ts: DateTime<Utc>,
    /// Per-producer sequence.
    pub seq: u64,
    /// Cross-producer interleaving order.
    pub run_seq: u64,
}

/// A per-user memory extracted from past runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Memory identifier.
    pub memory_id: String,
    /// Owning user.
    pub user_id: String,
    /// Normalized topic tags.
    pub topics: Vec<String>,
    /// The remembered fact.
    pub text: String,
    /// Run the memory was extracted from, when known.
    pub source_run_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Set when the memory was merged away; archived memories are excluded
    /// from retrieval but retained.
    pub archived_at: Option<DateTime<Utc>>,
}

impl MemoryRecord {
    /// Returns `true` when the memory participates in retrieval.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.archived_at.is_none()
    }
}

/// A knowledge base document owned by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Document identifier.
    pub doc_id: String,
    /// Owning user.
    pub user_id: String,
    /// Display name.
    pub name: String,
    /// MIME type of the source.
    pub mime: String,
    /// Ingestion time.
    pub created_at: DateTime<Utc>,
}

/// A bounded, independently embedded segment of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Chunk identifier.
    pub chunk_id: String,
    /// Owning document.
    pub doc_id: String,
    /// Owning user (denormalized for the isolation filter).
    pub user_id: String,
    /// Position within the document.
    pub ordinal: u64,
    /// Segment text.
    pub text: String,
    /// Byte offset of the segment in the source document.
    pub source_offset: u64,
}
