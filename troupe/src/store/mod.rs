//! Durable storage seams.
//!
//! [`RecordStore`] is the relational surface (users, sessions, runs,
//! messages, events, memories, knowledge metadata); [`VectorStore`] is the
//! similarity surface. Both are traits so deployments can swap engines;
//! the bundled implementations are [`SqliteRecordStore`] and
//! [`InMemoryVectorStore`].

mod sqlite;
mod vector;

pub use sqlite::SqliteRecordStore;
pub use vector::{InMemoryVectorStore, MetadataFilter, VectorMatch, VectorPoint, VectorStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    ChunkRecord, DocumentRecord, EventRecord, MemoryRecord, MessageRecord, RunRecord, RunStatus,
    SessionRecord, UserRecord,
};

/// Errors from the record store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Row (de)serialization failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Connection mutex poisoned.
    #[error("lock poisoned: {0}")]
    Lock(String),
    /// The blocking bridge task failed.
    #[error("blocking task failed: {0}")]
    Task(String),
    /// A stored row violates the schema's expectations.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Errors from the vector store.
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    /// Vector length does not match the index dimension.
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    Dimension {
        /// Index dimension.
        expected: usize,
        /// Offending vector length.
        actual: usize,
    },
    /// Backend failure.
    #[error("vector store failed: {0}")]
    Upstream(String),
}

/// Result alias for record store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The relational storage seam.
///
/// Writes that can replay are idempotent: messages by `message_id`,
/// events by `(run_id, producer_id, seq)`. Every listing that can cross
/// users takes an explicit `user_id`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // -- users ------------------------------------------------------------

    /// Inserts or refreshes a user row.
    async fn upsert_user(&self, user: &UserRecord) -> StoreResult<()>;

    /// Fetches a user.
    async fn get_user(&self, user_id: &str) -> StoreResult<Option<UserRecord>>;

    // -- sessions ---------------------------------------------------------

    /// Inserts a session.
    async fn insert_session(&self, session: &SessionRecord) -> StoreResult<()>;

    /// Fetches a session.
    async fn get_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>>;

    /// Lists a user's sessions, most recently updated first.
    async fn list_sessions(&self, user_id: &str) -> StoreResult<Vec<SessionRecord>>;

    /// Renames a session.
    async fn rename_session(&self, session_id: &str, name: &str) -> StoreResult<()>;

    /// Records the most recent run and bumps `updated_at`.
    async fn touch_session(&self, session_id: &str, last_run_id: &str) -> StoreResult<()>;

    /// Deletes a session, cascading to its runs, messages, and events.
    async fn delete_session(&self, session_id: &str) -> StoreResult<()>;

    // -- runs -------------------------------------------------------------

    /// Inserts a run row.
    async fn insert_run(&self, run: &RunRecord) -> StoreResult<()>;

    /// Fetches a run.
    async fn get_run(&self, run_id: &str) -> StoreResult<Option<RunRecord>>;

    /// Applies a status transition.
    ///
    /// Returns `false` (and writes nothing) when the run is already in a
    /// terminal status — terminal states admit no further transition.
    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
        output_ref: Option<&str>,
        error: Option<&str>,
    ) -> StoreResult<bool>;

    /// Sets the input message reference on a run.
    async fn set_run_input_ref(&self, run_id: &str, input_ref: &str) -> StoreResult<()>;

    /// Lists a session's most recent completed runs, newest first.
    async fn list_completed_runs(&self, session_id: &str, limit: usize)
    -> StoreResult<Vec<RunRecord>>;

    /// Marks every non-terminal run as failed (startup recovery).
    ///
    /// Returns the affected run ids.
    async fn sweep_unfinished_runs(&self, error: &str) -> StoreResult<Vec<String>>;

    // -- messages ---------------------------------------------------------

    /// Inserts messages, ignoring rows whose `message_id` already exists.
    async fn insert_messages(&self, messages: &[MessageRecord]) -> StoreResult<()>;

    /// Fetches one message.
    async fn get_message(&self, message_id: &str) -> StoreResult<Option<MessageRecord>>;

    /// Lists a run's messages ordered by `seq`.
    async fn list_messages(&self, run_id: &str) -> StoreResult<Vec<MessageRecord>>;

    // -- events -----------------------------------------------------------

    /// Inserts events, ignoring rows whose `(run_id, producer_id, seq)`
    /// already exists.
    async fn insert_events(&self, events: &[EventRecord]) -> StoreResult<()>;

    /// Lists a run's events ordered by `run_seq`.
    async fn list_events(&self, run_id: &str) -> StoreResult<Vec<EventRecord>>;

    // -- memories ---------------------------------------------------------

    /// Inserts a memory.
    async fn insert_memory(&self, memory: &MemoryRecord) -> StoreResult<()>;

    /// Lists a user's memories; archived rows only when requested.
    async fn list_memories(
        &self,
        user_id: &str,
        include_archived: bool,
    ) -> StoreResult<Vec<MemoryRecord>>;

    /// Archives memories at `at`, moving them out of retrieval.
    async fn archive_memories(&self, memory_ids: &[String], at: DateTime<Utc>) -> StoreResult<()>;

    // -- knowledge --------------------------------------------------------

    /// Inserts a document row.
    async fn insert_document(&self, document: &DocumentRecord) -> StoreResult<()>;

    /// Lists a user's documents.
    async fn list_documents(&self, user_id: &str) -> StoreResult<Vec<DocumentRecord>>;

    /// Inserts chunk rows.
    async fn insert_chunks(&self, chunks: &[ChunkRecord]) -> StoreResult<()>;

    /// Lists a user's chunks, optionally restricted to one document.
    async fn list_chunks(
        &self,
        user_id: &str,
        doc_id: Option<&str>,
    ) -> StoreResult<Vec<ChunkRecord>>;

    /// Fetches chunks by id, preserving input order where present.
    async fn get_chunks(&self, chunk_ids: &[String]) -> StoreResult<Vec<ChunkRecord>>;

    /// Deletes a document and its chunks, scoped to the owning user.
    async fn delete_document(&self, user_id: &str, doc_id: &str) -> StoreResult<()>;
}
