//! SQLite-backed record store.
//!
//! Uses [`rusqlite`] for synchronous access, bridged to async via
//! [`tokio::task::spawn_blocking`]. WAL journal mode plus a busy timeout
//! keep concurrent readers cheap; a single connection behind a mutex
//! serializes writes.
//!
//! Idempotency: `messages` are keyed by `message_id` and `events` by
//! `(run_id, producer_id, seq)`, both inserted with `INSERT OR IGNORE`, so
//! at-least-once flushing never duplicates rows.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use super::{RecordStore, StoreError, StoreResult};
use crate::model::{
    ChunkRecord, DocumentRecord, EventRecord, MemoryRecord, MessageRecord, MessageRole, RunRecord,
    RunStatus, SessionRecord, UserRecord,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id      TEXT PRIMARY KEY,
    email        TEXT NOT NULL,
    display_name TEXT NOT NULL,
    role         TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id  TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL,
    name        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    last_run_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions (user_id);

CREATE TABLE IF NOT EXISTS runs (
    run_id      TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    user_id     TEXT NOT NULL,
    status      TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    input_ref   TEXT,
    output_ref  TEXT,
    error       TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_session ON runs (session_id);
CREATE INDEX IF NOT EXISTS idx_runs_user ON runs (user_id);

CREATE TABLE IF NOT EXISTS messages (
    message_id TEXT PRIMARY KEY,
    run_id     TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    role       TEXT NOT NULL,
    author_id  TEXT NOT NULL,
    content    TEXT NOT NULL,
    tool_calls TEXT NOT NULL,
    tool_args  TEXT,
    created_at TEXT NOT NULL,
    seq        INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_run ON messages (run_id, seq);

CREATE TABLE IF NOT EXISTS events (
    event_id    TEXT NOT NULL,
    run_id      TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    producer_id TEXT NOT NULL,
    kind        TEXT NOT NULL,
    payload     TEXT NOT NULL,
    ts          TEXT NOT NULL,
    seq         INTEGER NOT NULL,
    run_seq     INTEGER NOT NULL,
    PRIMARY KEY (run_id, producer_id, seq)
);
CREATE INDEX IF NOT EXISTS idx_events_run ON events (run_id, run_seq);

CREATE TABLE IF NOT EXISTS memories (
    memory_id     TEXT PRIMARY KEY,
    user_id       TEXT NOT NULL,
    topics        TEXT NOT NULL,
    text          TEXT NOT NULL,
    source_run_id TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_user ON memories (user_id);

CREATE TABLE IF NOT EXISTS memories_archive (
    memory_id     TEXT PRIMARY KEY,
    user_id       TEXT NOT NULL,
    topics        TEXT NOT NULL,
    text          TEXT NOT NULL,
    source_run_id TEXT,
    created_at    TEXT NOT NULL,
    archived_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_archive_user ON memories_archive (user_id);

CREATE TABLE IF NOT EXISTS knowledge_documents (
    doc_id     TEXT PRIMARY KEY,
    user_id    TEXT NOT NULL,
    name       TEXT NOT NULL,
    mime       TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_documents_user ON knowledge_documents (user_id);

CREATE TABLE IF NOT EXISTS knowledge_chunks (
    chunk_id      TEXT PRIMARY KEY,
    doc_id        TEXT NOT NULL REFERENCES knowledge_documents(doc_id) ON DELETE CASCADE,
    user_id       TEXT NOT NULL,
    ordinal       INTEGER NOT NULL,
    text          TEXT NOT NULL,
    source_offset INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_user ON knowledge_chunks (user_id);
CREATE INDEX IF NOT EXISTS idx_chunks_doc ON knowledge_chunks (doc_id);
";

/// SQLite [`RecordStore`] implementation.
///
/// Cloneable via `Arc<Mutex<Connection>>`; all blocking I/O is offloaded
/// to the tokio blocking thread pool.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Opens (or creates) a database at `path` and initializes the schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = if path.as_os_str() == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        Self::from_connection(conn)
    }

    /// Opens an ephemeral in-memory database (data lost on drop).
    pub fn in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wraps an existing [`Connection`], applying pragmas and schema setup.
    pub fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\
             PRAGMA foreign_keys = ON;\
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Bridges a synchronous closure onto the tokio blocking thread pool.
    async fn blocking<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|e| StoreError::Lock(e.to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn ts_from_sql(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

fn opt_ts_from_sql(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(ts_from_sql).transpose()
}

fn status_from_sql(raw: &str) -> StoreResult<RunStatus> {
    RunStatus::parse(raw).ok_or_else(|| StoreError::Corrupt(format!("bad run status '{raw}'")))
}

fn role_from_sql(raw: &str) -> StoreResult<MessageRole> {
    MessageRole::parse(raw).ok_or_else(|| StoreError::Corrupt(format!("bad message role '{raw}'")))
}

type RunRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn run_from_row(row: RunRow) -> StoreResult<RunRecord> {
    Ok(RunRecord {
        run_id: row.0,
        session_id: row.1,
        user_id: row.2,
        status: status_from_sql(&row.3)?,
        started_at: ts_from_sql(&row.4)?,
        finished_at: opt_ts_from_sql(row.5)?,
        input_ref: row.6,
        output_ref: row.7,
        error: row.8,
    })
}

const RUN_COLUMNS: &str =
    "run_id, session_id, user_id, status, started_at, finished_at, input_ref, output_ref, error";

fn read_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

type MessageRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    i64,
);

fn message_from_row(row: MessageRow) -> StoreResult<MessageRecord> {
    Ok(MessageRecord {
        message_id: row.0,
        run_id: row.1,
        role: role_from_sql(&row.2)?,
        author_id: row.3,
        content: row.4,
        tool_calls: serde_json::from_str(&row.5)?,
        tool_args: row.6.as_deref().map(serde_json::from_str).transpose()?,
        created_at: ts_from_sql(&row.7)?,
        seq: row.8 as u64,
    })
}

type MemoryRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
);

fn memory_from_row(row: MemoryRow) -> StoreResult<MemoryRecord> {
    Ok(MemoryRecord {
        memory_id: row.0,
        user_id: row.1,
        topics: serde_json::from_str(&row.2)?,
        text: row.3,
        source_run_id: row.4,
        created_at: ts_from_sql(&row.5)?,
        archived_at: opt_ts_from_sql(row.6)?,
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn upsert_user(&self, user: &UserRecord) -> StoreResult<()> {
        let user = user.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO users (user_id, email, display_name, role, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(user_id) DO UPDATE SET \
                     email = excluded.email, \
                     display_name = excluded.display_name, \
                     role = excluded.role",
                params![
                    user.user_id,
                    user.email,
                    user.display_name,
                    user.role,
                    ts_to_sql(user.created_at)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_user(&self, user_id: &str) -> StoreResult<Option<UserRecord>> {
        let user_id = user_id.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, email, display_name, role, created_at \
                 FROM users WHERE user_id = ?1",
            )?;
            let row = stmt
                .query_map(params![user_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .next()
                .transpose()?;

            row.map(|r| {
                Ok(UserRecord {
                    user_id: r.0,
                    email: r.1,
                    display_name: r.2,
                    role: r.3,
                    created_at: ts_from_sql(&r.4)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn insert_session(&self, session: &SessionRecord) -> StoreResult<()> {
        let session = session.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO sessions \
                 (session_id, user_id, name, created_at, updated_at, last_run_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session.session_id,
                    session.user_id,
                    session.name,
                    ts_to_sql(session.created_at),
                    ts_to_sql(session.updated_at),
                    session.last_run_id
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        let session_id = session_id.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, user_id, name, created_at, updated_at, last_run_id \
                 FROM sessions WHERE session_id = ?1",
            )?;
            let row = stmt
                .query_map(params![session_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                })?
                .next()
                .transpose()?;

            row.map(|r| {
                Ok(SessionRecord {
                    session_id: r.0,
                    user_id: r.1,
                    name: r.2,
                    created_at: ts_from_sql(&r.3)?,
                    updated_at: ts_from_sql(&r.4)?,
                    last_run_id: r.5,
                })
            })
            .transpose()
        })
        .await
    }

    async fn list_sessions(&self, user_id: &str) -> StoreResult<Vec<SessionRecord>> {
        let user_id = user_id.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, user_id, name, created_at, updated_at, last_run_id \
                 FROM sessions WHERE user_id = ?1 ORDER BY updated_at DESC",
            )?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|r| {
                    Ok(SessionRecord {
                        session_id: r.0,
                        user_id: r.1,
                        name: r.2,
                        created_at: ts_from_sql(&r.3)?,
                        updated_at: ts_from_sql(&r.4)?,
                        last_run_id: r.5,
                    })
                })
                .collect()
        })
        .await
    }

    async fn rename_session(&self, session_id: &str, name: &str) -> StoreResult<()> {
        let session_id = session_id.to_owned();
        let name = name.to_owned();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE sessions SET name = ?2, updated_at = ?3 WHERE session_id = ?1",
                params![session_id, name, ts_to_sql(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    async fn touch_session(&self, session_id: &str, last_run_id: &str) -> StoreResult<()> {
        let session_id = session_id.to_owned();
        let last_run_id = last_run_id.to_owned();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE sessions SET last_run_id = ?2, updated_at = ?3 WHERE session_id = ?1",
                params![session_id, last_run_id, ts_to_sql(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_session(&self, session_id: &str) -> StoreResult<()> {
        let session_id = session_id.to_owned();
        self.blocking(move |conn| {
            // Cascades to runs, messages, and events via foreign keys.
            conn.execute(
                "DELETE FROM sessions WHERE session_id = ?1",
                params![session_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_run(&self, run: &RunRecord) -> StoreResult<()> {
        let run = run.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO runs \
                 (run_id, session_id, user_id, status, started_at, finished_at, \
                  input_ref, output_ref, error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run.run_id,
                    run.session_id,
                    run.user_id,
                    run.status.as_str(),
                    ts_to_sql(run.started_at),
                    run.finished_at.map(ts_to_sql),
                    run.input_ref,
                    run.output_ref,
                    run.error
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<RunRecord>> {
        let run_id = run_id.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"))?;
            let row = stmt
                .query_map(params![run_id], read_run_row)?
                .next()
                .transpose()?;
            row.map(run_from_row).transpose()
        })
        .await
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
        output_ref: Option<&str>,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        let run_id = run_id.to_owned();
        let output_ref = output_ref.map(str::to_owned);
        let error = error.map(str::to_owned);
        self.blocking(move |conn| {
            // Terminal states are sticky: the predicate refuses to move a
            // run out of succeeded/failed/cancelled.
            let changed = conn.execute(
                "UPDATE runs SET \
                     status = ?2, \
                     finished_at = COALESCE(?3, finished_at), \
                     output_ref = COALESCE(?4, output_ref), \
                     error = COALESCE(?5, error) \
                 WHERE run_id = ?1 AND status IN ('pending', 'streaming')",
                params![
                    run_id,
                    status.as_str(),
                    finished_at.map(ts_to_sql),
                    output_ref,
                    error
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn set_run_input_ref(&self, run_id: &str, input_ref: &str) -> StoreResult<()> {
        let run_id = run_id.to_owned();
        let input_ref = input_ref.to_owned();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE runs SET input_ref = ?2 WHERE run_id = ?1",
                params![run_id, input_ref],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_completed_runs(
        &self,
        session_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<RunRecord>> {
        let session_id = session_id.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs \
                 WHERE session_id = ?1 AND status = 'succeeded' \
                 ORDER BY started_at DESC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![session_id, limit as i64], read_run_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(run_from_row).collect()
        })
        .await
    }

    async fn sweep_unfinished_runs(&self, error: &str) -> StoreResult<Vec<String>> {
        let error = error.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare("SELECT run_id FROM runs WHERE status IN ('pending', 'streaming')")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            if !ids.is_empty() {
                conn.execute(
                    "UPDATE runs SET status = 'failed', error = ?1, finished_at = ?2 \
                     WHERE status IN ('pending', 'streaming')",
                    params![error, ts_to_sql(Utc::now())],
                )?;
            }
            Ok(ids)
        })
        .await
    }

    async fn insert_messages(&self, messages: &[MessageRecord]) -> StoreResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let rows: Vec<(String, String, String, String, String, String, Option<String>, String, i64)> =
            messages
                .iter()
                .map(|m| {
                    Ok((
                        m.message_id.clone(),
                        m.run_id.clone(),
                        m.role.as_str().to_owned(),
                        m.author_id.clone(),
                        m.content.clone(),
                        serde_json::to_string(&m.tool_calls)?,
                        m.tool_args
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()?,
                        ts_to_sql(m.created_at),
                        m.seq as i64,
                    ))
                })
                .collect::<StoreResult<Vec<_>>>()?;

        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO messages \
                     (message_id, run_id, role, author_id, content, tool_calls, \
                      tool_args, created_at, seq) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for row in &rows {
                    stmt.execute(params![
                        row.0, row.1, row.2, row.3, row.4, row.5, row.6, row.7, row.8
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_message(&self, message_id: &str) -> StoreResult<Option<MessageRecord>> {
        let message_id = message_id.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, run_id, role, author_id, content, tool_calls, \
                        tool_args, created_at, seq \
                 FROM messages WHERE message_id = ?1",
            )?;
            let row = stmt
                .query_map(params![message_id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                    ))
                })?
                .next()
                .transpose()?;
            row.map(message_from_row).transpose()
        })
        .await
    }

    async fn list_messages(&self, run_id: &str) -> StoreResult<Vec<MessageRecord>> {
        let run_id = run_id.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, run_id, role, author_id, content, tool_calls, \
                        tool_args, created_at, seq \
                 FROM messages WHERE run_id = ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt
                .query_map(params![run_id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(message_from_row).collect()
        })
        .await
    }

    async fn insert_events(&self, events: &[EventRecord]) -> StoreResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let rows: Vec<(String, String, String, String, String, String, i64, i64)> = events
            .iter()
            .map(|e| {
                Ok((
                    e.event_id.clone(),
                    e.run_id.clone(),
                    e.producer_id.clone(),
                    e.kind.clone(),
                    serde_json::to_string(&e.payload)?,
                    ts_to_sql(e.ts),
                    e.seq as i64,
                    e.run_seq as i64,
                ))
            })
            .collect::<StoreResult<Vec<_>>>()?;

        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO events \
                     (event_id, run_id, producer_id, kind, payload, ts, seq, run_seq) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for row in &rows {
                    stmt.execute(params![
                        row.0, row.1, row.2, row.3, row.4, row.5, row.6, row.7
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_events(&self, run_id: &str) -> StoreResult<Vec<EventRecord>> {
        let run_id = run_id.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, run_id, producer_id, kind, payload, ts, seq, run_seq \
                 FROM events WHERE run_id = ?1 ORDER BY run_seq ASC",
            )?;
            let rows = stmt
                .query_map(params![run_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|r| {
                    Ok(EventRecord {
                        event_id: r.0,
                        run_id: r.1,
                        producer_id: r.2,
                        kind: r.3,
                        payload: serde_json::from_str(&r.4)?,
                        ts: ts_from_sql(&r.5)?,
                        seq: r.6 as u64,
                        run_seq: r.7 as u64,
                    })
                })
                .collect()
        })
        .await
    }

    async fn insert_memory(&self, memory: &MemoryRecord) -> StoreResult<()> {
        let topics = serde_json::to_string(&memory.topics)?;
        let memory = memory.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO memories \
                 (memory_id, user_id, topics, text, source_run_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    memory.memory_id,
                    memory.user_id,
                    topics,
                    memory.text,
                    memory.source_run_id,
                    ts_to_sql(memory.created_at)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_memories(
        &self,
        user_id: &str,
        include_archived: bool,
    ) -> StoreResult<Vec<MemoryRecord>> {
        let user_id = user_id.to_owned();
        self.blocking(move |conn| {
            let sql = if include_archived {
                "SELECT memory_id, user_id, topics, text, source_run_id, created_at, NULL \
                 FROM memories WHERE user_id = ?1 \
                 UNION ALL \
                 SELECT memory_id, user_id, topics, text, source_run_id, created_at, archived_at \
                 FROM memories_archive WHERE user_id = ?1 \
                 ORDER BY created_at ASC"
            } else {
                "SELECT memory_id, user_id, topics, text, source_run_id, created_at, NULL \
                 FROM memories WHERE user_id = ?1 ORDER BY created_at ASC"
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(memory_from_row).collect()
        })
        .await
    }

    async fn archive_memories(&self, memory_ids: &[String], at: DateTime<Utc>) -> StoreResult<()> {
        if memory_ids.is_empty() {
            return Ok(());
        }
        let ids = memory_ids.to_vec();
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut copy = tx.prepare(
                    "INSERT OR IGNORE INTO memories_archive \
                     (memory_id, user_id, topics, text, source_run_id, created_at, archived_at) \
                     SELECT memory_id, user_id, topics, text, source_run_id, created_at, ?2 \
                     FROM memories WHERE memory_id = ?1",
                )?;
                let mut remove = tx.prepare("DELETE FROM memories WHERE memory_id = ?1")?;
                for id in &ids {
                    copy.execute(params![id, ts_to_sql(at)])?;
                    remove.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn insert_document(&self, document: &DocumentRecord) -> StoreResult<()> {
        let document = document.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO knowledge_documents (doc_id, user_id, name, mime, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    document.doc_id,
                    document.user_id,
                    document.name,
                    document.mime,
                    ts_to_sql(document.created_at)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_documents(&self, user_id: &str) -> StoreResult<Vec<DocumentRecord>> {
        let user_id = user_id.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT doc_id, user_id, name, mime, created_at \
                 FROM knowledge_documents WHERE user_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|r| {
                    Ok(DocumentRecord {
                        doc_id: r.0,
                        user_id: r.1,
                        name: r.2,
                        mime: r.3,
                        created_at: ts_from_sql(&r.4)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn insert_chunks(&self, chunks: &[ChunkRecord]) -> StoreResult<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let chunks = chunks.to_vec();
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO knowledge_chunks \
                     (chunk_id, doc_id, user_id, ordinal, text, source_offset) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for chunk in &chunks {
                    stmt.execute(params![
                        chunk.chunk_id,
                        chunk.doc_id,
                        chunk.user_id,
                        chunk.ordinal as i64,
                        chunk.text,
                        chunk.source_offset as i64
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_chunks(
        &self,
        user_id: &str,
        doc_id: Option<&str>,
    ) -> StoreResult<Vec<ChunkRecord>> {
        let user_id = user_id.to_owned();
        let doc_id = doc_id.map(str::to_owned);
        self.blocking(move |conn| {
            let mut query_chunks = |stmt: &mut rusqlite::Statement<'_>,
                                    params: &[&dyn rusqlite::ToSql]|
             -> StoreResult<Vec<ChunkRecord>> {
                let rows = stmt
                    .query_map(params, |row| {
                        Ok(ChunkRecord {
                            chunk_id: row.get(0)?,
                            doc_id: row.get(1)?,
                            user_id: row.get(2)?,
                            ordinal: row.get::<_, i64>(3)? as u64,
                            text: row.get(4)?,
                            source_offset: row.get::<_, i64>(5)? as u64,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            };

            if let Some(doc_id) = doc_id {
                let mut stmt = conn.prepare(
                    "SELECT chunk_id, doc_id, user_id, ordinal, text, source_offset \
                     FROM knowledge_chunks WHERE user_id = ?1 AND doc_id = ?2 \
                     ORDER BY doc_id, ordinal",
                )?;
                query_chunks(&mut stmt, &[&user_id, &doc_id])
            } else {
                let mut stmt = conn.prepare(
                    "SELECT chunk_id, doc_id, user_id, ordinal, text, source_offset \
                     FROM knowledge_chunks WHERE user_id = ?1 \
                     ORDER BY doc_id, ordinal",
                )?;
                query_chunks(&mut stmt, &[&user_id])
            }
        })
        .await
    }

    async fn get_chunks(&self, chunk_ids: &[String]) -> StoreResult<Vec<ChunkRecord>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = chunk_ids.to_vec();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT chunk_id, doc_id, user_id, ordinal, text, source_offset \
                 FROM knowledge_chunks WHERE chunk_id = ?1",
            )?;
            let mut out = Vec::with_capacity(ids.len());
            for id in &ids {
                let row = stmt
                    .query_map(params![id], |row| {
                        Ok(ChunkRecord {
                            chunk_id: row.get(0)?,
                            doc_id: row.get(1)?,
                            user_id: row.get(2)?,
                            ordinal: row.get::<_, i64>(3)? as u64,
                            text: row.get(4)?,
                            source_offset: row.get::<_, i64>(5)? as u64,
                        })
                    })?
                    .next()
                    .transpose()?;
                if let Some(chunk) = row {
                    out.push(chunk);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn delete_document(&self, user_id: &str, doc_id: &str) -> StoreResult<()> {
        let user_id = user_id.to_owned();
        let doc_id = doc_id.to_owned();
        self.blocking(move |conn| {
            // Chunks cascade via the foreign key.
            conn.execute(
                "DELETE FROM knowledge_documents WHERE doc_id = ?1 AND user_id = ?2",
                params![doc_id, user_id],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SqliteRecordStore {
        SqliteRecordStore::in_memory().expect("open in-memory store")
    }

    fn session(id: &str, user: &str) -> SessionRecord {
        SessionRecord {
            session_id: id.into(),
            user_id: user.into(),
            name: "test".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_run_id: None,
        }
    }

    fn run(id: &str, session_id: &str, user: &str) -> RunRecord {
        RunRecord {
            run_id: id.into(),
            session_id: session_id.into(),
            user_id: user.into(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            input_ref: None,
            output_ref: None,
            error: None,
        }
    }

    async fn seed_run(store: &SqliteRecordStore, run_id: &str) {
        store
            .insert_session(&session("s1", "u1"))
            .await
            .expect("session");
        store.insert_run(&run(run_id, "s1", "u1")).await.expect("run");
    }

    #[tokio::test]
    async fn run_status_transition_is_terminal_sticky() {
        let store = store();
        seed_run(&store, "r1").await;

        assert!(
            store
                .update_run_status("r1", RunStatus::Streaming, None, None, None)
                .await
                .expect("update")
        );
        assert!(
            store
                .update_run_status("r1", RunStatus::Succeeded, Some(Utc::now()), Some("m9"), None)
                .await
                .expect("update")
        );

        // Terminal: further transitions are refused.
        assert!(
            !store
                .update_run_status("r1", RunStatus::Failed, Some(Utc::now()), None, Some("late"))
                .await
                .expect("update")
        );

        let row = store.get_run("r1").await.expect("get").expect("exists");
        assert_eq!(row.status, RunStatus::Succeeded);
        assert_eq!(row.output_ref.as_deref(), Some("m9"));
        assert!(row.error.is_none());
    }

    #[tokio::test]
    async fn event_insert_is_idempotent_by_producer_seq() {
        let store = store();
        seed_run(&store, "r1").await;

        let event = EventRecord {
            event_id: "e1".into(),
            run_id: "r1".into(),
            producer_id: "team".into(),
            kind: "content_delta".into(),
            payload: json!({"text": "hi"}),
            ts: Utc::now(),
            seq: 1,
            run_seq: 1,
        };
        store
            .insert_events(std::slice::from_ref(&event))
            .await
            .expect("insert");
        // Replay of the same batch is a no-op.
        store
            .insert_events(std::slice::from_ref(&event))
            .await
            .expect("insert again");

        let events = store.list_events("r1").await.expect("list");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["text"], "hi");
    }

    #[tokio::test]
    async fn message_insert_is_idempotent_by_id() {
        let store = store();
        seed_run(&store, "r1").await;

        let message = MessageRecord {
            message_id: "m1".into(),
            run_id: "r1".into(),
            role: MessageRole::User,
            author_id: "user".into(),
            content: "hello".into(),
            tool_calls: Vec::new(),
            tool_args: None,
            created_at: Utc::now(),
            seq: 1,
        };
        store
            .insert_messages(std::slice::from_ref(&message))
            .await
            .expect("insert");
        store
            .insert_messages(std::slice::from_ref(&message))
            .await
            .expect("insert again");

        assert_eq!(store.list_messages("r1").await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn delete_session_cascades_to_runs_messages_events() {
        let store = store();
        seed_run(&store, "r1").await;
        store
            .insert_messages(&[MessageRecord {
                message_id: "m1".into(),
                run_id: "r1".into(),
                role: MessageRole::Agent,
                author_id: "team".into(),
                content: "bye".into(),
                tool_calls: Vec::new(),
                tool_args: None,
                created_at: Utc::now(),
                seq: 1,
            }])
            .await
            .expect("messages");

        store.delete_session("s1").await.expect("delete");

        assert!(store.get_run("r1").await.expect("get").is_none());
        assert!(store.list_messages("r1").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn sweep_marks_unfinished_runs_failed() {
        let store = store();
        seed_run(&store, "r1").await;
        store.insert_run(&run("r2", "s1", "u1")).await.expect("run");
        store
            .update_run_status("r2", RunStatus::Succeeded, Some(Utc::now()), None, None)
            .await
            .expect("update");

        let swept = store
            .sweep_unfinished_runs("crashed before completion")
            .await
            .expect("sweep");
        assert_eq!(swept, vec!["r1".to_owned()]);

        let row = store.get_run("r1").await.expect("get").expect("exists");
        assert_eq!(row.status, RunStatus::Failed);
        assert_eq!(row.error.as_deref(), Some("crashed before completion"));
    }

    #[tokio::test]
    async fn archive_moves_memories_out_of_retrieval_but_retains_them() {
        let store = store();
        let memory = MemoryRecord {
            memory_id: "mem1".into(),
            user_id: "u1".into(),
            topics: vec!["family".into()],
            text: "Has two kids".into(),
            source_run_id: None,
            created_at: Utc::now(),
            archived_at: None,
        };
        store.insert_memory(&memory).await.expect("insert");

        store
            .archive_memories(&["mem1".to_owned()], Utc::now())
            .await
            .expect("archive");

        assert!(store.list_memories("u1", false).await.expect("list").is_empty());

        let all = store.list_memories("u1", true).await.expect("list");
        assert_eq!(all.len(), 1);
        assert!(all[0].archived_at.is_some());
        assert_eq!(all[0].text, "Has two kids");
    }

    #[tokio::test]
    async fn memories_are_listed_per_user_only() {
        let store = store();
        for (id, user) in [("a1", "user-a"), ("b1", "user-b")] {
            store
                .insert_memory(&MemoryRecord {
                    memory_id: id.into(),
                    user_id: user.into(),
                    topics: vec!["family".into()],
                    text: format!("memory of {user}"),
                    source_run_id: None,
                    created_at: Utc::now(),
                    archived_at: None,
                })
                .await
                .expect("insert");
        }

        let a = store.list_memories("user-a", true).await.expect("list");
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].user_id, "user-a");
    }

    #[tokio::test]
    async fn chunks_roundtrip_and_cascade_on_document_delete() {
        let store = store();
        store
            .insert_document(&DocumentRecord {
                doc_id: "d1".into(),
                user_id: "u1".into(),
                name: "notes.txt".into(),
                mime: "text/plain".into(),
                created_at: Utc::now(),
            })
            .await
            .expect("document");
        store
            .insert_chunks(&[
                ChunkRecord {
                    chunk_id: "c1".into(),
                    doc_id: "d1".into(),
                    user_id: "u1".into(),
                    ordinal: 0,
                    text: "first".into(),
                    source_offset: 0,
                },
                ChunkRecord {
                    chunk_id: "c2".into(),
                    doc_id: "d1".into(),
                    user_id: "u1".into(),
                    ordinal: 1,
                    text: "second".into(),
                    source_offset: 5,
                },
            ])
            .await
            .expect("chunks");

        let listed = store.list_chunks("u1", Some("d1")).await.expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].ordinal, 0);

        let fetched = store
            .get_chunks(&["c2".to_owned(), "c1".to_owned()])
            .await
            .expect("get");
        assert_eq!(fetched[0].chunk_id, "c2");

        store.delete_document("u1", "d1").await.expect("delete");
        assert!(store.list_chunks("u1", None).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn completed_run_history_is_limited_and_ordered() {
        let store = store();
        store
            .insert_session(&session("s1", "u1"))
            .await
            .expect("session");
        for i in 0..4i64 {
            let mut r = run(&format!("r{i}"), "s1", "u1");
            r.started_at = Utc::now() + chrono::Duration::seconds(i);
            store.insert_run(&r).await.expect("run");
            store
                .update_run_status(&format!("r{i}"), RunStatus::Succeeded, Some(Utc::now()), None, None)
                .await
                .expect("update");
        }

        let recent = store.list_completed_runs("s1", 2).await.expect("list");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].run_id, "r3");
        assert_eq!(recent[1].run_id, "r2");
    }
}
