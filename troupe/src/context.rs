//! Per-run context threading.
//!
//! There is no process-wide mutable state in the runtime. Everything an
//! executing agent needs — caller identity, the event channel, the message
//! buffer, the cancellation signal, pinned configuration — travels in a
//! [`RunContext`] cloned down the delegation tree.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Utc;
use serde_json::Value;

use crate::bus::EventBus;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::model::{MessageRecord, MessageRole, fresh_id};

/// Cooperative cancellation signal.
///
/// Checked at every suspension point (LLM calls, tool invocations, member
/// joins). Cancellation never interrupts compute mid-flight; the
/// coordinator enforces a hard grace deadline separately.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: tokio::sync::Notify,
}

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation to every holder.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check after registering, so a cancel between the first
            // check and registration is not missed.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Buffer of archival [`MessageRecord`]s accumulated during a run.
///
/// Pushes are cheap and synchronous; the coordinator drains and flushes in
/// batches with at-least-once semantics.
#[derive(Debug, Clone)]
pub struct MessageSink {
    inner: Arc<SinkInner>,
}

#[derive(Debug)]
struct SinkInner {
    run_id: String,
    seq: AtomicU64,
    buffer: std::sync::Mutex<Vec<MessageRecord>>,
}

impl MessageSink {
    /// Creates an empty sink for `run_id`.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                run_id: run_id.into(),
                seq: AtomicU64::new(0),
                buffer: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Appends a message and returns its generated id.
    pub fn push(
        &self,
        role: MessageRole,
        author_id: impl Into<String>,
        content: impl Into<String>,
        tool_calls: Vec<Value>,
        tool_args: Option<Value>,
    ) -> String {
        let message_id = fresh_id();
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = MessageRecord {
            message_id: message_id.clone(),
            run_id: self.inner.run_id.clone(),
            role,
            author_id: author_id.into(),
            content: content.into(),
            tool_calls,
            tool_args,
            created_at: Utc::now(),
            seq,
        };

        if let Ok(mut buffer) = self.inner.buffer.lock() {
            buffer.push(record);
        }
        message_id
    }

    /// Appends a user input message.
    pub fn push_user(&self, content: impl Into<String>) -> String {
        self.push(MessageRole::User, "user", content, Vec::new(), None)
    }

    /// Appends an agent output message.
    pub fn push_agent(&self, author_id: impl Into<String>, content: impl Into<String>) -> String {
        self.push(MessageRole::Agent, author_id, content, Vec::new(), None)
    }

    /// Appends a delegation directive.
    pub fn push_delegation(
        &self,
        author_id: impl Into<String>,
        content: impl Into<String>,
        args: Value,
    ) -> String {
        self.push(
            MessageRole::Delegation,
            author_id,
            content,
            Vec::new(),
            Some(args),
        )
    }

    /// Appends a tool output message.
    pub fn push_tool(
        &self,
        author_id: impl Into<String>,
        content: impl Into<String>,
        args: Option<Value>,
    ) -> String {
        self.push(MessageRole::Tool, author_id, content, Vec::new(), args)
    }

    /// Takes everything buffered so far.
    #[must_use]
    pub fn drain(&self) -> Vec<MessageRecord> {
        self.inner
            .buffer
            .lock()
            .map(|mut buffer| std::mem::take(&mut *buffer))
            .unwrap_or_default()
    }

    /// Number of buffered, not-yet-drained messages.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }
}

/// Everything an executing agent needs, threaded explicitly.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The run being executed.
    pub run_id: String,
    /// Owning session.
    pub session_id: String,
    /// Caller identity; scopes every store access.
    pub user_id: String,
    /// Event channel for this run.
    pub bus: EventBus,
    /// Cooperative cancellation signal.
    pub cancel: CancelToken,
    /// Archival message buffer.
    pub messages: MessageSink,
    /// Configuration snapshot pinned at run start.
    pub config: Arc<RuntimeConfig>,
}

impl RunContext {
    /// Errors with [`RuntimeError::Cancelled`] once cancellation is signalled.
    ///
    /// Call before every suspension point.
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(RuntimeError::Cancelled)
        } else {
            Ok(())
        }
    }
}
