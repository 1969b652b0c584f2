//! Session management.
//!
//! A session groups runs under one stable identity and supplies the
//! rolling history used for context assembly. Every mutating operation is
//! ownership-checked: a session id presented by the wrong user yields
//! `permission_denied`, never silent access.

use std::sync::Arc;

use chrono::Utc;

use crate::error::{Result, RuntimeError};
use crate::model::{SessionRecord, fresh_id};
use crate::store::RecordStore;

/// One completed request/response pair, as included in rolling history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// The user's input.
    pub user_input: String,
    /// The final output.
    pub final_output: String,
}

/// Creates, resolves, and mutates sessions.
pub struct SessionManager {
    records: Arc<dyn RecordStore>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates the manager over a record store.
    #[must_use]
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    /// Resolves an existing session or creates a new one.
    ///
    /// A provided id must exist and belong to `user_id`. When omitted, a
    /// new session is created, named from the first input.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        first_input: &str,
    ) -> Result<SessionRecord> {
        if let Some(session_id) = session_id {
            let session = self
                .records
                .get_session(session_id)
                .await?
                .ok_or_else(|| RuntimeError::NotFound(format!("session '{session_id}'")))?;
            if session.user_id != user_id {
                return Err(RuntimeError::PermissionDenied(format!(
                    "session '{session_id}' belongs to another user"
                )));
            }
            return Ok(session);
        }

        let now = Utc::now();
        let session = SessionRecord {
            session_id: fresh_id(),
            user_id: user_id.to_owned(),
            name: default_name(first_input),
            created_at: now,
            updated_at: now,
            last_run_id: None,
        };
        self.records.insert_session(&session).await?;
        Ok(session)
    }

    /// Returns the last `n` completed exchanges, oldest first.
    pub async fn history(&self, session_id: &str, n: usize) -> Result<Vec<Exchange>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut runs = self.records.list_completed_runs(session_id, n).await?;
        runs.reverse();

        let mut exchanges = Vec::with_capacity(runs.len());
        for run in runs {
            let (Some(input_ref), Some(output_ref)) = (&run.input_ref, &run.output_ref) else {
                continue;
            };
            let Some(input) = self.records.get_message(input_ref).await? else {
                continue;
            };
            let Some(output) = self.records.get_message(output_ref).await? else {
                continue;
            };
            exchanges.push(Exchange {
                user_input: input.content,
                final_output: output.content,
            });
        }
        Ok(exchanges)
    }

    /// Renames a session owned by `user_id`.
    pub async fn rename(&self, user_id: &str, session_id: &str, name: &str) -> Result<()> {
        self.owned(user_id, session_id).await?;
        self.records.rename_session(session_id, name).await?;
        Ok(())
    }

    /// Deletes a session owned by `user_id`, cascading to its runs.
    pub async fn delete(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.owned(user_id, session_id).await?;
        self.records.delete_session(session_id).await?;
        Ok(())
    }

    /// Lists the user's sessions, most recently updated first.
    pub async fn list(&self, user_id: &str) -> Result<Vec<SessionRecord>> {
        Ok(self.records.list_sessions(user_id).await?)
    }

    async fn owned(&self, user_id: &str, session_id: &str) -> Result<SessionRecord> {
        let session = self
            .records
            .get_session(session_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("session '{session_id}'")))?;
        if session.user_id != user_id {
            return Err(RuntimeError::PermissionDenied(format!(
                "session '{session_id}' belongs to another user"
            )));
        }
        Ok(session)
    }
}

fn default_name(first_input: &str) -> String {
    const MAX: usize = 48;
    let trimmed = first_input.trim();
    if trimmed.is_empty() {
        return "New session".to_owned();
    }
    let mut name: String = trimmed.chars().take(MAX).collect();
    if trimmed.chars().count() > MAX {
        name.push('…');
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageRecord, MessageRole, RunRecord, RunStatus};
    use crate::store::SqliteRecordStore;

    fn manager() -> (SessionManager, Arc<SqliteRecordStore>) {
        let store = Arc::new(SqliteRecordStore::in_memory().expect("store"));
        (SessionManager::new(store.clone()), store)
    }

    #[tokio::test]
    async fn creates_session_named_from_first_input() {
        let (manager, _) = manager();
        let session = manager
            .get_or_create("u1", None, "What is the weather in Tokyo today?")
            .await
            .expect("create");
        assert_eq!(session.user_id, "u1");
        assert!(session.name.starts_with("What is the weather"));
    }

    #[tokio::test]
    async fn resolves_owned_session_and_rejects_foreign() {
        let (manager, _) = manager();
        let session = manager.get_or_create("u1", None, "hi").await.expect("create");

        let resolved = manager
            .get_or_create("u1", Some(&session.session_id), "ignored")
            .await
            .expect("resolve");
        assert_eq!(resolved.session_id, session.session_id);

        let err = manager
            .get_or_create("u2", Some(&session.session_id), "ignored")
            .await
            .expect_err("must reject");
        assert!(matches!(err, RuntimeError::PermissionDenied(_)));

        let missing = manager
            .get_or_create("u1", Some("no-such-session"), "ignored")
            .await
            .expect_err("must reject");
        assert!(matches!(missing, RuntimeError::NotFound(_)));
    }

    #[tokio::test]
    async fn rename_and_delete_are_owner_scoped() {
        let (manager, _) = manager();
        let session = manager.get_or_create("u1", None, "hi").await.expect("create");

        assert!(matches!(
            manager.rename("u2", &session.session_id, "stolen").await,
            Err(RuntimeError::PermissionDenied(_))
        ));
        manager
            .rename("u1", &session.session_id, "renamed")
            .await
            .expect("rename");

        manager.delete("u1", &session.session_id).await.expect("delete");
        assert!(manager.list("u1").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn history_returns_completed_exchanges_oldest_first() {
        let (manager, store) = manager();
        let session = manager.get_or_create("u1", None, "hi").await.expect("create");

        for i in 0..3i64 {
            let run_id = format!("r{i}");
            let input_id = format!("in{i}");
            let output_id = format!("out{i}");
            store
                .insert_run(&RunRecord {
                    run_id: run_id.clone(),
                    session_id: session.session_id.clone(),
                    user_id: "u1".into(),
                    status: RunStatus::Pending,
                    started_at: Utc::now() + chrono::Duration::seconds(i),
                    finished_at: None,
                    input_ref: None,
                    output_ref: None,
                    error: None,
                })
                .await
                .expect("run");
            store
                .insert_messages(&[
                    MessageRecord {
                        message_id: input_id.clone(),
                        run_id: run_id.clone(),
                        role: MessageRole::User,
                        author_id: "user".into(),
                        content: format!("question {i}"),
                        tool_calls: Vec::new(),
                        tool_args: None,
                        created_at: Utc::now(),
                        seq: 1,
                    },
                    MessageRecord {
                        message_id: output_id.clone(),
                        run_id: run_id.clone(),
                        role: MessageRole::Agent,
                        author_id: "team".into(),
                        content: format!("answer {i}"),
                        tool_calls: Vec::new(),
                        tool_args: None,
                        created_at: Utc::now(),
                        seq: 2,
                    },
                ])
                .await
                .expect("messages");
            store
                .set_run_input_ref(&run_id, &input_id)
                .await
                .expect("input ref");
            store
                .update_run_status(&run_id, RunStatus::Succeeded, Some(Utc::now()), Some(&output_id), None)
                .await
                .expect("status");
        }

        let history = manager.history(&session.session_id, 2).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].user_input, "question 1");
        assert_eq!(history[1].final_output, "answer 2");
    }
}
