//! Built-in tool: topic-filtered memory retrieval.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Tool, ToolContext, ToolError};
use crate::memory::MemorySubsystem;

/// Arguments for [`MemorySearchTool`].
#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemorySearchArgs {
    /// Free-text query describing what to recall.
    pub query: String,
    /// Restrict results to memories carrying at least one of these topics.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Maximum number of memories to return.
    #[serde(default = "default_limit")]
    pub limit: usize,
}

const fn default_limit() -> usize {
    5
}

/// One recalled memory.
#[derive(Debug, Serialize)]
pub struct RecalledMemory {
    /// The remembered fact.
    pub text: String,
    /// Its topic tags.
    pub topics: Vec<String>,
    /// Blended relevance score.
    pub score: f32,
}

/// Searches the calling user's memories.
///
/// Retrieval is best-effort: a store or embedding failure yields an empty
/// result with a note, never a hard error — the agent loop should keep
/// going without recall rather than fail the run.
pub struct MemorySearchTool {
    memory: Arc<MemorySubsystem>,
}

impl std::fmt::Debug for MemorySearchTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySearchTool").finish_non_exhaustive()
    }
}

impl MemorySearchTool {
    /// Creates the tool over a memory subsystem.
    #[must_use]
    pub fn new(memory: Arc<MemorySubsystem>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    const NAME: &'static str = "memory_search";
    type Args = MemorySearchArgs;
    type Output = Vec<RecalledMemory>;

    fn description(&self) -> String {
        "Search the user's long-term memories. Optionally filter by topics \
         (e.g. family, work, preferences)."
            .to_owned()
    }

    fn idempotent(&self) -> bool {
        true
    }

    async fn call(&self, ctx: &ToolContext, args: Self::Args) -> Result<Self::Output, ToolError> {
        match self
            .memory
            .search(&ctx.user_id, &args.topics, &args.query, args.limit.clamp(1, 50))
            .await
        {
            Ok(hits) => Ok(hits
                .into_iter()
                .map(|hit| RecalledMemory {
                    text: hit.memory.text,
                    topics: hit.memory.topics,
                    score: hit.score,
                })
                .collect()),
            Err(crate::error::RuntimeError::PermissionDenied(message)) => {
                Err(ToolError::permission_denied(message))
            }
            Err(e) => {
                tracing::warn!(error = %e, "memory search degraded to empty result");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelToken;
    use crate::embedding::HashEmbedder;
    use crate::llm::mock::{MockBackend, MockTurn};
    use crate::memory::MemoryConfig;
    use crate::store::{InMemoryVectorStore, SqliteRecordStore};
    use crate::tool::DynTool;

    fn memory_with_fact() -> Arc<MemorySubsystem> {
        Arc::new(MemorySubsystem::new(
            Arc::new(SqliteRecordStore::in_memory().expect("store")),
            Arc::new(InMemoryVectorStore::new(64)),
            Arc::new(HashEmbedder::new(64)),
            Arc::new(MockBackend::new().otherwise(MockTurn::text(
                r#"[{"topics": ["family"], "text": "Has a sister in Lisbon"}]"#,
            ))),
            MemoryConfig::default(),
        ))
    }

    #[tokio::test]
    async fn recalls_only_the_calling_users_memories() {
        let memory = memory_with_fact();
        memory.create("user-a", None, "t").await.expect("create");
        let tool = MemorySearchTool::new(memory);

        let ctx_a = ToolContext::new("user-a", "run-1", CancelToken::new());
        let hits = tool
            .call(
                &ctx_a,
                MemorySearchArgs {
                    query: "sister".into(),
                    topics: vec!["family".into()],
                    limit: 5,
                },
            )
            .await
            .expect("call");
        assert_eq!(hits.len(), 1);

        let ctx_b = ToolContext::new("user-b", "run-2", CancelToken::new());
        let empty = tool
            .call(
                &ctx_b,
                MemorySearchArgs {
                    query: "sister".into(),
                    topics: vec!["family".into()],
                    limit: 5,
                },
            )
            .await
            .expect("call");
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn schema_includes_all_fields() {
        let tool = MemorySearchTool::new(memory_with_fact());
        let def = DynTool::definition(&tool);
        assert_eq!(def.name, "memory_search");
        let props = &def.parameters["properties"];
        assert!(props["query"].is_object());
        assert!(props["topics"].is_object());
        assert!(props["limit"].is_object());
    }
}
