//! Built-in tool: hybrid knowledge-base retrieval.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Tool, ToolContext, ToolError};
use crate::knowledge::KnowledgeSubsystem;

/// Arguments for [`KnowledgeSearchTool`].
#[derive(Debug, Deserialize, JsonSchema)]
pub struct KnowledgeSearchArgs {
    /// Free-text query to match against the user's documents.
    pub query: String,
    /// Maximum number of chunks to return.
    #[serde(default = "default_limit")]
    pub limit: usize,
}

const fn default_limit() -> usize {
    5
}

/// One retrieved chunk.
#[derive(Debug, Serialize)]
pub struct RetrievedChunk {
    /// Chunk text.
    pub text: String,
    /// Owning document.
    pub doc_id: String,
    /// Byte offset of the chunk in its document.
    pub source_offset: u64,
    /// Blended relevance score.
    pub score: f32,
}

/// Searches the calling user's knowledge base.
pub struct KnowledgeSearchTool {
    knowledge: Arc<KnowledgeSubsystem>,
}

impl std::fmt::Debug for KnowledgeSearchTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeSearchTool").finish_non_exhaustive()
    }
}

impl KnowledgeSearchTool {
    /// Creates the tool over a knowledge subsystem.
    #[must_use]
    pub fn new(knowledge: Arc<KnowledgeSubsystem>) -> Self {
        Self { knowledge }
    }
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    const NAME: &'static str = "knowledge_search";
    type Args = KnowledgeSearchArgs;
    type Output = Vec<RetrievedChunk>;

    fn description(&self) -> String {
        "Search the user's uploaded documents for passages relevant to a query.".to_owned()
    }

    fn idempotent(&self) -> bool {
        true
    }

    async fn call(&self, ctx: &ToolContext, args: Self::Args) -> Result<Self::Output, ToolError> {
        let hits = self
            .knowledge
            .search(&ctx.user_id, &args.query, args.limit.clamp(1, 50))
            .await
            .map_err(|e| match e {
                crate::error::RuntimeError::PermissionDenied(message) => {
                    ToolError::permission_denied(message)
                }
                other => ToolError::upstream(other.to_string()),
            })?;

        Ok(hits
            .into_iter()
            .map(|hit| RetrievedChunk {
                text: hit.chunk.text,
                doc_id: hit.chunk.doc_id,
                source_offset: hit.chunk.source_offset,
                score: hit.score,
            })
            .collect())
    }
}
