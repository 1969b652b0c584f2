//! Runtime assembly.
//!
//! [`Runtime`] wires the stores, subsystems, registries, and coordinator
//! into one facade: resolve a session, pin a spec, start a run, stream its
//! events. Construction goes through [`RuntimeBuilder`]; everything not
//! supplied falls back to the bundled implementation (SQLite records,
//! in-process vectors, hash embedder).

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::embedding::{Embedder, HashEmbedder};
use crate::error::{Result, RuntimeError};
use crate::knowledge::{KnowledgeConfig, KnowledgeSubsystem};
use crate::llm::LlmBackend;
use crate::memory::{MemoryConfig, MemorySubsystem};
use crate::run::{RunCoordinator, RunHandle};
use crate::session::SessionManager;
use crate::spec::{AgentSpec, SpecRegistry, TeamSpec, ToolRegistry};
use crate::store::{InMemoryVectorStore, RecordStore, SqliteRecordStore, VectorStore};
use crate::tool::knowledge_search::KnowledgeSearchTool;
use crate::tool::memory_search::MemorySearchTool;

/// The assembled runtime.
pub struct Runtime {
    records: Arc<dyn RecordStore>,
    sessions: Arc<SessionManager>,
    memory: Option<Arc<MemorySubsystem>>,
    knowledge: Arc<KnowledgeSubsystem>,
    specs: SpecRegistry,
    coordinator: RunCoordinator,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("specs", &self.specs.ids())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Starts building a runtime.
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Resolves the session (creating one when omitted), pins the spec,
    /// and starts a run.
    pub async fn run(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        input: &str,
        spec_id: &str,
    ) -> Result<RunHandle> {
        let spec = self
            .specs
            .get(spec_id)
            .ok_or_else(|| RuntimeError::NotFound(format!("spec '{spec_id}'")))?;
        let session = self
            .sessions
            .get_or_create(user_id, session_id, input)
            .await?;
        self.coordinator
            .start(user_id, &session.session_id, input, spec)
            .await
    }

    /// Session operations.
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// The memory subsystem, when enabled.
    #[must_use]
    pub fn memory(&self) -> Option<&Arc<MemorySubsystem>> {
        self.memory.as_ref()
    }

    /// The knowledge subsystem.
    #[must_use]
    pub fn knowledge(&self) -> &Arc<KnowledgeSubsystem> {
        &self.knowledge
    }

    /// Direct record-store access (tests, admin surfaces).
    #[must_use]
    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    /// Returns the persisted final output of a run, if any.
    pub async fn final_output(&self, run_id: &str) -> Result<Option<String>> {
        let Some(run) = self.records.get_run(run_id).await? else {
            return Ok(None);
        };
        let Some(output_ref) = run.output_ref else {
            return Ok(None);
        };
        Ok(self
            .records
            .get_message(&output_ref)
            .await?
            .map(|m| m.content))
    }

    /// Reassembles the final content from the persisted event stream.
    ///
    /// Assembly rule: the root producer's `content_delta`s concatenated in
    /// `run_seq` order; when the root emitted none (a `respond_directly`
    /// run), the member producers' deltas are used instead.
    pub async fn replay_output(&self, run_id: &str) -> Result<String> {
        let events = self.records.list_events(run_id).await?;
        let root = events
            .iter()
            .find(|e| {
                matches!(
                    e.kind.as_str(),
                    "run_completed" | "run_failed" | "run_cancelled"
                )
            })
            .map(|e| e.producer_id.clone())
            .ok_or_else(|| RuntimeError::NotFound(format!("no terminal event for run '{run_id}'")))?;

        let deltas = |from_root: bool| -> String {
            events
                .iter()
                .filter(|e| e.kind == "content_delta" && (e.producer_id == root) == from_root)
                .filter_map(|e| e.payload.get("text").and_then(serde_json::Value::as_str))
                .collect()
        };

        let own = deltas(true);
        if own.is_empty() { Ok(deltas(false)) } else { Ok(own) }
    }
}

/// Builds a [`Runtime`], supplying bundled defaults for anything omitted.
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    backend: Option<Arc<dyn LlmBackend>>,
    embedder: Option<Arc<dyn Embedder>>,
    records: Option<Arc<dyn RecordStore>>,
    vectors: Option<Arc<dyn VectorStore>>,
    agents: Vec<AgentSpec>,
    teams: Vec<TeamSpec>,
    tools: ToolRegistry,
    disable_memory: bool,
}

impl std::fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("agents", &self.agents.len())
            .field("teams", &self.teams.len())
            .finish_non_exhaustive()
    }
}

impl RuntimeBuilder {
    /// Overrides the configuration snapshot.
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the LLM backend (required).
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn LlmBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Sets the embedder; defaults to the deterministic hash embedder.
    #[must_use]
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Sets the record store; defaults to SQLite at `database_url`.
    #[must_use]
    pub fn records(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    /// Sets the vector store; defaults to the in-process index.
    #[must_use]
    pub fn vectors(mut self, vectors: Arc<dyn VectorStore>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    /// Registers an agent spec (runnable directly or as a member).
    #[must_use]
    pub fn agent(mut self, agent: AgentSpec) -> Self {
        self.agents.push(agent);
        self
    }

    /// Registers a team spec; validated at build.
    #[must_use]
    pub fn team(mut self, team: TeamSpec) -> Self {
        self.teams.push(team);
        self
    }

    /// Registers a tool.
    #[must_use]
    pub fn tool<T: crate::tool::Tool>(mut self, tool: T) -> Self {
        self.tools.register(tool);
        self
    }

    /// Disables the memory subsystem (and its built-in tool).
    #[must_use]
    pub const fn without_memory(mut self) -> Self {
        self.disable_memory = true;
        self
    }

    /// Assembles the runtime and performs startup recovery.
    pub async fn build(mut self) -> Result<Runtime> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let backend = self
            .backend
            .ok_or_else(|| RuntimeError::spec("runtime", "an LLM backend is required"))?;
        let records: Arc<dyn RecordStore> = match self.records {
            Some(records) => records,
            None => Arc::new(SqliteRecordStore::open(&config.database_url)?),
        };
        let vectors: Arc<dyn VectorStore> = self
            .vectors
            .unwrap_or_else(|| Arc::new(InMemoryVectorStore::new(config.embedding_dim)));
        let embedder: Arc<dyn Embedder> = self
            .embedder
            .unwrap_or_else(|| Arc::new(HashEmbedder::new(config.embedding_dim)));

        let sessions = Arc::new(SessionManager::new(Arc::clone(&records)));
        let knowledge = Arc::new(KnowledgeSubsystem::new(
            Arc::clone(&records),
            Arc::clone(&vectors),
            Arc::clone(&embedder),
            KnowledgeConfig::from(config.as_ref()),
        ));
        self.tools.register(KnowledgeSearchTool::new(Arc::clone(&knowledge)));

        let memory = if self.disable_memory {
            None
        } else {
            let memory = Arc::new(MemorySubsystem::new(
                Arc::clone(&records),
                Arc::clone(&vectors),
                Arc::clone(&embedder),
                Arc::clone(&backend),
                MemoryConfig::from(config.as_ref()),
            ));
            self.tools.register(MemorySearchTool::new(Arc::clone(&memory)));
            Some(memory)
        };

        let mut specs = SpecRegistry::new();
        for agent in self.agents {
            specs.register_agent(agent);
        }
        for team in self.teams {
            specs.register_team(team)?;
        }

        let coordinator = RunCoordinator::new(
            Arc::clone(&records),
            Arc::clone(&sessions),
            memory.clone(),
            backend,
            Arc::new(self.tools),
            Arc::clone(&config),
        );
        coordinator.recover().await?;

        Ok(Runtime {
            records,
            sessions,
            memory,
            knowledge,
            specs,
            coordinator,
        })
    }
}
