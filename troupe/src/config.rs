//! Runtime configuration.
//!
//! Loaded once at startup into an immutable snapshot; every run pins the
//! snapshot it started with. There is no hot reload — changed settings
//! require a restart.

use std::time::Duration;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    /// An environment variable could not be parsed.
    #[error("invalid value for {var}: {message}")]
    InvalidValue {
        /// The offending variable.
        var: &'static str,
        /// Parse failure description.
        message: String,
    },
}

/// Result type for configuration loading.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Immutable runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Record store location (SQLite path or `:memory:`).
    pub database_url: String,
    /// Vector store location.
    pub vector_store_url: String,
    /// API key for the LLM provider.
    pub llm_provider_key: String,
    /// Embedding dimensionality `D`; every stored vector must match.
    pub embedding_dim: usize,
    /// Soft wall-clock limit for one run.
    pub run_timeout: Duration,
    /// Wall-clock limit for one tool invocation.
    pub tool_timeout: Duration,
    /// Wall-clock limit for one member sub-run.
    pub member_timeout: Duration,
    /// Maximum LLM↔tool rounds per agent before forcing a final turn.
    pub max_tool_rounds: usize,
    /// Maximum delegation rounds per team run. Zero disables delegation.
    pub max_delegation_rounds: usize,
    /// Cosine threshold above which a new memory is a duplicate.
    pub memory_dedup_cosine: f32,
    /// Token-Jaccard threshold paired with the cosine duplicate check.
    pub memory_dedup_jaccard: f32,
    /// Cosine threshold above which the optimizer merges two memories.
    pub memory_merge_cosine: f32,
    /// Weight of cosine similarity (vs topic overlap) in memory ranking.
    pub memory_rank_alpha: f32,
    /// Weight of cosine similarity (vs BM25) in knowledge ranking.
    pub knowledge_beta: f32,
    /// Target chunk size in approximate tokens.
    pub chunk_target_tokens: usize,
    /// Hard chunk size cap in approximate tokens.
    pub chunk_max_tokens: usize,
    /// Grace period after cancellation before producers are dropped.
    pub cancel_grace: Duration,
    /// Event channel capacity per run.
    pub event_buffer: usize,
    /// Default number of prior runs included as rolling history.
    pub history_runs: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_url: ":memory:".to_owned(),
            vector_store_url: "memory://".to_owned(),
            llm_provider_key: String::new(),
            embedding_dim: 768,
            run_timeout: Duration::from_secs(120),
            tool_timeout: Duration::from_secs(30),
            member_timeout: Duration::from_secs(90),
            max_tool_rounds: 8,
            max_delegation_rounds: 4,
            memory_dedup_cosine: 0.90,
            memory_dedup_jaccard: 0.6,
            memory_merge_cosine: 0.95,
            memory_rank_alpha: 0.7,
            knowledge_beta: 0.6,
            chunk_target_tokens: 500,
            chunk_max_tokens: 800,
            cancel_grace: Duration::from_secs(5),
            event_buffer: crate::bus::DEFAULT_EVENT_BUFFER,
            history_runs: 5,
        }
    }
}

impl RuntimeConfig {
    /// Loads configuration from the environment.
    ///
    /// `DATABASE_URL`, `VECTOR_STORE_URL`, and `LLM_PROVIDER_KEY` are
    /// required; everything else falls back to its default.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self {
            database_url: require("DATABASE_URL")?,
            vector_store_url: require("VECTOR_STORE_URL")?,
            llm_provider_key: require("LLM_PROVIDER_KEY")?,
            ..Self::default()
        };

        if let Some(dim) = parse_var::<usize>("EMBEDDING_DIM")? {
            config.embedding_dim = dim;
        }
        if let Some(secs) = parse_var::<u64>("RUN_TIMEOUT_SEC")? {
            config.run_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("TOOL_TIMEOUT_SEC")? {
            config.tool_timeout = Duration::from_secs(secs);
        }
        if let Some(rounds) = parse_var::<usize>("MAX_TOOL_ROUNDS")? {
            config.max_tool_rounds = rounds;
        }
        if let Some(rounds) = parse_var::<usize>("MAX_DELEGATION_ROUNDS")? {
            config.max_delegation_rounds = rounds;
        }
        if let Some(threshold) = parse_var::<f32>("MEMORY_DEDUP_COSINE")? {
            config.memory_dedup_cosine = threshold;
        }
        if let Some(threshold) = parse_var::<f32>("MEMORY_MERGE_COSINE")? {
            config.memory_merge_cosine = threshold;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects inconsistent settings.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.embedding_dim == 0 {
            return Err(ConfigError::InvalidValue {
                var: "EMBEDDING_DIM",
                message: "must be positive".into(),
            });
        }
        if self.chunk_max_tokens < self.chunk_target_tokens {
            return Err(ConfigError::InvalidValue {
                var: "CHUNK_MAX_TOKENS",
                message: "hard cap below target".into(),
            });
        }
        for (var, value) in [
            ("MEMORY_DEDUP_COSINE", self.memory_dedup_cosine),
            ("MEMORY_MERGE_COSINE", self.memory_merge_cosine),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    var,
                    message: format!("{value} outside [0, 1]"),
                });
            }
        }
        Ok(())
    }
}

fn require(var: &'static str) -> ConfigResult<String> {
    std::env::var(var).map_err(|_| ConfigError::MissingVar(var))
}

fn parse_var<T: std::str::FromStr>(var: &'static str) -> ConfigResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                var,
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
