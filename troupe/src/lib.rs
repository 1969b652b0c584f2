//! Troupe is a team-of-agents conversational runtime.
//!
//! A request enters through a [`runtime::Runtime`], which resolves the
//! session, pins a spec, and starts a run. The run's team leader inspects
//! the request, optionally delegates subtasks to specialist members
//! (executed concurrently as sub-runs), consults the caller's memory and
//! knowledge stores through tools, and streams structured events plus
//! incremental content back over the run handle.
//!
//! # Example
//!
//! ```rust,ignore
//! let runtime = Runtime::builder()
//!     .backend(Arc::new(backend))
//!     .team(
//!         TeamSpec::new("support", "Support Team")
//!             .member(AgentSpec::new("weather", "Weather Agent").tool("web_search"))
//!             .member(AgentSpec::new("news", "News Agent").tool("web_search")),
//!     )
//!     .build()
//!     .await?;
//!
//! let mut handle = runtime.run("user-1", None, "Weather in Tokyo?", "support").await?;
//! while let Some(event) = handle.next_event().await {
//!     println!("{}: {:?}", event.kind(), event.body);
//! }
//! ```

// Execution core
mod agent;
pub mod run;
pub mod team;

// Channels and context
pub mod bus;
pub mod context;
pub mod event;

// Collaborator seams
pub mod embedding;
pub mod llm;
pub mod store;
pub mod tool;

// Subsystems
pub mod knowledge;
pub mod memory;
pub mod session;

// Configuration and assembly
pub mod config;
pub mod error;
pub mod model;
pub mod runtime;
pub mod spec;
pub mod usage;

pub use agent::AgentOutcome;
pub use config::RuntimeConfig;
pub use error::{ErrorKind, Result, RuntimeError};
pub use event::{Event, EventBody};
pub use run::RunHandle;
pub use runtime::{Runtime, RuntimeBuilder};
pub use spec::{AgentSpec, MemberSpec, TeamFlags, TeamSpec};
pub use usage::Usage;
