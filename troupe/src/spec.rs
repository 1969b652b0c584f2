//! Agent and team specifications.
//!
//! Specs are process-wide configuration registered at startup and pinned
//! by each run at start. A [`TeamSpec`] may nest agents and further teams,
//! but the member graph must be acyclic; validation rejects cycles and
//! incompatible flag combinations before a spec enters the registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Result, RuntimeError};
use crate::tool::{DynTool, ToolSet};

/// Static configuration of a single-purpose agent.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    /// Stable identifier used as a delegation target.
    pub agent_id: String,
    /// Display name.
    pub name: String,
    /// Short role description shown to the leader.
    pub role: String,
    /// System instructions.
    pub instructions: String,
    /// Model reference; empty means the backend's default model.
    pub model: String,
    /// Names of registered tools this agent may call.
    pub tools: Vec<String>,
    /// Whether rolling session history is included in the context.
    pub add_history_to_context: bool,
    /// How many prior runs of history to include.
    pub num_history_runs: usize,
    /// Whether memory hints are injected directly into the context
    /// (retrieval otherwise happens via the `memory_search` tool).
    pub add_memories_to_context: bool,
}

impl AgentSpec {
    /// Creates a spec with defaults.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            role: String::new(),
            instructions: String::new(),
            model: String::new(),
            tools: Vec::new(),
            add_history_to_context: true,
            num_history_runs: 5,
            add_memories_to_context: false,
        }
    }

    /// Sets the role description.
    #[must_use]
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Sets the system instructions.
    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Sets the model reference.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Grants a registered tool by name.
    #[must_use]
    pub fn tool(mut self, name: impl Into<String>) -> Self {
        self.tools.push(name.into());
        self
    }

    /// Enables in-context memory hints.
    #[must_use]
    pub const fn with_memories_in_context(mut self) -> Self {
        self.add_memories_to_context = true;
        self
    }
}

/// Leader behavior switches.
#[derive(Debug, Clone, Copy)]
pub struct TeamFlags {
    /// Adopt the member output as the run output without synthesis.
    pub respond_directly: bool,
    /// Leader writes a custom task per delegation; when false the original
    /// user input is passed through verbatim.
    pub determine_input_for_members: bool,
    /// Every delegation phase fans out to the full member set.
    pub delegate_to_all_members: bool,
    /// Later member invocations see prior members' tasks and outputs.
    pub share_member_interactions: bool,
    /// Members see the session's team-level rolling history.
    pub add_team_history_to_members: bool,
    /// Member tool names are listed in the leader's roster.
    pub add_member_tools_to_context: bool,
}

impl Default for TeamFlags {
    fn default() -> Self {
        Self {
            respond_directly: false,
            determine_input_for_members: true,
            delegate_to_all_members: false,
            share_member_interactions: false,
            add_team_history_to_members: false,
            add_member_tools_to_context: true,
        }
    }
}

/// A delegation target: an agent or a nested team.
#[derive(Debug, Clone)]
pub enum MemberSpec {
    /// A leaf agent.
    Agent(Arc<AgentSpec>),
    /// A nested team; its leader receives the delegated task.
    Team(Arc<TeamSpec>),
}

impl MemberSpec {
    /// The delegation-target identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Agent(agent) => &agent.agent_id,
            Self::Team(team) => &team.team_id,
        }
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Agent(agent) => &agent.name,
            Self::Team(team) => &team.name,
        }
    }

    /// Role line for the leader's roster.
    #[must_use]
    pub fn role(&self) -> &str {
        match self {
            Self::Agent(agent) => &agent.role,
            Self::Team(team) => &team.instructions,
        }
    }

    /// Tool names for the roster (nested teams list none).
    #[must_use]
    pub fn tool_names(&self) -> &[String] {
        match self {
            Self::Agent(agent) => &agent.tools,
            Self::Team(_) => &[],
        }
    }
}

/// Static configuration of a leader and its members.
#[derive(Debug, Clone)]
pub struct TeamSpec {
    /// Stable identifier.
    pub team_id: String,
    /// Display name; also the root producer identity of its runs.
    pub name: String,
    /// Leader system instructions.
    pub instructions: String,
    /// Leader model reference; empty means the backend's default.
    pub leader_model: String,
    /// Tools the leader itself may call (besides the synthetic ones).
    pub tools: Vec<String>,
    /// Delegation targets.
    pub members: Vec<MemberSpec>,
    /// Behavior switches.
    pub flags: TeamFlags,
    /// How many prior runs of team history to include.
    pub num_history_runs: usize,
}

impl TeamSpec {
    /// Creates a spec with defaults and no members.
    #[must_use]
    pub fn new(team_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            name: name.into(),
            instructions: String::new(),
            leader_model: String::new(),
            tools: Vec::new(),
            members: Vec::new(),
            flags: TeamFlags::default(),
            num_history_runs: 5,
        }
    }

    /// Sets the leader instructions.
    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Sets the leader model reference.
    #[must_use]
    pub fn leader_model(mut self, model: impl Into<String>) -> Self {
        self.leader_model = model.into();
        self
    }

    /// Adds an agent member.
    #[must_use]
    pub fn member(mut self, agent: AgentSpec) -> Self {
        self.members.push(MemberSpec::Agent(Arc::new(agent)));
        self
    }

    /// Adds a nested team member.
    #[must_use]
    pub fn team_member(mut self, team: Arc<TeamSpec>) -> Self {
        self.members.push(MemberSpec::Team(team));
        self
    }

    /// Overrides the behavior flags.
    #[must_use]
    pub const fn flags(mut self, flags: TeamFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Looks up a member by id (or, as a fallback, by name).
    #[must_use]
    pub fn find_member(&self, target: &str) -> Option<&MemberSpec> {
        self.members
            .iter()
            .find(|m| m.id() == target)
            .or_else(|| self.members.iter().find(|m| m.name() == target))
    }

    /// Validates flags and the member graph.
    ///
    /// Rejects `respond_directly` combined with `delegate_to_all_members`,
    /// duplicate member ids, and cycles among nested teams.
    pub fn validate(&self) -> Result<()> {
        if self.flags.respond_directly && self.flags.delegate_to_all_members {
            return Err(RuntimeError::spec(
                &self.team_id,
                "respond_directly is not compatible with delegate_to_all_members",
            ));
        }

        let mut seen = HashSet::new();
        for member in &self.members {
            if !seen.insert(member.id()) {
                return Err(RuntimeError::spec(
                    &self.team_id,
                    format!("duplicate member id '{}'", member.id()),
                ));
            }
        }

        let mut path = HashSet::new();
        self.check_acyclic(&mut path)
    }

    fn check_acyclic<'a>(&'a self, path: &mut HashSet<&'a str>) -> Result<()> {
        if !path.insert(self.team_id.as_str()) {
            return Err(RuntimeError::spec(
                &self.team_id,
                "cycle in team membership",
            ));
        }
        for member in &self.members {
            if let MemberSpec::Team(team) = member {
                team.check_acyclic(path)?;
            }
        }
        path.remove(self.team_id.as_str());
        Ok(())
    }
}

/// What a run executes: a bare agent or a team.
#[derive(Debug, Clone)]
pub enum RunnableSpec {
    /// A single agent with no delegation.
    Agent(Arc<AgentSpec>),
    /// A leader with members.
    Team(Arc<TeamSpec>),
}

impl RunnableSpec {
    /// The spec identifier used in run requests.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Agent(agent) => &agent.agent_id,
            Self::Team(team) => &team.team_id,
        }
    }

    /// The root producer identity for runs of this spec.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Agent(agent) => &agent.name,
            Self::Team(team) => &team.name,
        }
    }
}

/// Process-wide spec registry, loaded at startup.
#[derive(Debug, Default)]
pub struct SpecRegistry {
    specs: HashMap<String, RunnableSpec>,
}

impl SpecRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an agent spec.
    pub fn register_agent(&mut self, agent: AgentSpec) {
        self.specs.insert(
            agent.agent_id.clone(),
            RunnableSpec::Agent(Arc::new(agent)),
        );
    }

    /// Registers a team spec after validating it.
    pub fn register_team(&mut self, team: TeamSpec) -> Result<()> {
        team.validate()?;
        self.specs
            .insert(team.team_id.clone(), RunnableSpec::Team(Arc::new(team)));
        Ok(())
    }

    /// Pins a spec for a run.
    #[must_use]
    pub fn get(&self, spec_id: &str) -> Option<RunnableSpec> {
        self.specs.get(spec_id).cloned()
    }

    /// Registered spec ids.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.specs.keys().map(String::as_str).collect()
    }
}

/// Process-wide tool registry.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn DynTool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed tool.
    pub fn register<T: crate::tool::Tool>(&mut self, tool: T) {
        let boxed: Arc<dyn DynTool> = Arc::new(tool);
        self.tools.insert(boxed.name().to_owned(), boxed);
    }

    /// Registers a boxed tool.
    pub fn register_dyn(&mut self, tool: Arc<dyn DynTool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    /// Resolves spec tool names into a concrete [`ToolSet`].
    ///
    /// An unregistered name is a spec error caught at run start, not a
    /// silent omission.
    pub fn resolve(&self, names: &[String]) -> Result<ToolSet> {
        let mut set = ToolSet::new();
        for name in names {
            let tool = self
                .tools
                .get(name)
                .ok_or_else(|| RuntimeError::NotFound(format!("tool '{name}' not registered")))?;
            set.add_dyn(Arc::clone(tool));
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_respond_directly_with_delegate_to_all() {
        let team = TeamSpec::new("t1", "team").flags(TeamFlags {
            respond_directly: true,
            delegate_to_all_members: true,
            ..TeamFlags::default()
        });
        let err = team.validate().expect_err("must reject");
        assert!(matches!(err, RuntimeError::Spec { .. }));
    }

    #[test]
    fn validate_rejects_duplicate_member_ids() {
        let team = TeamSpec::new("t1", "team")
            .member(AgentSpec::new("a", "first"))
            .member(AgentSpec::new("a", "second"));
        assert!(team.validate().is_err());
    }

    #[test]
    fn validate_rejects_membership_cycles() {
        // Two teams sharing an id is the smallest cycle expressible with Arcs.
        let inner = Arc::new(TeamSpec::new("t1", "inner"));
        let outer = TeamSpec::new("t1", "outer").team_member(inner);
        assert!(outer.validate().is_err());
    }

    #[test]
    fn validate_accepts_nested_dag() {
        let inner = Arc::new(
            TeamSpec::new("research", "Research Team").member(AgentSpec::new("web", "Web Agent")),
        );
        let outer = TeamSpec::new("root", "Root Team")
            .member(AgentSpec::new("math", "Math Agent"))
            .team_member(inner);
        outer.validate().expect("valid dag");
    }

    #[test]
    fn find_member_matches_id_then_name() {
        let team = TeamSpec::new("t1", "team")
            .member(AgentSpec::new("weather", "Weather Agent"))
            .member(AgentSpec::new("news", "News Agent"));

        assert_eq!(team.find_member("weather").map(MemberSpec::id), Some("weather"));
        assert_eq!(
            team.find_member("News Agent").map(MemberSpec::id),
            Some("news")
        );
        assert!(team.find_member("absent").is_none());
    }

    #[test]
    fn registry_pins_specs_by_id() {
        let mut registry = SpecRegistry::new();
        registry.register_agent(AgentSpec::new("solo", "Solo Agent"));
        registry
            .register_team(TeamSpec::new("t1", "team").member(AgentSpec::new("a", "A")))
            .expect("register");

        assert!(matches!(registry.get("solo"), Some(RunnableSpec::Agent(_))));
        assert!(matches!(registry.get("t1"), Some(RunnableSpec::Team(_))));
        assert!(registry.get("absent").is_none());
    }

    #[test]
    fn tool_registry_resolution_is_strict() {
        let registry = ToolRegistry::new();
        let err = registry
            .resolve(&["missing".to_owned()])
            .expect_err("must fail");
        assert!(matches!(err, RuntimeError::NotFound(_)));
        assert!(registry.resolve(&[]).expect("empty").is_empty());
    }
}
