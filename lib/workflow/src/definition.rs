//! Workflow definitions.
//!
//! A definition is a directed graph whose nodes are named states and whose
//! edges are guarded transitions. Definitions are built once at start-up,
//! validated, and never mutated afterwards.

use crate::condition::GuardCondition;
use crate::entity::EntityType;
use crate::error::DefinitionError;
use dealflow_guard::{ResourceDemand, scopes};
use dealflow_integration::SideEffectSpec;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// How badly an instance has overstayed a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverdueSeverity {
    /// The target duration has passed.
    Warning,
    /// The maximum duration has passed.
    Critical,
}

impl OverdueSeverity {
    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Expected time spent in a state. Either bound may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageDuration {
    pub target_ms: Option<u64>,
    pub max_ms: Option<u64>,
}

impl StageDuration {
    /// Creates a duration with both bounds.
    #[must_use]
    pub fn new(target: Duration, max: Duration) -> Self {
        Self {
            target_ms: Some(duration_ms(target)),
            max_ms: Some(duration_ms(max)),
        }
    }

    /// Returns the severity earned by `elapsed`, if any bound was exceeded.
    #[must_use]
    pub fn severity(&self, elapsed: Duration) -> Option<OverdueSeverity> {
        let elapsed = duration_ms(elapsed);
        if self.max_ms.is_some_and(|max| elapsed > max) {
            Some(OverdueSeverity::Critical)
        } else if self.target_ms.is_some_and(|target| elapsed > target) {
            Some(OverdueSeverity::Warning)
        } else {
            None
        }
    }

    /// Returns the bound that `severity` refers to.
    #[must_use]
    pub fn limit(&self, severity: OverdueSeverity) -> Option<Duration> {
        let ms = match severity {
            OverdueSeverity::Warning => self.target_ms,
            OverdueSeverity::Critical => self.max_ms,
        };
        ms.map(Duration::from_millis)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A named state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    pub terminal: bool,
    #[serde(default)]
    pub duration: Option<StageDuration>,
}

impl State {
    /// Creates a non-terminal state.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            terminal: false,
            duration: None,
        }
    }

    /// Creates a terminal state.
    #[must_use]
    pub fn terminal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            terminal: true,
            duration: None,
        }
    }

    /// Sets the expected time spent in this state.
    #[must_use]
    pub fn with_duration(mut self, duration: StageDuration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// An agent whose successful result gates a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequirement {
    pub agent: String,
    pub permission_scope: String,
    #[serde(default)]
    pub demands: Vec<ResourceDemand>,
    /// Evaluated with the agent's result available under `agents.<agent>`.
    pub result_guard: GuardCondition,
    /// Shape the result must have. A result failing it is an invocation
    /// failure rather than an unmet guard.
    #[serde(default)]
    pub result_validation: GuardCondition,
}

impl AgentRequirement {
    /// Creates a requirement with the `agent:invoke` scope and no demands.
    #[must_use]
    pub fn new(agent: impl Into<String>, result_guard: GuardCondition) -> Self {
        Self {
            agent: agent.into(),
            permission_scope: scopes::AGENT_INVOKE.to_string(),
            demands: Vec::new(),
            result_guard,
            result_validation: GuardCondition::Always,
        }
    }

    /// Requires results to satisfy `validation`.
    #[must_use]
    pub fn with_result_validation(mut self, validation: GuardCondition) -> Self {
        self.result_validation = validation;
        self
    }

    /// Adds a resource demand drawn per invocation.
    #[must_use]
    pub fn with_demand(mut self, demand: ResourceDemand) -> Self {
        self.demands.push(demand);
        self
    }
}

/// What makes a transition eligible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionTrigger {
    /// Fires as soon as the condition holds on instance data.
    Automatic { condition: GuardCondition },
    /// Fires once the agent succeeds with a result satisfying its guard.
    Agent { requirement: AgentRequirement },
}

/// A guarded edge between two states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub trigger: TransitionTrigger,
    #[serde(default)]
    pub side_effects: Vec<SideEffectSpec>,
    #[serde(default)]
    pub required_permissions: Vec<String>,
}

impl Transition {
    /// Creates a transition that fires when `condition` holds.
    #[must_use]
    pub fn automatic(from: impl Into<String>, to: impl Into<String>, condition: GuardCondition) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            trigger: TransitionTrigger::Automatic { condition },
            side_effects: Vec::new(),
            required_permissions: Vec::new(),
        }
    }

    /// Creates a transition gated on an agent result.
    #[must_use]
    pub fn agent(
        from: impl Into<String>,
        to: impl Into<String>,
        requirement: AgentRequirement,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            trigger: TransitionTrigger::Agent { requirement },
            side_effects: Vec::new(),
            required_permissions: Vec::new(),
        }
    }

    /// Adds a side effect dispatched when the transition fires.
    #[must_use]
    pub fn with_side_effect(mut self, spec: SideEffectSpec) -> Self {
        self.side_effects.push(spec);
        self
    }

    /// Adds a permission scope the transition requires.
    #[must_use]
    pub fn with_permission(mut self, scope: impl Into<String>) -> Self {
        self.required_permissions.push(scope.into());
        self
    }

    /// Returns the agent gate, if the transition has one.
    #[must_use]
    pub fn agent_requirement(&self) -> Option<&AgentRequirement> {
        match &self.trigger {
            TransitionTrigger::Agent { requirement } => Some(requirement),
            TransitionTrigger::Automatic { .. } => None,
        }
    }
}

/// Per-definition timeouts for external calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepTimeouts {
    pub agent_ms: u64,
    pub side_effect_ms: u64,
}

impl StepTimeouts {
    /// Returns the agent call timeout.
    #[must_use]
    pub fn agent(&self) -> Duration {
        Duration::from_millis(self.agent_ms)
    }

    /// Returns the side-effect call timeout.
    #[must_use]
    pub fn side_effect(&self) -> Duration {
        Duration::from_millis(self.side_effect_ms)
    }
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            agent_ms: 30_000,
            side_effect_ms: 10_000,
        }
    }
}

/// The state machine for one entity type.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    entity_type: EntityType,
    initial_state: String,
    timeouts: StepTimeouts,
    graph: DiGraph<State, Transition>,
    /// Map from state name to petgraph's NodeIndex for O(1) lookup.
    state_index: HashMap<String, NodeIndex>,
}

impl WorkflowDefinition {
    /// Creates an empty definition. The initial state must be added with
    /// [`WorkflowDefinition::add_state`] before validation.
    #[must_use]
    pub fn new(entity_type: EntityType, initial_state: impl Into<String>) -> Self {
        Self {
            entity_type,
            initial_state: initial_state.into(),
            timeouts: StepTimeouts::default(),
            graph: DiGraph::new(),
            state_index: HashMap::new(),
        }
    }

    /// Sets the external call timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: StepTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Adds a state.
    ///
    /// # Errors
    ///
    /// Returns an error if a state with the same name exists.
    pub fn add_state(&mut self, state: State) -> Result<(), DefinitionError> {
        if self.state_index.contains_key(&state.name) {
            return Err(DefinitionError::DuplicateState { state: state.name });
        }
        let name = state.name.clone();
        let index = self.graph.add_node(state);
        self.state_index.insert(name, index);
        Ok(())
    }

    /// Adds a transition. Transitions leaving the same state are evaluated
    /// in the order they were added.
    ///
    /// # Errors
    ///
    /// Returns an error if either endpoint is not a declared state.
    pub fn add_transition(&mut self, transition: Transition) -> Result<(), DefinitionError> {
        let from = self.index_of(&transition.from)?;
        let to = self.index_of(&transition.to)?;
        self.graph.add_edge(from, to, transition);
        Ok(())
    }

    /// Sets the expected time spent in `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state is not declared.
    pub fn set_stage_duration(
        &mut self,
        state: &str,
        duration: StageDuration,
    ) -> Result<(), DefinitionError> {
        let index = self.index_of(state)?;
        self.graph[index].duration = Some(duration);
        Ok(())
    }

    fn index_of(&self, name: &str) -> Result<NodeIndex, DefinitionError> {
        self.state_index
            .get(name)
            .copied()
            .ok_or_else(|| DefinitionError::UnknownState {
                state: name.to_string(),
            })
    }

    /// Returns the entity type this definition governs.
    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// Returns the state new instances start in.
    #[must_use]
    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    /// Returns the external call timeouts.
    #[must_use]
    pub fn timeouts(&self) -> StepTimeouts {
        self.timeouts
    }

    /// Returns the state named `name`.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<&State> {
        let index = self.state_index.get(name)?;
        self.graph.node_weight(*index)
    }

    /// Returns true if `name` is a declared state.
    #[must_use]
    pub fn contains_state(&self, name: &str) -> bool {
        self.state_index.contains_key(name)
    }

    /// Returns true if `name` is a terminal state.
    #[must_use]
    pub fn is_terminal(&self, name: &str) -> bool {
        self.state(name).is_some_and(|s| s.terminal)
    }

    /// Returns all states in declaration order.
    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.graph.node_weights()
    }

    /// Returns all transitions in declaration order.
    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        self.graph.edge_weights()
    }

    /// Returns the transitions leaving `state` in declaration order.
    #[must_use]
    pub fn transitions_from(&self, state: &str) -> Vec<&Transition> {
        let Some(index) = self.state_index.get(state) else {
            return Vec::new();
        };
        // petgraph walks adjacency lists newest-first
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(*index, Direction::Outgoing)
            .collect();
        edges.sort_by_key(|e| e.id());
        edges.into_iter().map(|e| e.weight()).collect()
    }

    /// Returns true if any transition leaving `state` fires without an agent.
    #[must_use]
    pub fn has_automatic_transitions(&self, state: &str) -> bool {
        self.transitions_from(state)
            .iter()
            .any(|t| matches!(t.trigger, TransitionTrigger::Automatic { .. }))
    }

    /// Checks that the definition is a closed state machine.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The initial state is not declared
    /// - A terminal state has outgoing transitions
    /// - A non-terminal state has none
    /// - A state cannot be reached from the initial state
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let initial = self
            .state_index
            .get(&self.initial_state)
            .copied()
            .ok_or_else(|| DefinitionError::InitialStateMissing {
                state: self.initial_state.clone(),
            })?;

        for index in self.graph.node_indices() {
            let state = &self.graph[index];
            let outgoing = self
                .graph
                .edges_directed(index, Direction::Outgoing)
                .count();
            if state.terminal && outgoing > 0 {
                return Err(DefinitionError::TerminalHasTransitions {
                    state: state.name.clone(),
                });
            }
            if !state.terminal && outgoing == 0 {
                return Err(DefinitionError::DeadEnd {
                    state: state.name.clone(),
                });
            }
        }

        let mut reachable = HashSet::new();
        let mut bfs = Bfs::new(&self.graph, initial);
        while let Some(index) = bfs.next(&self.graph) {
            reachable.insert(index);
        }
        if let Some(index) = self.graph.node_indices().find(|i| !reachable.contains(i)) {
            return Err(DefinitionError::Unreachable {
                state: self.graph[index].name.clone(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new(EntityType::Lead, "A");
        def.add_state(State::new("A")).unwrap();
        def.add_state(State::new("B")).unwrap();
        def.add_state(State::terminal("C")).unwrap();
        def.add_transition(Transition::automatic("A", "B", GuardCondition::Always))
            .unwrap();
        def.add_transition(Transition::automatic("B", "C", GuardCondition::Always))
            .unwrap();
        def
    }

    #[test]
    fn valid_definition_passes() {
        let def = linear();
        assert!(def.validate().is_ok());
        assert_eq!(def.initial_state(), "A");
        assert!(def.is_terminal("C"));
        assert!(!def.is_terminal("B"));
        assert!(def.contains_state("B"));
        assert_eq!(def.states().count(), 3);
    }

    #[test]
    fn transitions_keep_declaration_order() {
        let mut def = linear();
        def.add_state(State::terminal("D")).unwrap();
        def.add_state(State::terminal("E")).unwrap();
        def.add_transition(Transition::automatic("B", "D", GuardCondition::Always))
            .unwrap();
        def.add_transition(Transition::automatic("B", "E", GuardCondition::Always))
            .unwrap();

        let targets: Vec<_> = def
            .transitions_from("B")
            .iter()
            .map(|t| t.to.as_str())
            .collect();
        assert_eq!(targets, vec!["C", "D", "E"]);
        assert!(def.transitions_from("missing").is_empty());
    }

    #[test]
    fn duplicate_and_unknown_states_rejected() {
        let mut def = linear();
        assert_eq!(
            def.add_state(State::new("A")),
            Err(DefinitionError::DuplicateState {
                state: "A".to_string()
            })
        );
        assert_eq!(
            def.add_transition(Transition::automatic("A", "Z", GuardCondition::Always)),
            Err(DefinitionError::UnknownState {
                state: "Z".to_string()
            })
        );
    }

    #[test]
    fn missing_initial_state_rejected() {
        let def = WorkflowDefinition::new(EntityType::Deal, "SOURCED");
        assert!(matches!(
            def.validate(),
            Err(DefinitionError::InitialStateMissing { .. })
        ));
    }

    #[test]
    fn dead_end_rejected() {
        let mut def = WorkflowDefinition::new(EntityType::Lead, "A");
        def.add_state(State::new("A")).unwrap();
        def.add_state(State::new("B")).unwrap();
        def.add_transition(Transition::automatic("A", "B", GuardCondition::Always))
            .unwrap();
        assert_eq!(
            def.validate(),
            Err(DefinitionError::DeadEnd {
                state: "B".to_string()
            })
        );
    }

    #[test]
    fn terminal_with_exit_rejected() {
        let mut def = linear();
        def.add_transition(Transition::automatic("C", "A", GuardCondition::Always))
            .unwrap();
        assert_eq!(
            def.validate(),
            Err(DefinitionError::TerminalHasTransitions {
                state: "C".to_string()
            })
        );
    }

    #[test]
    fn unreachable_state_rejected() {
        let mut def = linear();
        def.add_state(State::new("ORPHAN")).unwrap();
        def.add_transition(Transition::automatic("ORPHAN", "C", GuardCondition::Always))
            .unwrap();
        assert_eq!(
            def.validate(),
            Err(DefinitionError::Unreachable {
                state: "ORPHAN".to_string()
            })
        );
    }

    #[test]
    fn automatic_transition_detection() {
        let mut def = WorkflowDefinition::new(EntityType::Lead, "A");
        def.add_state(State::new("A")).unwrap();
        def.add_state(State::terminal("B")).unwrap();
        def.add_transition(Transition::agent(
            "A",
            "B",
            AgentRequirement::new("scorer", GuardCondition::Always),
        ))
        .unwrap();
        assert!(!def.has_automatic_transitions("A"));
        assert!(linear().has_automatic_transitions("A"));
    }

    #[test]
    fn stage_duration_severity() {
        let duration = StageDuration::new(Duration::from_secs(10), Duration::from_secs(30));
        assert_eq!(duration.severity(Duration::from_secs(10)), None);
        assert_eq!(
            duration.severity(Duration::from_secs(11)),
            Some(OverdueSeverity::Warning)
        );
        assert_eq!(
            duration.severity(Duration::from_secs(31)),
            Some(OverdueSeverity::Critical)
        );
        assert_eq!(
            duration.limit(OverdueSeverity::Critical),
            Some(Duration::from_secs(30))
        );

        let max_only = StageDuration {
            target_ms: None,
            max_ms: Some(1000),
        };
        assert_eq!(max_only.severity(Duration::from_millis(999)), None);
        assert_eq!(max_only.limit(OverdueSeverity::Warning), None);
    }

    #[test]
    fn stage_durations_attach_to_declared_states() {
        let mut def = linear();
        let duration = StageDuration::new(Duration::from_secs(1), Duration::from_secs(2));
        def.set_stage_duration("B", duration).unwrap();
        assert_eq!(def.state("B").unwrap().duration, Some(duration));
        assert_eq!(def.state("A").unwrap().duration, None);
        assert_eq!(
            def.set_stage_duration("Z", duration),
            Err(DefinitionError::UnknownState {
                state: "Z".to_string()
            })
        );
    }

    #[test]
    fn timeouts_convert_to_durations() {
        let timeouts = StepTimeouts {
            agent_ms: 1500,
            side_effect_ms: 250,
        };
        assert_eq!(timeouts.agent(), Duration::from_millis(1500));
        assert_eq!(timeouts.side_effect(), Duration::from_millis(250));
    }
}
