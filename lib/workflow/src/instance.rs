//! Workflow instances and their append-only history.

use crate::entity::EntityType;
use crate::error::{ErrorKind, StepError};
use chrono::{DateTime, Utc};
use dealflow_core::{AgentInvocationId, IdempotencyKey, SideEffectTaskId, WorkflowInstanceId};
use dealflow_integration::{SideEffectKind, SideEffectStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;

/// Execution status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Ready for its next step.
    Running,
    /// Waiting for an agent result or an entity update.
    SuspendedWaiting,
    Failed,
    Completed,
    Cancelled,
}

impl InstanceStatus {
    /// Returns true for statuses that accept no further steps.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::SuspendedWaiting => "suspended_waiting",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// The error that stopped an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&StepError> for InstanceError {
    fn from(err: &StepError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// What caused a step to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepTrigger {
    Start,
    EntityUpdated,
    AgentCompleted { idempotency_key: IdempotencyKey },
    /// A side-effect task of a pending transition settled.
    SideEffectSettled { idempotency_key: IdempotencyKey },
    RerunAgents,
    /// A follow-up after a transition or a requeue after a transient error.
    Continue,
    /// Re-enqueued by crash recovery.
    Recovery,
}

impl fmt::Display for StepTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::EntityUpdated => write!(f, "entity_updated"),
            Self::AgentCompleted { idempotency_key } => {
                write!(f, "agent_completed({idempotency_key})")
            }
            Self::SideEffectSettled { idempotency_key } => {
                write!(f, "side_effect_settled({idempotency_key})")
            }
            Self::RerunAgents => write!(f, "rerun_agents"),
            Self::Continue => write!(f, "continue"),
            Self::Recovery => write!(f, "recovery"),
        }
    }
}

/// The agent invocation a transition was gated on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInvocationRef {
    pub invocation_id: AgentInvocationId,
    pub agent: String,
    pub idempotency_key: IdempotencyKey,
}

/// A side effect executed as part of a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffectRef {
    pub task_id: SideEffectTaskId,
    pub kind: SideEffectKind,
    pub label: String,
    pub status: SideEffectStatus,
    pub idempotency_key: IdempotencyKey,
}

/// One committed transition. Never modified once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransitionRecord {
    /// The instance version this transition produced.
    pub sequence: u64,
    pub from_state: String,
    pub to_state: String,
    pub at: DateTime<Utc>,
    pub trigger: StepTrigger,
    pub agent_invocation: Option<AgentInvocationRef>,
    pub side_effects: Vec<SideEffectRef>,
}

/// The execution state of one entity's workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowInstanceId,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub current_state: String,
    pub status: InstanceStatus,
    /// Incremented by every commit.
    pub version: u64,
    pub history: Vec<StateTransitionRecord>,
    /// Retries performed so far for each pending step, keyed `FROM->TO`.
    pub retry_counts: HashMap<String, u32>,
    /// Bumped per state when agents are deliberately re-run.
    pub attempt_families: HashMap<String, u32>,
    /// Latest successful result per agent.
    pub agent_results: Map<String, JsonValue>,
    /// The invocation the instance is suspended on, if any.
    pub awaiting: Option<IdempotencyKey>,
    pub last_error: Option<InstanceError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Creates an instance in its workflow's initial state.
    #[must_use]
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        initial_state: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowInstanceId::new(),
            entity_id: entity_id.into(),
            entity_type,
            current_state: initial_state.into(),
            status: InstanceStatus::Running,
            version: 1,
            history: Vec::new(),
            retry_counts: HashMap::new(),
            attempt_families: HashMap::new(),
            agent_results: Map::new(),
            awaiting: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true once the instance is completed, failed or cancelled.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns how many times agents in `state` were deliberately re-run.
    #[must_use]
    pub fn attempt_family(&self, state: &str) -> u32 {
        self.attempt_families.get(state).copied().unwrap_or(0)
    }

    /// Returns when the instance entered its current state.
    #[must_use]
    pub fn state_entered_at(&self) -> DateTime<Utc> {
        self.history.last().map_or(self.created_at, |record| record.at)
    }

    /// Moves to `to_state` and appends the history record. The sequence is
    /// the version the next commit will produce.
    pub(crate) fn apply_transition(
        &mut self,
        to_state: &str,
        trigger: StepTrigger,
        agent_invocation: Option<AgentInvocationRef>,
        side_effects: Vec<SideEffectRef>,
        terminal: bool,
    ) {
        let from_state = std::mem::replace(&mut self.current_state, to_state.to_string());
        self.retry_counts
            .remove(&format!("{from_state}->{to_state}"));
        self.history.push(StateTransitionRecord {
            sequence: self.version + 1,
            from_state,
            to_state: to_state.to_string(),
            at: Utc::now(),
            trigger,
            agent_invocation,
            side_effects,
        });
        self.awaiting = None;
        self.status = if terminal {
            InstanceStatus::Completed
        } else {
            InstanceStatus::Running
        };
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_instance_starts_running_at_version_one() {
        let instance = WorkflowInstance::new(EntityType::Lead, "lead-1", "NEW");
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.version, 1);
        assert!(instance.history.is_empty());
        assert_eq!(instance.attempt_family("NEW"), 0);
    }

    #[test]
    fn apply_transition_appends_history() {
        let mut instance = WorkflowInstance::new(EntityType::Lead, "lead-1", "NEW");
        instance
            .retry_counts
            .insert("NEW->SCORING".to_string(), 2);
        instance.apply_transition("SCORING", StepTrigger::Start, None, Vec::new(), false);

        assert_eq!(instance.current_state, "SCORING");
        assert_eq!(instance.history.len(), 1);
        assert_eq!(instance.history[0].from_state, "NEW");
        assert_eq!(instance.history[0].sequence, 2);
        assert!(instance.retry_counts.is_empty());

        instance.version = 2;
        instance.apply_transition("SCORED", StepTrigger::Continue, None, Vec::new(), true);
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.history[1].sequence, 3);
    }

    #[test]
    fn state_entry_time_follows_history() {
        let mut instance = WorkflowInstance::new(EntityType::Lead, "lead-1", "NEW");
        assert_eq!(instance.state_entered_at(), instance.created_at);
        instance.apply_transition("SCORING", StepTrigger::Start, None, Vec::new(), false);
        assert_eq!(instance.state_entered_at(), instance.history[0].at);
    }

    #[test]
    fn terminal_statuses() {
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(!InstanceStatus::SuspendedWaiting.is_terminal());
        assert!(!InstanceStatus::Running.is_terminal());
    }

    #[test]
    fn instance_error_from_step_error() {
        let err = StepError::PermissionDenied {
            scope: "crm:sync".to_string(),
        };
        let recorded = InstanceError::from(&err);
        assert_eq!(recorded.kind, ErrorKind::PermissionDenied);
        assert!(recorded.message.contains("crm:sync"));
    }

    #[test]
    fn step_trigger_serializes_with_tag() {
        let json = serde_json::to_value(StepTrigger::AgentCompleted {
            idempotency_key: IdempotencyKey::from_raw("k"),
        })
        .unwrap();
        assert_eq!(json["type"], "agent_completed");
        assert_eq!(json["idempotency_key"], "k");
    }
}
