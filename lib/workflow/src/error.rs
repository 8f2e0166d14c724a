//! Error types for the workflow crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `DefinitionError`: a workflow definition is not a closed state machine
//! - `StoreError`: instance store operations, including lease and version checks
//! - `RepositoryError`: the external entity repository
//! - `EventSinkError`: lifecycle event delivery
//! - `StepError`: why a workflow step did not complete

use dealflow_core::WorkflowInstanceId;
use dealflow_guard::{GuardError, ResourceKind};
use dealflow_integration::SideEffectKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Errors from building or validating a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    /// A state was declared twice.
    DuplicateState { state: String },
    /// A transition refers to a state that was never declared.
    UnknownState { state: String },
    /// The initial state was never declared.
    InitialStateMissing { state: String },
    /// A non-terminal state has no way out.
    DeadEnd { state: String },
    /// A terminal state has outgoing transitions.
    TerminalHasTransitions { state: String },
    /// A state cannot be reached from the initial state.
    Unreachable { state: String },
    /// Two definitions were registered for the same entity type.
    DuplicateDefinition { entity_type: String },
}

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateState { state } => write!(f, "state '{state}' declared twice"),
            Self::UnknownState { state } => {
                write!(f, "transition refers to unknown state '{state}'")
            }
            Self::InitialStateMissing { state } => {
                write!(f, "initial state '{state}' is not declared")
            }
            Self::DeadEnd { state } => {
                write!(f, "non-terminal state '{state}' has no outgoing transition")
            }
            Self::TerminalHasTransitions { state } => {
                write!(f, "terminal state '{state}' has outgoing transitions")
            }
            Self::Unreachable { state } => {
                write!(f, "state '{state}' is unreachable from the initial state")
            }
            Self::DuplicateDefinition { entity_type } => {
                write!(f, "more than one workflow registered for {entity_type}")
            }
        }
    }
}

impl std::error::Error for DefinitionError {}

/// Errors from instance store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No instance with this id.
    NotFound { instance_id: WorkflowInstanceId },
    /// An instance with this id already exists.
    AlreadyExists { instance_id: WorkflowInstanceId },
    /// The entity already has a workflow that has not finished.
    ActiveInstanceExists {
        entity_id: String,
        instance_id: WorkflowInstanceId,
    },
    /// Another worker holds an unexpired lease.
    LeaseHeld { instance_id: WorkflowInstanceId },
    /// The caller's lease expired or was taken over.
    LeaseLost { instance_id: WorkflowInstanceId },
    /// The stored version differs from the one the caller read.
    VersionConflict {
        instance_id: WorkflowInstanceId,
        expected: u64,
        actual: u64,
    },
    /// The backing store failed.
    Unavailable { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { instance_id } => write!(f, "workflow instance not found: {instance_id}"),
            Self::AlreadyExists { instance_id } => {
                write!(f, "workflow instance already exists: {instance_id}")
            }
            Self::ActiveInstanceExists {
                entity_id,
                instance_id,
            } => {
                write!(
                    f,
                    "entity '{entity_id}' already has an active workflow instance {instance_id}"
                )
            }
            Self::LeaseHeld { instance_id } => {
                write!(f, "lease on {instance_id} is held by another worker")
            }
            Self::LeaseLost { instance_id } => write!(f, "lease on {instance_id} was lost"),
            Self::VersionConflict {
                instance_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "version conflict on {instance_id}: expected {expected}, found {actual}"
                )
            }
            Self::Unavailable { reason } => write!(f, "instance store unavailable: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from the entity repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The repository could not be reached.
    Unavailable { reason: String },
    /// The record could not be decoded.
    Malformed { reason: String },
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { reason } => write!(f, "entity repository unavailable: {reason}"),
            Self::Malformed { reason } => write!(f, "malformed entity record: {reason}"),
        }
    }
}

impl std::error::Error for RepositoryError {}

/// Errors from lifecycle event delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSinkError {
    /// Failed to connect to the event transport.
    ConnectionFailed { message: String },
    /// Failed to publish an event.
    PublishFailed { message: String },
}

impl fmt::Display for EventSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { message } => {
                write!(f, "event sink connection failed: {message}")
            }
            Self::PublishFailed { message } => write!(f, "event publish failed: {message}"),
        }
    }
}

impl std::error::Error for EventSinkError {}

/// Coarse classification of step failures, recorded on the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    AgentInvocation,
    PermissionDenied,
    ResourceExhausted,
    ConcurrencyConflict,
    SideEffect,
    Repository,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::AgentInvocation => "agent_invocation",
            Self::PermissionDenied => "permission_denied",
            Self::ResourceExhausted => "resource_exhausted",
            Self::ConcurrencyConflict => "concurrency_conflict",
            Self::SideEffect => "side_effect",
            Self::Repository => "repository",
        };
        write!(f, "{s}")
    }
}

/// Why a workflow step did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    /// The request or the instance's data is not eligible. Not retried.
    Validation { reason: String },
    /// An agent failed after exhausting its retries.
    AgentInvocation { agent: String, reason: String },
    /// A required scope is not granted. Needs reconfiguration.
    PermissionDenied { scope: String },
    /// A budget is exhausted. The step is requeued with a delay.
    ResourceExhausted {
        resource: ResourceKind,
        retry_after: Option<Duration>,
    },
    /// Lease contention or a stale version.
    ConcurrencyConflict {
        instance_id: WorkflowInstanceId,
        reason: String,
    },
    /// A required side effect failed.
    SideEffect {
        kind: SideEffectKind,
        label: String,
        reason: String,
    },
    /// The entity repository or instance store failed.
    Repository { reason: String },
}

impl StepError {
    /// Returns true if requeueing the step may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::ConcurrencyConflict { .. } | Self::Repository { .. }
        )
    }

    /// Classifies the error for retry and reporting.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::AgentInvocation { .. } => ErrorKind::AgentInvocation,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            Self::SideEffect { .. } => ErrorKind::SideEffect,
            Self::Repository { .. } => ErrorKind::Repository,
        }
    }

    /// Delay suggested by the error itself, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ResourceExhausted { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { reason } => write!(f, "validation failed: {reason}"),
            Self::AgentInvocation { agent, reason } => {
                write!(f, "agent '{agent}' invocation failed: {reason}")
            }
            Self::PermissionDenied { scope } => write!(f, "permission '{scope}' is not granted"),
            Self::ResourceExhausted {
                resource,
                retry_after,
            } => match retry_after {
                Some(after) => write!(
                    f,
                    "{resource} budget exhausted, retry in {}ms",
                    after.as_millis()
                ),
                None => write!(f, "{resource} budget exhausted"),
            },
            Self::ConcurrencyConflict {
                instance_id,
                reason,
            } => {
                write!(f, "concurrency conflict on {instance_id}: {reason}")
            }
            Self::SideEffect {
                kind,
                label,
                reason,
            } => {
                write!(f, "required {kind} side effect '{label}' failed: {reason}")
            }
            Self::Repository { reason } => write!(f, "repository error: {reason}"),
        }
    }
}

impl std::error::Error for StepError {}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LeaseHeld { instance_id }
            | StoreError::LeaseLost { instance_id }
            | StoreError::VersionConflict { instance_id, .. } => Self::ConcurrencyConflict {
                instance_id,
                reason: err.to_string(),
            },
            StoreError::NotFound { .. }
            | StoreError::AlreadyExists { .. }
            | StoreError::ActiveInstanceExists { .. } => Self::Validation {
                reason: err.to_string(),
            },
            StoreError::Unavailable { .. } => Self::Repository {
                reason: err.to_string(),
            },
        }
    }
}

impl From<RepositoryError> for StepError {
    fn from(err: RepositoryError) -> Self {
        Self::Repository {
            reason: err.to_string(),
        }
    }
}

impl From<GuardError> for StepError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::PermissionDenied { scope } => Self::PermissionDenied { scope },
            GuardError::ResourceExhausted {
                resource,
                retry_after,
            } => Self::ResourceExhausted {
                resource,
                retry_after,
            },
            GuardError::DemandExceedsLimit { .. } => Self::Validation {
                reason: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let id = WorkflowInstanceId::new();
        assert!(
            StepError::ConcurrencyConflict {
                instance_id: id,
                reason: "lease held".to_string()
            }
            .is_transient()
        );
        assert!(
            StepError::ResourceExhausted {
                resource: ResourceKind::ApiRate,
                retry_after: None
            }
            .is_transient()
        );
        assert!(
            !StepError::PermissionDenied {
                scope: "crm:sync".to_string()
            }
            .is_transient()
        );
        assert!(
            !StepError::AgentInvocation {
                agent: "lead_scorer".to_string(),
                reason: "exhausted".to_string()
            }
            .is_transient()
        );
    }

    #[test]
    fn store_conflicts_become_concurrency_conflicts() {
        let id = WorkflowInstanceId::new();
        let err: StepError = StoreError::VersionConflict {
            instance_id: id,
            expected: 3,
            actual: 4,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
        assert!(err.to_string().contains("expected 3"));

        let err: StepError = StoreError::NotFound { instance_id: id }.into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn definition_error_display() {
        let err = DefinitionError::DeadEnd {
            state: "SCORED".to_string(),
        };
        assert!(err.to_string().contains("SCORED"));
    }
}
