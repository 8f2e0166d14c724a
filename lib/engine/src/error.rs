//! Error types for the engine crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `EngineError`: why a control operation was refused or failed
//!
//! Control operations return `dealflow_core::Result<T, EngineError>` so callers can attach
//! their own context on the way up.

use dealflow_core::{IdempotencyKey, WorkflowInstanceId};
use dealflow_workflow::{EntityType, ErrorKind, InstanceStatus, StepError};
use std::fmt;

/// Errors from the control surface and the engine builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The built-in definitions failed validation.
    InvalidRegistry { reason: String },
    /// No workflow is registered for the entity type.
    WorkflowDisabled { entity_type: EntityType },
    /// The entity repository has no such entity.
    EntityNotFound {
        entity_type: EntityType,
        entity_id: String,
    },
    /// The entity already has a non-terminal instance.
    ActiveInstanceExists {
        entity_id: String,
        instance_id: WorkflowInstanceId,
    },
    InstanceNotFound { instance_id: WorkflowInstanceId },
    /// The instance has finished and accepts no further events.
    InstanceTerminal {
        instance_id: WorkflowInstanceId,
        status: InstanceStatus,
    },
    /// An agent result names an invocation this instance never made.
    UnknownInvocation {
        instance_id: WorkflowInstanceId,
        idempotency_key: IdempotencyKey,
    },
    /// The operation reached the executor and failed there.
    Step { error: StepError },
    /// The scheduler refused the work.
    Scheduler { reason: String },
}

impl EngineError {
    /// Classifies the error in the workflow error taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Step { error } => error.kind(),
            Self::Scheduler { .. } => ErrorKind::ResourceExhausted,
            _ => ErrorKind::Validation,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRegistry { reason } => {
                write!(f, "workflow registry is invalid: {reason}")
            }
            Self::WorkflowDisabled { entity_type } => {
                write!(f, "no workflow is enabled for {entity_type}")
            }
            Self::EntityNotFound {
                entity_type,
                entity_id,
            } => write!(f, "{entity_type} '{entity_id}' not found"),
            Self::ActiveInstanceExists {
                entity_id,
                instance_id,
            } => write!(
                f,
                "entity '{entity_id}' already has active instance {instance_id}"
            ),
            Self::InstanceNotFound { instance_id } => {
                write!(f, "workflow instance not found: {instance_id}")
            }
            Self::InstanceTerminal {
                instance_id,
                status,
            } => write!(f, "workflow instance {instance_id} is already {status}"),
            Self::UnknownInvocation {
                instance_id,
                idempotency_key,
            } => write!(
                f,
                "instance {instance_id} has no agent invocation for key {idempotency_key}"
            ),
            Self::Step { error } => write!(f, "step failed: {error}"),
            Self::Scheduler { reason } => write!(f, "scheduler refused work: {reason}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StepError> for EngineError {
    fn from(error: StepError) -> Self {
        Self::Step { error }
    }
}
