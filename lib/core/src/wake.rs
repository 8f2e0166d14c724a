//! Out-of-band completion notices.
//!
//! Agent invocations and side-effect tasks finish on their own tasks. When
//! they reach a terminal status they send a [`Wakeup`] so the scheduler can
//! enqueue a step for the instance that was waiting on them.

use crate::id::WorkflowInstanceId;
use crate::idempotency::IdempotencyKey;
use serde::{Deserialize, Serialize};

/// What completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "key", rename_all = "snake_case")]
pub enum WakeSource {
    Agent(IdempotencyKey),
    SideEffect(IdempotencyKey),
    /// Anything arriving through the control surface.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wakeup {
    pub instance_id: WorkflowInstanceId,
    pub source: WakeSource,
}

impl Wakeup {
    /// Creates a wakeup for `instance_id`.
    #[must_use]
    pub fn new(instance_id: WorkflowInstanceId, source: WakeSource) -> Self {
        Self {
            instance_id,
            source,
        }
    }
}
