//! Idempotency keys for externally visible effects.
//!
//! A key is derived deterministically from the step that causes the effect:
//! `(instance_id, from_state, to_state, attempt_family)`. Re-executing the
//! same logical step (after a crash, a lease expiry or a scheduler retry)
//! therefore produces the same key, and receivers use it to collapse the
//! repeated delivery into a single observable effect.

use crate::id::WorkflowInstanceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A deterministic identifier for one logical effect of one workflow step.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derives the key for the step `from_state -> to_state` of an instance.
    ///
    /// `attempt_family` is bumped only when a caller deliberately asks for a
    /// fresh effect (for example re-running an agent whose result did not
    /// satisfy the transition guard); plain retries keep the family.
    #[must_use]
    pub fn for_step(
        instance_id: WorkflowInstanceId,
        from_state: &str,
        to_state: &str,
        attempt_family: u32,
    ) -> Self {
        Self(format!(
            "{instance_id}:{from_state}->{to_state}:{attempt_family}"
        ))
    }

    /// Derives a child key for one of several effects of the same step.
    #[must_use]
    pub fn child(&self, label: &str) -> Self {
        Self(format!("{}#{label}", self.0))
    }

    /// Wraps an existing key string, e.g. one echoed back by an agent.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
