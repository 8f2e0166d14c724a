//! Error types for the agent crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `AgentCallError`: a single call to an agent implementation
//! - `InvocationError`: why an invocation settled as failed
//! - `GatewayError`: requests the gateway rejects synchronously

use dealflow_core::IdempotencyKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors an [`Agent`](crate::Agent) implementation may return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCallError {
    /// The agent could not be reached.
    Unavailable { reason: String },
    /// The agent ran but failed.
    Failed { reason: String },
    /// The agent refused the input. Retrying cannot help.
    Rejected { reason: String },
    /// The agent did not answer in time.
    Timeout,
}

impl AgentCallError {
    /// Returns true if another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

impl fmt::Display for AgentCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { reason } => write!(f, "agent unavailable: {reason}"),
            Self::Failed { reason } => write!(f, "agent failed: {reason}"),
            Self::Rejected { reason } => write!(f, "agent rejected the request: {reason}"),
            Self::Timeout => write!(f, "agent call timed out"),
        }
    }
}

impl std::error::Error for AgentCallError {}

/// Why an invocation ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvocationError {
    /// Every allowed attempt failed or timed out.
    Exhausted {
        agent: String,
        attempts: u32,
        last_error: String,
    },
    /// The agent returned a non-retryable error, or one was reported out of band.
    Rejected { agent: String, reason: String },
    /// The invocation's scope is not granted.
    PermissionDenied { scope: String },
    /// The invocation demands more of a resource than the budget allows.
    ResourceUnavailable { reason: String },
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted {
                agent,
                attempts,
                last_error,
            } => {
                write!(
                    f,
                    "agent '{agent}' exhausted {attempts} attempts, last error: {last_error}"
                )
            }
            Self::Rejected { agent, reason } => {
                write!(f, "agent '{agent}' rejected the invocation: {reason}")
            }
            Self::PermissionDenied { scope } => {
                write!(f, "permission '{scope}' is not granted")
            }
            Self::ResourceUnavailable { reason } => {
                write!(f, "resource unavailable: {reason}")
            }
        }
    }
}

impl std::error::Error for InvocationError {}

/// Requests the gateway rejects without creating an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No agent is registered under the name.
    UnknownAgent { agent: String },
    /// No invocation is recorded for the key.
    UnknownInvocation { key: IdempotencyKey },
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAgent { agent } => write!(f, "no agent registered as '{agent}'"),
            Self::UnknownInvocation { key } => write!(f, "no invocation recorded for key {key}"),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rejections_are_final() {
        assert!(AgentCallError::Timeout.is_retryable());
        assert!(
            AgentCallError::Unavailable {
                reason: "connection refused".to_string()
            }
            .is_retryable()
        );
        assert!(
            !AgentCallError::Rejected {
                reason: "missing company name".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn exhausted_display_names_agent_and_attempts() {
        let err = InvocationError::Exhausted {
            agent: "assessment_evaluator".to_string(),
            attempts: 3,
            last_error: "agent call timed out".to_string(),
        };
        assert!(err.to_string().contains("assessment_evaluator"));
        assert!(err.to_string().contains('3'));
    }
}
