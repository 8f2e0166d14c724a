//! The agent contract.

use crate::error::AgentCallError;
use async_trait::async_trait;
use dealflow_core::{IdempotencyKey, WorkflowInstanceId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One attempt of one invocation, as seen by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub agent_name: String,
    pub instance_id: WorkflowInstanceId,
    pub payload: JsonValue,
    /// Identical across every attempt of the same invocation.
    pub idempotency_key: IdempotencyKey,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// An external computation invoked by name.
///
/// Implementations should treat a repeated `idempotency_key` as a request
/// for the result they already produced.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The name transitions refer to this agent by.
    fn name(&self) -> &str;

    /// Runs the agent once.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails. `Rejected` is never retried.
    async fn invoke(&self, request: &AgentRequest) -> Result<JsonValue, AgentCallError>;
}
