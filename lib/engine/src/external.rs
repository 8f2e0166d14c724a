//! Events submitted to running instances from outside the engine.

use dealflow_core::IdempotencyKey;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// An event passed to [`WorkflowEngine::advance`](crate::WorkflowEngine::advance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExternalEvent {
    /// The entity's data changed. Guards are evaluated again.
    EntityUpdated,
    /// An agent delivered its result out of band.
    AgentResult {
        idempotency_key: IdempotencyKey,
        result: JsonValue,
    },
    /// An agent reported failure out of band.
    AgentFailed {
        idempotency_key: IdempotencyKey,
        reason: String,
    },
    /// Invoke the agents of the current state again under new keys.
    RerunAgents,
}

impl fmt::Display for ExternalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntityUpdated => write!(f, "entity_updated"),
            Self::AgentResult {
                idempotency_key, ..
            } => write!(f, "agent_result({idempotency_key})"),
            Self::AgentFailed {
                idempotency_key, ..
            } => write!(f, "agent_failed({idempotency_key})"),
            Self::RerunAgents => write!(f, "rerun_agents"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn agent_result_wire_format() {
        let event: ExternalEvent = serde_json::from_value(json!({
            "type": "agent_result",
            "idempotency_key": "wfi_1:SCORING->SCORED:0",
            "result": { "score": 91 },
        }))
        .unwrap();
        match &event {
            ExternalEvent::AgentResult {
                idempotency_key,
                result,
            } => {
                assert_eq!(idempotency_key.as_str(), "wfi_1:SCORING->SCORED:0");
                assert_eq!(result["score"], 91);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(event.to_string(), "agent_result(wfi_1:SCORING->SCORED:0)");
    }

    #[test]
    fn unit_events_carry_only_their_type() {
        let json = serde_json::to_value(ExternalEvent::RerunAgents).unwrap();
        assert_eq!(json, json!({ "type": "rerun_agents" }));
    }
}
