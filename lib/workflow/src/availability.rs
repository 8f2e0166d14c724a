//! What each transition leaving a state still needs before it can fire.

use crate::condition::{RequirementCheck, evaluation_context};
use crate::definition::{Transition, TransitionTrigger};
use dealflow_guard::Guard;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// One outgoing transition and the state of its requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionReport {
    pub from_state: String,
    pub to_state: String,
    /// The agent the transition is gated on, if any.
    pub agent: Option<String>,
    /// True when every requirement is met.
    pub available: bool,
    pub requirements: Vec<RequirementCheck>,
}

impl TransitionReport {
    /// Evaluates `transition` against an entity and the agent results
    /// recorded so far. Permissions are reported before guard leaves.
    #[must_use]
    pub fn evaluate(
        transition: &Transition,
        entity: &JsonValue,
        agents: &Map<String, JsonValue>,
        guard: &Guard,
    ) -> Self {
        let context = evaluation_context(entity, agents);
        let mut requirements: Vec<RequirementCheck> = transition
            .required_permissions
            .iter()
            .map(|scope| RequirementCheck {
                description: format!("permission '{scope}' is granted"),
                met: guard.check_permission(scope).is_ok(),
            })
            .collect();

        let agent = match &transition.trigger {
            TransitionTrigger::Automatic { condition } => {
                requirements.extend(condition.check(&context));
                None
            }
            TransitionTrigger::Agent { requirement } => {
                requirements.push(RequirementCheck {
                    description: format!("{} has produced a result", requirement.agent),
                    met: agents.contains_key(&requirement.agent),
                });
                requirements.extend(requirement.result_guard.check(&context));
                Some(requirement.agent.clone())
            }
        };

        Self {
            from_state: transition.from.clone(),
            to_state: transition.to.clone(),
            agent,
            available: requirements.iter().all(|check| check.met),
            requirements,
        }
    }

    /// Returns the descriptions of the requirements that are not met.
    pub fn unmet(&self) -> impl Iterator<Item = &str> {
        self.requirements
            .iter()
            .filter(|check| !check.met)
            .map(|check| check.description.as_str())
    }
}
