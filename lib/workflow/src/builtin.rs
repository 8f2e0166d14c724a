//! The built-in Lead, Assessment and Deal workflows.
//!
//! Thresholds are illustrative defaults and are always taken from
//! [`Thresholds`], never hard-coded into the graphs.

use crate::condition::GuardCondition;
use crate::definition::{
    AgentRequirement, StageDuration, State, StepTimeouts, Transition, WorkflowDefinition,
};
use crate::entity::EntityType;
use crate::error::DefinitionError;
use dealflow_guard::{ResourceDemand, ResourceKind, scopes};
use dealflow_integration::{SideEffectKind, SideEffectSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const LEAD_SCORER: &str = "lead_scorer";
pub const ASSESSMENT_EVALUATOR: &str = "assessment_evaluator";
pub const DEAL_SCREENER: &str = "deal_screener";

/// Storage drawn by a closing-pack upload, in MB.
const CLOSING_PACK_STORAGE_MB: u64 = 64;

/// Cut-offs used by the built-in guards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Minimum lead score to qualify.
    pub lead_qualification: f64,
    /// Minimum assessment score to approve.
    pub assessment_approval: f64,
    /// Minimum screening score to enter due diligence.
    pub deal_screening: f64,
    /// Minimum IRR target to move a deal to closing. A deal without a
    /// target is treated as 0.
    pub deal_minimum_irr: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            lead_qualification: 70.0,
            assessment_approval: 60.0,
            deal_screening: 50.0,
            deal_minimum_irr: 0.0,
        }
    }
}

/// Which workflows to register and how to parameterize them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub enable_lead_scoring: bool,
    pub assessment_workflow_enabled: bool,
    pub thresholds: Thresholds,
    pub timeouts: StepTimeouts,
    /// Expected time in each state, keyed by state name. Names match
    /// case-insensitively since environment overrides arrive lowercased.
    pub stage_durations: HashMap<String, StageDuration>,
}

impl RegistrySettings {
    /// Returns the configured duration for `state`.
    #[must_use]
    pub fn stage_duration(&self, state: &str) -> Option<StageDuration> {
        self.stage_durations
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(state))
            .map(|(_, duration)| *duration)
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            enable_lead_scoring: true,
            assessment_workflow_enabled: true,
            thresholds: Thresholds::default(),
            timeouts: StepTimeouts::default(),
            stage_durations: HashMap::new(),
        }
    }
}

fn score_path(agent: &str) -> String {
    format!("agents.{agent}.score")
}

/// Side effects declared on every transition into a terminal state.
fn closing_effects(transition: Transition, template: &str, object: &str) -> Transition {
    transition
        .with_side_effect(SideEffectSpec::notification(template))
        .with_side_effect(SideEffectSpec::crm_sync(object))
}

/// `NEW → SCORING → SCORED → {QUALIFIED | DISQUALIFIED}`
///
/// # Errors
///
/// Returns an error if the graph is not closed.
pub fn lead_workflow(
    thresholds: &Thresholds,
    timeouts: StepTimeouts,
) -> Result<WorkflowDefinition, DefinitionError> {
    let score = score_path(LEAD_SCORER);
    let mut def = WorkflowDefinition::new(EntityType::Lead, "NEW").with_timeouts(timeouts);
    def.add_state(State::new("NEW"))?;
    def.add_state(State::new("SCORING"))?;
    def.add_state(State::new("SCORED"))?;
    def.add_state(State::terminal("QUALIFIED"))?;
    def.add_state(State::terminal("DISQUALIFIED"))?;

    def.add_transition(
        Transition::automatic("NEW", "SCORING", GuardCondition::Always)
            .with_permission(scopes::WORKFLOW_EXECUTE),
    )?;
    def.add_transition(
        Transition::agent(
            "SCORING",
            "SCORED",
            AgentRequirement::new(LEAD_SCORER, GuardCondition::present(score.clone()))
                .with_result_validation(GuardCondition::numeric(score.clone())),
        )
        .with_permission(scopes::WORKFLOW_EXECUTE),
    )?;
    def.add_transition(closing_effects(
        Transition::automatic(
            "SCORED",
            "QUALIFIED",
            GuardCondition::at_least(score.clone(), thresholds.lead_qualification),
        )
        .with_permission(scopes::WORKFLOW_EXECUTE),
        "lead_qualified",
        "lead",
    ))?;
    def.add_transition(closing_effects(
        Transition::automatic(
            "SCORED",
            "DISQUALIFIED",
            GuardCondition::below(score, thresholds.lead_qualification),
        )
        .with_permission(scopes::WORKFLOW_EXECUTE),
        "lead_disqualified",
        "lead",
    ))?;
    def.validate()?;
    Ok(def)
}

/// `DRAFT → IN_REVIEW → EVALUATED → {APPROVED | REJECTED}`
///
/// # Errors
///
/// Returns an error if the graph is not closed.
pub fn assessment_workflow(
    thresholds: &Thresholds,
    timeouts: StepTimeouts,
) -> Result<WorkflowDefinition, DefinitionError> {
    let score = score_path(ASSESSMENT_EVALUATOR);
    let mut def = WorkflowDefinition::new(EntityType::Assessment, "DRAFT").with_timeouts(timeouts);
    def.add_state(State::new("DRAFT"))?;
    def.add_state(State::new("IN_REVIEW"))?;
    def.add_state(State::new("EVALUATED"))?;
    def.add_state(State::terminal("APPROVED"))?;
    def.add_state(State::terminal("REJECTED"))?;

    def.add_transition(
        Transition::automatic(
            "DRAFT",
            "IN_REVIEW",
            GuardCondition::equals("entity.submitted", true),
        )
        .with_permission(scopes::WORKFLOW_EXECUTE),
    )?;
    def.add_transition(
        Transition::agent(
            "IN_REVIEW",
            "EVALUATED",
            AgentRequirement::new(ASSESSMENT_EVALUATOR, GuardCondition::present(score.clone()))
                .with_result_validation(GuardCondition::numeric(score.clone())),
        )
        .with_permission(scopes::WORKFLOW_EXECUTE),
    )?;
    def.add_transition(closing_effects(
        Transition::automatic(
            "EVALUATED",
            "APPROVED",
            GuardCondition::at_least(score.clone(), thresholds.assessment_approval),
        )
        .with_permission(scopes::WORKFLOW_EXECUTE),
        "assessment_approved",
        "assessment",
    ))?;
    def.add_transition(closing_effects(
        Transition::automatic(
            "EVALUATED",
            "REJECTED",
            GuardCondition::below(score, thresholds.assessment_approval),
        )
        .with_permission(scopes::WORKFLOW_EXECUTE),
        "assessment_rejected",
        "assessment",
    ))?;
    def.validate()?;
    Ok(def)
}

/// `SOURCED → NEGOTIATION → DUE_DILIGENCE → CLOSING → {FUNDED | LOST}`
///
/// # Errors
///
/// Returns an error if the graph is not closed.
pub fn deal_workflow(
    thresholds: &Thresholds,
    timeouts: StepTimeouts,
) -> Result<WorkflowDefinition, DefinitionError> {
    let mut def = WorkflowDefinition::new(EntityType::Deal, "SOURCED").with_timeouts(timeouts);
    def.add_state(State::new("SOURCED"))?;
    def.add_state(State::new("NEGOTIATION"))?;
    def.add_state(State::new("DUE_DILIGENCE"))?;
    def.add_state(State::new("CLOSING"))?;
    def.add_state(State::terminal("FUNDED"))?;
    def.add_state(State::terminal("LOST"))?;

    def.add_transition(
        Transition::automatic(
            "SOURCED",
            "NEGOTIATION",
            GuardCondition::present("entity.deal_lead"),
        )
        .with_permission(scopes::WORKFLOW_EXECUTE),
    )?;
    def.add_transition(
        Transition::agent(
            "NEGOTIATION",
            "DUE_DILIGENCE",
            AgentRequirement::new(
                DEAL_SCREENER,
                GuardCondition::at_least(score_path(DEAL_SCREENER), thresholds.deal_screening),
            )
            .with_result_validation(GuardCondition::numeric(score_path(DEAL_SCREENER))),
        )
        .with_permission(scopes::WORKFLOW_EXECUTE),
    )?;
    def.add_transition(
        Transition::automatic(
            "DUE_DILIGENCE",
            "CLOSING",
            GuardCondition::all(vec![
                GuardCondition::FieldAtLeast {
                    path: "entity.irr_target".to_string(),
                    threshold: thresholds.deal_minimum_irr,
                    missing: Some(0.0),
                },
                GuardCondition::present("entity.post_money_valuation"),
            ]),
        )
        .with_permission(scopes::WORKFLOW_EXECUTE),
    )?;
    def.add_transition(
        closing_effects(
            Transition::automatic(
                "CLOSING",
                "FUNDED",
                GuardCondition::equals("entity.outcome", "funded"),
            )
            .with_permission(scopes::WORKFLOW_EXECUTE),
            "deal_funded",
            "deal",
        )
        .with_side_effect(
            SideEffectSpec::new(SideEffectKind::FileUpload, "closing_pack")
                .required()
                .with_payload(serde_json::json!({ "document": "closing_pack" }))
                .with_demand(ResourceDemand::new(
                    ResourceKind::Storage,
                    CLOSING_PACK_STORAGE_MB,
                )),
        ),
    )?;
    def.add_transition(closing_effects(
        Transition::automatic("CLOSING", "LOST", GuardCondition::equals("entity.outcome", "lost"))
            .with_permission(scopes::WORKFLOW_EXECUTE),
        "deal_lost",
        "deal",
    ))?;
    def.validate()?;
    Ok(def)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::TransitionTrigger;
    use serde_json::json;

    fn all_definitions() -> Vec<WorkflowDefinition> {
        let thresholds = Thresholds::default();
        let timeouts = StepTimeouts::default();
        vec![
            lead_workflow(&thresholds, timeouts).unwrap(),
            assessment_workflow(&thresholds, timeouts).unwrap(),
            deal_workflow(&thresholds, timeouts).unwrap(),
        ]
    }

    #[test]
    fn builtin_graphs_are_closed() {
        for def in all_definitions() {
            assert!(def.validate().is_ok(), "{} is not closed", def.entity_type());
            for state in def.states() {
                let outgoing = def.transitions_from(&state.name).len();
                if state.terminal {
                    assert_eq!(outgoing, 0, "{} has exits", state.name);
                } else {
                    assert!(outgoing > 0, "{} is a dead end", state.name);
                }
            }
        }
    }

    #[test]
    fn terminal_states_match_lifecycle() {
        let terminals: Vec<Vec<String>> = all_definitions()
            .iter()
            .map(|d| {
                d.states()
                    .filter(|s| s.terminal)
                    .map(|s| s.name.clone())
                    .collect()
            })
            .collect();
        assert_eq!(terminals[0], vec!["QUALIFIED", "DISQUALIFIED"]);
        assert_eq!(terminals[1], vec!["APPROVED", "REJECTED"]);
        assert_eq!(terminals[2], vec!["FUNDED", "LOST"]);
    }

    #[test]
    fn every_transition_requires_workflow_execute() {
        for def in all_definitions() {
            for t in def.transitions() {
                assert!(
                    t.required_permissions
                        .iter()
                        .any(|p| p == scopes::WORKFLOW_EXECUTE)
                );
            }
        }
    }

    #[test]
    fn terminal_transitions_declare_notification_and_crm_sync() {
        for def in all_definitions() {
            for t in def.transitions().filter(|t| def.is_terminal(&t.to)) {
                let kinds: Vec<_> = t.side_effects.iter().map(|s| s.kind).collect();
                assert!(kinds.contains(&SideEffectKind::Notification));
                assert!(kinds.contains(&SideEffectKind::CrmSync));
                assert!(
                    t.side_effects
                        .iter()
                        .filter(|s| s.kind != SideEffectKind::FileUpload)
                        .all(|s| !s.required)
                );
            }
        }
    }

    #[test]
    fn funded_requires_closing_pack_upload() {
        let def = deal_workflow(&Thresholds::default(), StepTimeouts::default()).unwrap();
        let funded = def
            .transitions_from("CLOSING")
            .into_iter()
            .find(|t| t.to == "FUNDED")
            .unwrap();
        let upload = funded
            .side_effects
            .iter()
            .find(|s| s.kind == SideEffectKind::FileUpload)
            .unwrap();
        assert!(upload.required);
        assert_eq!(upload.label, "closing_pack");
    }

    #[test]
    fn lead_threshold_splits_scored_leads() {
        let thresholds = Thresholds {
            lead_qualification: 70.0,
            ..Thresholds::default()
        };
        let def = lead_workflow(&thresholds, StepTimeouts::default()).unwrap();
        let exits = def.transitions_from("SCORED");
        let fire = |score: i64| -> Vec<&str> {
            let ctx = json!({"entity": {}, "agents": {"lead_scorer": {"score": score}}});
            exits
                .iter()
                .filter(|t| match &t.trigger {
                    TransitionTrigger::Automatic { condition } => condition.evaluate(&ctx),
                    TransitionTrigger::Agent { .. } => false,
                })
                .map(|t| t.to.as_str())
                .collect()
        };
        assert_eq!(fire(80), vec!["QUALIFIED"]);
        assert_eq!(fire(70), vec!["QUALIFIED"]);
        assert_eq!(fire(69), vec!["DISQUALIFIED"]);
    }

    #[test]
    fn deal_closing_guard_treats_missing_irr_as_zero() {
        let def = deal_workflow(&Thresholds::default(), StepTimeouts::default()).unwrap();
        let exits = def.transitions_from("DUE_DILIGENCE");
        let TransitionTrigger::Automatic { condition } = &exits[0].trigger else {
            panic!("expected automatic transition");
        };
        assert!(condition.evaluate(&json!({"entity": {"post_money_valuation": 12_000_000}})));
        assert!(!condition.evaluate(&json!({"entity": {"irr_target": 0.2}})));

        let strict = deal_workflow(
            &Thresholds {
                deal_minimum_irr: 0.15,
                ..Thresholds::default()
            },
            StepTimeouts::default(),
        )
        .unwrap();
        let exits = strict.transitions_from("DUE_DILIGENCE");
        let TransitionTrigger::Automatic { condition } = &exits[0].trigger else {
            panic!("expected automatic transition");
        };
        assert!(!condition.evaluate(&json!({"entity": {"post_money_valuation": 1}})));
        assert!(condition.evaluate(
            &json!({"entity": {"post_money_valuation": 1, "irr_target": 0.2}})
        ));
    }

    #[test]
    fn agent_gates_are_declared() {
        let agents: Vec<String> = all_definitions()
            .iter()
            .flat_map(|d| {
                d.transitions()
                    .filter_map(|t| t.agent_requirement().map(|r| r.agent.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        assert_eq!(agents, vec![LEAD_SCORER, ASSESSMENT_EVALUATOR, DEAL_SCREENER]);
    }

    #[test]
    fn agent_scores_must_be_numeric() {
        for def in all_definitions() {
            for requirement in def.transitions().filter_map(Transition::agent_requirement) {
                let path = score_path(&requirement.agent);
                let text = json!({"agents": {requirement.agent.clone(): {"score": "85"}}});
                let number = json!({"agents": {requirement.agent.clone(): {"score": 85}}});
                assert!(!requirement.result_validation.evaluate(&text), "{path}");
                assert!(requirement.result_validation.evaluate(&number), "{path}");
            }
        }
    }

    #[test]
    fn stage_durations_match_state_names_case_insensitively() {
        let duration = StageDuration {
            target_ms: Some(1_000),
            max_ms: None,
        };
        let settings = RegistrySettings {
            stage_durations: HashMap::from([("negotiation".to_string(), duration)]),
            ..RegistrySettings::default()
        };
        assert_eq!(settings.stage_duration("NEGOTIATION"), Some(duration));
        assert_eq!(settings.stage_duration("CLOSING"), None);
    }
}
