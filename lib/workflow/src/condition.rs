//! Guard conditions on transitions.
//!
//! Conditions are evaluated against an evaluation context of the form
//! `{"entity": <entity record>, "agents": {<agent name>: <result>}}` and
//! address values with dot-separated paths such as `agents.lead_scorer.score`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// A predicate over the evaluation context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardCondition {
    /// Always satisfied.
    #[default]
    Always,
    /// The path resolves to a non-null value.
    FieldPresent { path: String },
    /// The path resolves to exactly this value.
    FieldEquals { path: String, value: JsonValue },
    /// The path resolves to a number `>= threshold`.
    FieldAtLeast {
        path: String,
        threshold: f64,
        /// Value assumed when the path is missing or null.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        missing: Option<f64>,
    },
    /// The path resolves to a number `< threshold`.
    FieldBelow { path: String, threshold: f64 },
    /// The path resolves to a number.
    FieldIsNumber { path: String },
    All { conditions: Vec<GuardCondition> },
    Any { conditions: Vec<GuardCondition> },
    Not { condition: Box<GuardCondition> },
}

/// One leaf of a condition and whether it currently holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementCheck {
    pub description: String,
    pub met: bool,
}

impl GuardCondition {
    /// Creates a presence check.
    #[must_use]
    pub fn present(path: impl Into<String>) -> Self {
        Self::FieldPresent { path: path.into() }
    }

    /// Creates an equality check.
    #[must_use]
    pub fn equals(path: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::FieldEquals {
            path: path.into(),
            value: value.into(),
        }
    }

    /// Creates a `>=` check without a default for missing values.
    #[must_use]
    pub fn at_least(path: impl Into<String>, threshold: f64) -> Self {
        Self::FieldAtLeast {
            path: path.into(),
            threshold,
            missing: None,
        }
    }

    /// Creates a `<` check.
    #[must_use]
    pub fn below(path: impl Into<String>, threshold: f64) -> Self {
        Self::FieldBelow {
            path: path.into(),
            threshold,
        }
    }

    /// Creates a check that the path holds a number.
    #[must_use]
    pub fn numeric(path: impl Into<String>) -> Self {
        Self::FieldIsNumber { path: path.into() }
    }

    /// Creates a conjunction. An empty one always holds.
    #[must_use]
    pub fn all(conditions: Vec<GuardCondition>) -> Self {
        Self::All { conditions }
    }

    /// Creates a disjunction. An empty one never holds.
    #[must_use]
    pub fn any(conditions: Vec<GuardCondition>) -> Self {
        Self::Any { conditions }
    }

    /// Creates a negation.
    #[must_use]
    pub fn negate(condition: GuardCondition) -> Self {
        Self::Not {
            condition: Box::new(condition),
        }
    }

    /// Evaluates the condition. Missing paths and non-numeric values never
    /// satisfy a numeric comparison unless a `missing` default is set.
    #[must_use]
    pub fn evaluate(&self, context: &JsonValue) -> bool {
        match self {
            Self::Always => true,
            Self::FieldPresent { path } => lookup(context, path).is_some(),
            Self::FieldEquals { path, value } => lookup(context, path) == Some(value),
            Self::FieldAtLeast {
                path,
                threshold,
                missing,
            } => match lookup(context, path) {
                Some(v) => v.as_f64().is_some_and(|n| n >= *threshold),
                None => missing.is_some_and(|n| n >= *threshold),
            },
            Self::FieldBelow { path, threshold } => lookup(context, path)
                .and_then(JsonValue::as_f64)
                .is_some_and(|n| n < *threshold),
            Self::FieldIsNumber { path } => lookup(context, path).is_some_and(JsonValue::is_number),
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(context)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(context)),
            Self::Not { condition } => !condition.evaluate(context),
        }
    }

    /// Breaks the condition into the leaves of its top-level conjunction and
    /// evaluates each. `Any` and `Not` subtrees are reported as one leaf.
    #[must_use]
    pub fn check(&self, context: &JsonValue) -> Vec<RequirementCheck> {
        match self {
            Self::Always => Vec::new(),
            Self::All { conditions } => conditions.iter().flat_map(|c| c.check(context)).collect(),
            leaf => vec![RequirementCheck {
                description: leaf.to_string(),
                met: leaf.evaluate(context),
            }],
        }
    }

    /// Returns the descriptions of the leaves that do not hold.
    #[must_use]
    pub fn unmet(&self, context: &JsonValue) -> Vec<String> {
        self.check(context)
            .into_iter()
            .filter(|check| !check.met)
            .map(|check| check.description)
            .collect()
    }
}

impl fmt::Display for GuardCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::FieldPresent { path } => write!(f, "{path} is present"),
            Self::FieldEquals { path, value } => write!(f, "{path} equals {value}"),
            Self::FieldAtLeast {
                path, threshold, ..
            } => write!(f, "{path} >= {threshold}"),
            Self::FieldBelow { path, threshold } => write!(f, "{path} < {threshold}"),
            Self::FieldIsNumber { path } => write!(f, "{path} is a number"),
            Self::All { conditions } => write_joined(f, conditions, " and "),
            Self::Any { conditions } => write_joined(f, conditions, " or "),
            Self::Not { condition } => write!(f, "not ({condition})"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, conditions: &[GuardCondition], separator: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, condition) in conditions.iter().enumerate() {
        if i > 0 {
            write!(f, "{separator}")?;
        }
        write!(f, "{condition}")?;
    }
    write!(f, ")")
}

/// Resolves a dot path. Null values count as missing.
fn lookup<'a>(context: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = context;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    (!current.is_null()).then_some(current)
}

/// Builds the evaluation context for an entity and the agent results
/// collected so far.
#[must_use]
pub fn evaluation_context(entity: &JsonValue, agents: &serde_json::Map<String, JsonValue>) -> JsonValue {
    serde_json::json!({
        "entity": entity,
        "agents": agents,
    })
}
