//! Strongly-typed identifiers for engine-owned records.
//!
//! Host entities (leads, assessments, deals) keep their own identifiers; the
//! engine only mints ids for the records it owns. All of them are ULIDs, so
//! they sort by creation time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Macro to generate a strongly-typed ID wrapper around ULID.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Creates a new ID with a randomly generated ULID.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Creates an ID from a ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the prefix used for display formatting.
            #[must_use]
            pub const fn prefix() -> &'static str {
                $prefix
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ulid::from_str(raw).map(Self).map_err(|e| ParseIdError {
                    id_type: stringify!($name),
                    reason: e.to_string(),
                })
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }

        impl From<$name> for Ulid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Unique identifier for a workflow instance (one entity's run through its state machine).
    WorkflowInstanceId,
    "wfi"
);

define_id!(
    /// Unique identifier for a single agent invocation record.
    AgentInvocationId,
    "agi"
);

define_id!(
    /// Unique identifier for a side-effect task.
    SideEffectTaskId,
    "sfx"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_display_format() {
        let id = WorkflowInstanceId::new();
        assert!(id.to_string().starts_with("wfi_"));
    }

    #[test]
    fn invocation_and_task_prefixes() {
        assert!(AgentInvocationId::new().to_string().starts_with("agi_"));
        assert!(SideEffectTaskId::new().to_string().starts_with("sfx_"));
    }

    #[test]
    fn parse_with_prefix() {
        let id = WorkflowInstanceId::new();
        let parsed: WorkflowInstanceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_without_prefix() {
        let ulid = Ulid::new();
        let id: SideEffectTaskId = ulid.to_string().parse().unwrap();
        assert_eq!(id.as_ulid(), ulid);
    }

    #[test]
    fn parse_invalid_ulid() {
        let err = "wfi_not-a-ulid"
            .parse::<WorkflowInstanceId>()
            .unwrap_err();
        assert_eq!(err.id_type, "WorkflowInstanceId");
    }

    #[test]
    fn ids_are_ordered_by_creation() {
        let first = WorkflowInstanceId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = WorkflowInstanceId::new();
        assert!(first < second);
    }

    #[test]
    fn id_serde_is_transparent() {
        let id = AgentInvocationId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_ulid()));
        let parsed: AgentInvocationId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
