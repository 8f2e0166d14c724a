//! Guard error types.

use crate::budget::ResourceKind;
use std::fmt;
use std::time::Duration;

/// Errors returned by the [`Guard`](crate::Guard).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    /// The scope is not granted. Never retried.
    PermissionDenied { scope: String },
    /// The budget has no room right now. Callers back off and try again.
    ResourceExhausted {
        resource: ResourceKind,
        /// Time until the budget is expected to have room, when known.
        retry_after: Option<Duration>,
    },
    /// The demand can never be satisfied because it is larger than the limit.
    DemandExceedsLimit {
        resource: ResourceKind,
        requested: u64,
        limit: u64,
    },
}

impl GuardError {
    /// Returns true if waiting may make the request succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied { scope } => {
                write!(f, "permission '{scope}' is not granted")
            }
            Self::ResourceExhausted {
                resource,
                retry_after: Some(after),
            } => {
                write!(
                    f,
                    "{resource} budget exhausted, retry in {}ms",
                    after.as_millis()
                )
            }
            Self::ResourceExhausted {
                resource,
                retry_after: None,
            } => {
                write!(f, "{resource} budget exhausted")
            }
            Self::DemandExceedsLimit {
                resource,
                requested,
                limit,
            } => {
                write!(
                    f,
                    "{resource} demand of {requested} exceeds the configured limit of {limit}"
                )
            }
        }
    }
}

impl std::error::Error for GuardError {}
