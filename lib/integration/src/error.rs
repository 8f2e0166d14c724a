//! Error types for the integration crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `HandlerError`: a single call to a side-effect handler
//! - `DispatchError`: why the dispatcher could not run a task

use crate::side_effect::SideEffectKind;
use dealflow_guard::ResourceKind;
use std::fmt;
use std::time::Duration;

/// Errors from side-effect handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Connection to the service failed.
    ConnectionFailed { reason: String },
    /// The service rejected our credentials.
    AuthenticationFailed { reason: String },
    /// The service refused the payload. Retrying cannot help.
    Rejected { reason: String },
    /// The service returned an error.
    Failed { reason: String },
    /// Timeout waiting for response.
    Timeout,
}

impl HandlerError {
    /// Returns true if another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Rejected { .. } | Self::AuthenticationFailed { .. }
        )
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { reason } => {
                write!(f, "connection failed: {reason}")
            }
            Self::AuthenticationFailed { reason } => {
                write!(f, "authentication failed: {reason}")
            }
            Self::Rejected { reason } => {
                write!(f, "request rejected: {reason}")
            }
            Self::Failed { reason } => {
                write!(f, "service error: {reason}")
            }
            Self::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Errors from [`Dispatcher::dispatch`](crate::Dispatcher::dispatch).
///
/// Handler failures are not errors here: they are recorded on the returned
/// task as `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The task's scope is not granted. Fatal to the step.
    PermissionDenied { scope: String },
    /// A budget is exhausted. The task stays pending and may be dispatched again.
    ResourceExhausted {
        resource: ResourceKind,
        retry_after: Option<Duration>,
    },
    /// No handler is registered for the kind.
    NoHandler { kind: SideEffectKind },
}

impl DispatchError {
    /// Returns true if dispatching again later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied { scope } => {
                write!(f, "permission '{scope}' is not granted")
            }
            Self::ResourceExhausted {
                resource,
                retry_after,
            } => match retry_after {
                Some(after) => write!(
                    f,
                    "{resource} budget exhausted, retry in {}ms",
                    after.as_millis()
                ),
                None => write!(f, "{resource} budget exhausted"),
            },
            Self::NoHandler { kind } => {
                write!(f, "no handler registered for {kind} side effects")
            }
        }
    }
}

impl std::error::Error for DispatchError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_display() {
        let err = HandlerError::ConnectionFailed {
            reason: "host unreachable".to_string(),
        };
        assert!(err.to_string().contains("connection failed"));
        assert!(err.to_string().contains("host unreachable"));
    }

    #[test]
    fn auth_failures_are_not_retried() {
        assert!(HandlerError::Timeout.is_retryable());
        assert!(
            !HandlerError::AuthenticationFailed {
                reason: "401".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn exhaustion_display_includes_hint() {
        let err = DispatchError::ResourceExhausted {
            resource: ResourceKind::ApiRate,
            retry_after: Some(Duration::from_millis(250)),
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("api_rate"));
        assert!(err.to_string().contains("250ms"));
    }
}
