//! Error types for the scheduler crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `SchedulerError`: failures of the scheduler itself, never of a step

use std::fmt;

/// Errors from scheduler operations.
///
/// Step failures are not reported here. They are recorded on the instance
/// by the executor or retried by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// `spawn` was called on a scheduler that is already running.
    AlreadyRunning,
    /// The scheduler has been shut down and accepts no more work.
    ShutDown,
    /// Listing instances for recovery failed.
    RecoveryFailed { reason: String },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "scheduler is already running"),
            Self::ShutDown => write!(f, "scheduler has been shut down"),
            Self::RecoveryFailed { reason } => {
                write!(f, "instance recovery failed: {reason}")
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_error_display() {
        assert_eq!(
            SchedulerError::AlreadyRunning.to_string(),
            "scheduler is already running"
        );
        let err = SchedulerError::RecoveryFailed {
            reason: "store unavailable".to_string(),
        };
        assert!(err.to_string().contains("store unavailable"));
    }
}
