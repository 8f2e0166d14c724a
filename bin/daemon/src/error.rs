//! Error types for the daemon.

use std::fmt;

/// Errors raised while wiring or serving the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonError {
    /// The HTTP client could not be constructed.
    HttpClient { reason: String },
    /// Subscribing to a control subject failed.
    Subscribe { subject: String, reason: String },
    /// A reply could not be published.
    Reply { subject: String, reason: String },
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpClient { reason } => write!(f, "failed to build HTTP client: {reason}"),
            Self::Subscribe { subject, reason } => {
                write!(f, "failed to subscribe to {subject}: {reason}")
            }
            Self::Reply { subject, reason } => {
                write!(f, "failed to reply on {subject}: {reason}")
            }
        }
    }
}

impl std::error::Error for DaemonError {}
