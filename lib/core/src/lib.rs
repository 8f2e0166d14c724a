//! Core types shared by every dealflow crate.
//!
//! This crate provides identifiers, the idempotency key derivation used by
//! agent invocations and side effects, the retry/backoff policy, and the
//! wakeup notice that completion paths use to nudge the scheduler.

pub mod error;
pub mod id;
pub mod idempotency;
pub mod retry;
pub mod wake;

pub use error::Result;
pub use id::{AgentInvocationId, ParseIdError, SideEffectTaskId, WorkflowInstanceId};
pub use idempotency::IdempotencyKey;
pub use retry::RetryPolicy;
pub use wake::{WakeSource, Wakeup};
