//! Agent invocation gateway for dealflow.
//!
//! Agents are opaque external computations (lead scorers, assessment
//! evaluators, deal screeners). The engine never calls them directly: every
//! call goes through the [`AgentGateway`], which
//!
//! - returns immediately with a `Pending` [`AgentInvocation`],
//! - runs attempts on a background task with a timeout and backoff,
//! - deduplicates calls by idempotency key, and
//! - signals the scheduler with a wakeup once the invocation settles.

pub mod agent;
pub mod error;
pub mod gateway;
pub mod invocation;

pub use agent::{Agent, AgentRequest};
pub use error::{AgentCallError, GatewayError, InvocationError};
pub use gateway::AgentGateway;
pub use invocation::{
    AgentInvocation, AgentOutcome, InvocationRequest, InvocationStatus, ResultDisposition,
};
