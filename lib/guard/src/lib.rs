//! Permission and resource guard for dealflow.
//!
//! Every agent call and side effect passes through the [`Guard`] before it is
//! dispatched. The guard answers two questions:
//!
//! - is the declared permission scope granted to this deployment, and
//! - is there room left in the resource budgets it draws from.
//!
//! Grants and limits are loaded once at start-up and never change. Budget
//! counters are the only mutable state and are updated atomically.

mod budget;
mod error;
mod guard;
mod permission;

pub use budget::{
    ApiRateLimit, BudgetSnapshot, ResourceDemand, ResourceKind, ResourceLimits, ResourcePermit,
    ResourceUsage,
};
pub use error::GuardError;
pub use guard::{Guard, GuardPermit, GuardRequest};
pub use permission::{PermissionGrants, scopes};
