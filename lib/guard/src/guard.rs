//! The guard itself.

use crate::budget::{
    AcquireFailure, BudgetSnapshot, ResourceBudgets, ResourceDemand, ResourceKind, ResourceLimits,
    ResourcePermit, ResourceUsage,
};
use crate::error::GuardError;
use crate::permission::PermissionGrants;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Everything an action declares before it is dispatched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuardRequest {
    pub scopes: Vec<String>,
    pub demands: Vec<ResourceDemand>,
}

impl GuardRequest {
    /// An empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a permission scope to check.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    /// Adds a resource demand to acquire.
    #[must_use]
    pub fn with_demand(mut self, demand: ResourceDemand) -> Self {
        self.demands.push(demand);
        self
    }
}

/// All permits acquired for one authorized request.
#[derive(Debug, Default)]
#[must_use = "dropping the permit releases its resources immediately"]
pub struct GuardPermit {
    permits: Vec<ResourcePermit>,
}

impl GuardPermit {
    /// Permits held until this value is dropped.
    #[must_use]
    pub fn permits(&self) -> &[ResourcePermit] {
        &self.permits
    }
}

/// Validates permission scopes and admits work against resource budgets.
///
/// Cloning is cheap and every clone shares the same counters.
#[derive(Debug, Clone)]
pub struct Guard {
    grants: Arc<PermissionGrants>,
    budgets: Arc<ResourceBudgets>,
}

impl Guard {
    /// Creates a guard over `grants` with fresh budgets sized by `limits`.
    #[must_use]
    pub fn new(grants: PermissionGrants, limits: ResourceLimits) -> Self {
        Self {
            grants: Arc::new(grants),
            budgets: Arc::new(ResourceBudgets::new(limits)),
        }
    }

    /// A guard that grants the built-in scopes with default limits.
    #[must_use]
    pub fn permissive() -> Self {
        Self::new(PermissionGrants::builtin(), ResourceLimits::default())
    }

    /// Configured resource limits.
    #[must_use]
    pub fn limits(&self) -> &ResourceLimits {
        self.budgets.limits()
    }

    /// Checks that `scope` is granted.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` if the scope is missing or revoked.
    pub fn check_permission(&self, scope: &str) -> Result<(), GuardError> {
        if self.grants.is_granted(scope) {
            Ok(())
        } else {
            debug!(scope, "permission denied");
            Err(GuardError::PermissionDenied {
                scope: scope.to_string(),
            })
        }
    }

    /// Acquires `amount` of `resource`.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` when the budget has no room right now and
    /// `DemandExceedsLimit` when it never will.
    pub fn acquire(
        &self,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<ResourcePermit, GuardError> {
        self.budgets
            .acquire(ResourceDemand::new(resource, amount))
            .map_err(|failure| match failure {
                AcquireFailure::Exhausted(retry_after) => {
                    debug!(%resource, amount, ?retry_after, "resource budget exhausted");
                    GuardError::ResourceExhausted {
                        resource,
                        retry_after,
                    }
                }
                AcquireFailure::ExceedsLimit(limit) => GuardError::DemandExceedsLimit {
                    resource,
                    requested: amount,
                    limit,
                },
            })
    }

    /// Checks every scope, then acquires every demand.
    ///
    /// Acquisition is all-or-nothing: if one demand fails, permits already
    /// taken for earlier demands are released before returning.
    ///
    /// # Errors
    ///
    /// Returns the first permission or budget failure encountered.
    #[instrument(skip(self, request), fields(scopes = ?request.scopes))]
    pub fn authorize(&self, request: &GuardRequest) -> Result<GuardPermit, GuardError> {
        for scope in &request.scopes {
            self.check_permission(scope)?;
        }

        let mut permits = Vec::with_capacity(request.demands.len());
        for demand in &request.demands {
            permits.push(self.acquire(demand.resource, demand.amount)?);
        }
        Ok(GuardPermit { permits })
    }

    /// Current usage of every resource.
    #[must_use]
    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            resources: ResourceKind::ALL
                .iter()
                .map(|resource| ResourceUsage {
                    resource: *resource,
                    limit: self.budgets.limits().limit(*resource),
                    consumed: self.budgets.consumed(*resource),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::scopes;
    use std::time::Duration;

    #[test]
    fn denied_scope_fails_before_any_budget_is_touched() {
        let guard = Guard::new(
            PermissionGrants::builtin().with_grant(scopes::CRM_SYNC, false),
            ResourceLimits::default().with_api_rate(1, Duration::from_secs(60)),
        );
        let request = GuardRequest::new()
            .with_scope(scopes::CRM_SYNC)
            .with_demand(ResourceDemand::api_call());

        let err = guard.authorize(&request).unwrap_err();
        assert_eq!(
            err,
            GuardError::PermissionDenied {
                scope: "crm:sync".to_string()
            }
        );
        assert!(!err.is_transient());
        let usage = guard.snapshot().usage(ResourceKind::ApiRate).unwrap();
        assert_eq!(usage.consumed, 0);
    }

    #[test]
    fn partial_acquisition_is_rolled_back() {
        let guard = Guard::new(
            PermissionGrants::builtin(),
            ResourceLimits {
                memory: 100,
                storage: 10,
                ..ResourceLimits::default()
            },
        );
        let _held = guard.acquire(ResourceKind::Storage, 10).unwrap();

        let request = GuardRequest::new()
            .with_demand(ResourceDemand::new(ResourceKind::Memory, 50))
            .with_demand(ResourceDemand::new(ResourceKind::Storage, 1));
        let err = guard.authorize(&request).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            guard.snapshot().usage(ResourceKind::Memory).unwrap().consumed,
            0
        );
    }

    #[test]
    fn api_rate_exhaustion_reports_retry_hint() {
        let guard = Guard::new(
            PermissionGrants::builtin(),
            ResourceLimits::default().with_api_rate(1, Duration::from_secs(60)),
        );
        let _first = guard.acquire(ResourceKind::ApiRate, 1).unwrap();
        match guard.acquire(ResourceKind::ApiRate, 1) {
            Err(GuardError::ResourceExhausted {
                resource: ResourceKind::ApiRate,
                retry_after: Some(after),
            }) => assert!(after <= Duration::from_secs(60)),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn clones_share_counters() {
        let guard = Guard::new(
            PermissionGrants::builtin(),
            ResourceLimits::default().with_cpu(1),
        );
        let clone = guard.clone();
        let _slot = guard.acquire(ResourceKind::Cpu, 1).unwrap();
        assert!(clone.acquire(ResourceKind::Cpu, 1).is_err());
    }
}
