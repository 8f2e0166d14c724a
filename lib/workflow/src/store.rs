//! Instance persistence with leases and optimistic versioning.
//!
//! Steps of one instance are serialized by a time-bounded lease. A crashed
//! worker's lease simply expires and the next worker reclaims it. A live
//! worker renews its lease before slow work. Commits
//! are additionally guarded by the instance version so that writers without
//! a lease (cancellation) and writers with a stale read never overwrite a
//! newer state.

use crate::entity::EntityType;
use crate::error::StoreError;
use crate::instance::WorkflowInstance;
use async_trait::async_trait;
use dealflow_core::WorkflowInstanceId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;
use ulid::Ulid;

/// A time-bounded exclusive claim on an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub instance_id: WorkflowInstanceId,
    pub token: Ulid,
    pub expires_at: Instant,
}

impl Lease {
    /// Returns true once the lease's deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Storage for workflow instances.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Stores a new instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is taken or the entity already has an
    /// instance that has not reached a terminal status.
    async fn insert(&self, instance: WorkflowInstance) -> Result<(), StoreError>;

    /// Loads an instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    async fn get(&self, id: WorkflowInstanceId) -> Result<Option<WorkflowInstance>, StoreError>;

    /// Lists all instances.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    async fn list(&self) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// Finds the non-terminal instance for an entity, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    async fn find_active_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<WorkflowInstance>, StoreError>;

    /// Claims an instance for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns `LeaseHeld` if another unexpired lease exists and `NotFound`
    /// for unknown instances.
    async fn acquire_lease(
        &self,
        id: WorkflowInstanceId,
        ttl: Duration,
    ) -> Result<Lease, StoreError>;

    /// Pushes the expiry of a held lease to `ttl` from now.
    ///
    /// # Errors
    ///
    /// Returns `LeaseLost` if the lease expired or was taken over.
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StoreError>;

    /// Writes `instance` if the stored version equals `expected_version`,
    /// setting its version to `expected_version + 1`.
    ///
    /// With a lease, the lease must still be the current, unexpired one as
    /// last renewed.
    ///
    /// # Errors
    ///
    /// Returns `VersionConflict` on a stale version and `LeaseLost` if the
    /// lease expired or was taken over.
    async fn commit(
        &self,
        lease: Option<&Lease>,
        expected_version: u64,
        instance: WorkflowInstance,
    ) -> Result<WorkflowInstance, StoreError>;

    /// Gives up a lease. Releasing a lease that was already taken over is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    async fn release(&self, lease: &Lease) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct StoreState {
    instances: HashMap<WorkflowInstanceId, WorkflowInstance>,
    leases: HashMap<WorkflowInstanceId, Lease>,
}

/// An in-memory instance store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInstanceStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryInstanceStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn insert(&self, instance: WorkflowInstance) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.instances.contains_key(&instance.id) {
            return Err(StoreError::AlreadyExists {
                instance_id: instance.id,
            });
        }
        if let Some(active) = state.instances.values().find(|i| {
            i.entity_type == instance.entity_type
                && i.entity_id == instance.entity_id
                && !i.is_terminal()
        }) {
            return Err(StoreError::ActiveInstanceExists {
                entity_id: instance.entity_id.clone(),
                instance_id: active.id,
            });
        }
        state.instances.insert(instance.id, instance);
        Ok(())
    }

    async fn get(&self, id: WorkflowInstanceId) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self.lock().instances.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<WorkflowInstance>, StoreError> {
        let mut instances: Vec<_> = self.lock().instances.values().cloned().collect();
        instances.sort_by_key(|i| i.id);
        Ok(instances)
    }

    async fn find_active_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self
            .lock()
            .instances
            .values()
            .find(|i| i.entity_type == entity_type && i.entity_id == entity_id && !i.is_terminal())
            .cloned())
    }

    async fn acquire_lease(
        &self,
        id: WorkflowInstanceId,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        let mut state = self.lock();
        if !state.instances.contains_key(&id) {
            return Err(StoreError::NotFound { instance_id: id });
        }
        if let Some(current) = state.leases.get(&id) {
            if !current.is_expired() {
                return Err(StoreError::LeaseHeld { instance_id: id });
            }
            debug!(instance_id = %id, "reclaiming expired lease");
        }
        let lease = Lease {
            instance_id: id,
            token: Ulid::new(),
            expires_at: Instant::now() + ttl,
        };
        state.leases.insert(id, lease.clone());
        Ok(lease)
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StoreError> {
        let mut state = self.lock();
        match state.leases.get_mut(&lease.instance_id) {
            Some(current) if current.token == lease.token && !current.is_expired() => {
                current.expires_at = Instant::now() + ttl;
                Ok(current.clone())
            }
            _ => Err(StoreError::LeaseLost {
                instance_id: lease.instance_id,
            }),
        }
    }

    async fn commit(
        &self,
        lease: Option<&Lease>,
        expected_version: u64,
        mut instance: WorkflowInstance,
    ) -> Result<WorkflowInstance, StoreError> {
        let mut state = self.lock();
        let id = instance.id;
        if let Some(lease) = lease {
            let current = state.leases.get(&id);
            if current.is_none_or(|c| c.token != lease.token || c.is_expired()) {
                return Err(StoreError::LeaseLost { instance_id: id });
            }
        }
        let stored = state
            .instances
            .get_mut(&id)
            .ok_or(StoreError::NotFound { instance_id: id })?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                instance_id: id,
                expected: expected_version,
                actual: stored.version,
            });
        }
        instance.version = expected_version + 1;
        *stored = instance.clone();
        Ok(instance)
    }

    async fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state
            .leases
            .get(&lease.instance_id)
            .is_some_and(|c| c.token == lease.token)
        {
            state.leases.remove(&lease.instance_id);
        }
        Ok(())
    }
}
