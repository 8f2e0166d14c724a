//! Lifecycle events emitted to the host.

use crate::definition::OverdueSeverity;
use crate::entity::EntityType;
use crate::envelope::Envelope;
use crate::error::EventSinkError;
use crate::instance::InstanceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealflow_core::WorkflowInstanceId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Something the host may want to react to, such as refreshing a dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StateChanged {
        instance_id: WorkflowInstanceId,
        entity_type: EntityType,
        entity_id: String,
        from_state: String,
        to_state: String,
        version: u64,
        at: DateTime<Utc>,
    },
    Completed {
        instance_id: WorkflowInstanceId,
        entity_type: EntityType,
        entity_id: String,
        final_state: String,
        at: DateTime<Utc>,
    },
    Failed {
        instance_id: WorkflowInstanceId,
        entity_type: EntityType,
        entity_id: String,
        state: String,
        error: InstanceError,
        at: DateTime<Utc>,
    },
    Cancelled {
        instance_id: WorkflowInstanceId,
        entity_type: EntityType,
        entity_id: String,
        state: String,
        at: DateTime<Utc>,
    },
    /// An instance has stayed in a state longer than its target or maximum.
    StageOverdue {
        instance_id: WorkflowInstanceId,
        entity_type: EntityType,
        entity_id: String,
        state: String,
        severity: OverdueSeverity,
        elapsed_ms: u64,
        limit_ms: u64,
        at: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    /// Returns the instance the event is about.
    #[must_use]
    pub fn instance_id(&self) -> WorkflowInstanceId {
        match self {
            Self::StateChanged { instance_id, .. }
            | Self::Completed { instance_id, .. }
            | Self::Failed { instance_id, .. }
            | Self::Cancelled { instance_id, .. }
            | Self::StageOverdue { instance_id, .. } => *instance_id,
        }
    }

    /// Returns the event's wire tag.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::StageOverdue { .. } => "stage_overdue",
        }
    }
}

/// Destination for lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publishes one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be delivered.
    async fn publish(&self, event: &Envelope<LifecycleEvent>) -> Result<(), EventSinkError>;
}

/// In-process fan-out to any number of subscribers.
///
/// Events published while nobody is subscribed are dropped. Slow
/// subscribers lag and miss events rather than blocking the engine.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<Envelope<LifecycleEvent>>,
}

impl BroadcastEventSink {
    /// Creates a sink buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns a receiver for events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope<LifecycleEvent>> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn publish(&self, event: &Envelope<LifecycleEvent>) -> Result<(), EventSinkError> {
        // send only fails when there are no receivers
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}
