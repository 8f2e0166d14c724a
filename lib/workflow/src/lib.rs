//! State machines and their execution for dealflow.
//!
//! This crate provides:
//!
//! - **Registry**: immutable Lead, Assessment and Deal state machines as petgraph graphs
//! - **Conditions**: guard predicates over entity data and agent results
//! - **Instances**: per-entity execution state with append-only history
//! - **Store**: instance persistence with leases and optimistic versioning
//! - **Executor**: the single-step driver that fires transitions
//! - **Availability**: met and unmet requirements of outgoing transitions
//! - **Events**: lifecycle notifications, in-process or on NATS JetStream

pub mod availability;
pub mod builtin;
pub mod condition;
pub mod definition;
pub mod entity;
pub mod envelope;
pub mod error;
pub mod event;
pub mod executor;
pub mod instance;
pub mod nats;
pub mod registry;
pub mod store;

pub use availability::TransitionReport;
pub use builtin::{RegistrySettings, Thresholds};
pub use condition::{GuardCondition, RequirementCheck};
pub use definition::{
    AgentRequirement, OverdueSeverity, StageDuration, State, StepTimeouts, Transition,
    TransitionTrigger, WorkflowDefinition,
};
pub use entity::{EntityRepository, EntityType, InMemoryEntityRepository, ParseEntityTypeError};
pub use envelope::Envelope;
pub use error::{
    DefinitionError, ErrorKind, EventSinkError, RepositoryError, StepError, StoreError,
};
pub use event::{BroadcastEventSink, EventSink, LifecycleEvent};
pub use executor::{Executor, ExecutorConfig, StepOutcome};
pub use instance::{
    AgentInvocationRef, InstanceError, InstanceStatus, SideEffectRef, StateTransitionRecord,
    StepTrigger, WorkflowInstance,
};
pub use nats::{NatsConfig, NatsEventSink};
pub use registry::WorkflowRegistry;
pub use store::{InMemoryInstanceStore, InstanceStore, Lease};
