//! Step scheduling for dealflow.
//!
//! This crate provides:
//!
//! - **Queue**: one pending step per instance, handed out round-robin
//! - **Scheduler**: a bounded worker pool that runs steps on the executor,
//!   backs off under resource pressure and requeues transient failures

pub mod error;
pub mod queue;
pub mod scheduler;

pub use error::SchedulerError;
pub use queue::StepQueue;
pub use scheduler::{Scheduler, SchedulerConfig};
