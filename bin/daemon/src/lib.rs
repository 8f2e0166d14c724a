//! The dealflow daemon.
//!
//! Runs a [`WorkflowEngine`](dealflow_engine::WorkflowEngine) with
//! HTTP-backed agents, side-effect handlers and entity store, publishes
//! lifecycle events to NATS JetStream and takes control requests over NATS.

pub mod config;
pub mod control;
pub mod error;
pub mod http;

pub use config::DaemonConfig;
pub use control::{ControlHandler, ControlOperation, ControlReply, ControlServer};
pub use error::DaemonError;
