//! The dealflow workflow engine.
//!
//! This crate ties the workspace together:
//!
//! - **Config**: [`EngineConfig`] loaded from `DEALFLOW__*` environment variables
//! - **Builder**: [`EngineBuilder`] registers agents, side-effect handlers,
//!   the entity repository, the instance store and event sinks
//! - **Control surface**: [`WorkflowEngine`] starts, advances, cancels and
//!   reports on workflow instances
//!
//! # Example
//!
//! ```no_run
//! use dealflow_engine::{EngineConfig, WorkflowEngine};
//! use dealflow_workflow::EntityType;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = WorkflowEngine::builder(EngineConfig::from_env()?)
//!     .build()
//!     .map_err(|e| e.to_string())?;
//! let scheduler = engine.spawn().await.map_err(|e| e.to_string())?;
//! let id = engine
//!     .start("lead-42", EntityType::Lead)
//!     .await
//!     .map_err(|e| e.to_string())?;
//! println!("{:?}", engine.get_status(id).await.map_err(|e| e.to_string())?.status);
//! engine.shutdown();
//! scheduler.await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod external;

pub use config::{EngineConfig, PermissionSetting};
pub use engine::{EngineBuilder, WorkflowEngine};
pub use error::EngineError;
pub use external::ExternalEvent;
