//! Side-effect dispatch for dealflow.
//!
//! This crate provides:
//!
//! - **Side-effect model**: kinds, definition-level specs and runtime tasks
//! - **Handler trait**: the contract notification, CRM and upload services implement
//! - **CRM credential**: optional credential that enables `crm_sync`
//! - **Dispatcher**: permission-gated, budgeted, idempotent execution with retries

pub mod credential;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod side_effect;

pub use credential::CrmCredential;
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, HandlerError};
pub use handler::{SideEffectHandler, SideEffectRequest};
pub use side_effect::{SideEffectKind, SideEffectSpec, SideEffectStatus, SideEffectTask};
