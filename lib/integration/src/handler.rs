//! Side-effect handler trait.
//!
//! Notification, CRM and file-upload services implement this trait. Every
//! request carries the task's idempotency key; receivers must treat a
//! repeated key as already applied.

use crate::credential::CrmCredential;
use crate::error::HandlerError;
use crate::side_effect::SideEffectKind;
use async_trait::async_trait;
use dealflow_core::{IdempotencyKey, WorkflowInstanceId};
use serde_json::Value as JsonValue;

/// One attempt of one side-effect task.
#[derive(Debug, Clone)]
pub struct SideEffectRequest {
    pub kind: SideEffectKind,
    pub label: String,
    pub instance_id: WorkflowInstanceId,
    pub payload: JsonValue,
    pub idempotency_key: IdempotencyKey,
    pub attempt: u32,
    /// Present for `crm_sync` requests only.
    pub credential: Option<CrmCredential>,
}

/// Executes side effects of one kind.
#[async_trait]
pub trait SideEffectHandler: Send + Sync {
    fn kind(&self) -> SideEffectKind;

    /// Performs the side effect once.
    ///
    /// # Errors
    ///
    /// Returns an error if the receiving service fails. Non-retryable
    /// errors end the task immediately.
    async fn execute(&self, request: &SideEffectRequest) -> Result<(), HandlerError>;
}
