//! Side-effect kinds, specs and tasks.

use chrono::{DateTime, Utc};
use dealflow_core::{IdempotencyKey, SideEffectTaskId, WorkflowInstanceId};
use dealflow_guard::{ResourceDemand, scopes};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The kinds of side effect a transition may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectKind {
    Notification,
    CrmSync,
    FileUpload,
}

impl SideEffectKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notification => "notification",
            Self::CrmSync => "crm_sync",
            Self::FileUpload => "file_upload",
        }
    }

    /// The scope a task of this kind is checked against.
    #[must_use]
    pub fn permission_scope(&self) -> &'static str {
        match self {
            Self::Notification => scopes::NOTIFICATION_SEND,
            Self::CrmSync => scopes::CRM_SYNC,
            Self::FileUpload => scopes::FILE_UPLOAD,
        }
    }
}

impl fmt::Display for SideEffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A side effect as declared on a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffectSpec {
    pub kind: SideEffectKind,
    /// Distinguishes several effects of the same kind on one transition.
    pub label: String,
    /// A failed required effect fails the step.
    pub required: bool,
    /// Static fields merged into the task payload.
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default)]
    pub demands: Vec<ResourceDemand>,
}

impl SideEffectSpec {
    /// An optional effect with an empty payload.
    #[must_use]
    pub fn new(kind: SideEffectKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            required: false,
            payload: JsonValue::Object(Default::default()),
            demands: Vec::new(),
        }
    }

    /// A notification rendered from `template`.
    #[must_use]
    pub fn notification(template: &str) -> Self {
        Self::new(SideEffectKind::Notification, "notification")
            .with_payload(serde_json::json!({ "template": template }))
    }

    /// A CRM sync of `object`.
    #[must_use]
    pub fn crm_sync(object: &str) -> Self {
        Self::new(SideEffectKind::CrmSync, "crm_sync")
            .with_payload(serde_json::json!({ "object": object }))
    }

    /// Marks the effect as required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Replaces the static payload.
    #[must_use]
    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    /// Adds a resource demand acquired before the handler runs.
    #[must_use]
    pub fn with_demand(mut self, demand: ResourceDemand) -> Self {
        self.demands.push(demand);
        self
    }
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Not executed because the kind is disabled (no CRM credential).
    Skipped,
    Cancelled,
}

impl SideEffectStatus {
    /// True once the task will not run again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for SideEffectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One execution of a declared side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffectTask {
    pub id: SideEffectTaskId,
    pub instance_id: WorkflowInstanceId,
    pub kind: SideEffectKind,
    pub label: String,
    pub payload: JsonValue,
    pub permission_scope: String,
    pub status: SideEffectStatus,
    pub idempotency_key: IdempotencyKey,
    pub attempt_count: u32,
    pub required: bool,
    pub demands: Vec<ResourceDemand>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SideEffectTask {
    /// Creates a pending task for `spec` with the given payload.
    #[must_use]
    pub fn new(
        instance_id: WorkflowInstanceId,
        spec: &SideEffectSpec,
        payload: JsonValue,
        idempotency_key: IdempotencyKey,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SideEffectTaskId::new(),
            instance_id,
            kind: spec.kind,
            label: spec.label.clone(),
            payload,
            permission_scope: spec.kind.permission_scope().to_string(),
            status: SideEffectStatus::Pending,
            idempotency_key,
            attempt_count: 0,
            required: spec.required,
            demands: spec.demands.clone(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn set_status(&mut self, status: SideEffectStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_builtin_scopes() {
        assert_eq!(
            SideEffectKind::Notification.permission_scope(),
            "notification:send"
        );
        assert_eq!(SideEffectKind::CrmSync.permission_scope(), "crm:sync");
        assert_eq!(SideEffectKind::FileUpload.permission_scope(), "file:upload");
    }

    #[test]
    fn task_inherits_spec_flags() {
        let spec = SideEffectSpec::new(SideEffectKind::FileUpload, "closing_pack").required();
        let task = SideEffectTask::new(
            WorkflowInstanceId::new(),
            &spec,
            serde_json::json!({}),
            IdempotencyKey::from_raw("k#closing_pack"),
        );
        assert!(task.required);
        assert_eq!(task.permission_scope, "file:upload");
        assert_eq!(task.status, SideEffectStatus::Pending);
        assert!(!task.status.is_terminal());
    }
}
