//! Agent invocation records.

use crate::error::InvocationError;
use chrono::{DateTime, Utc};
use dealflow_core::{AgentInvocationId, IdempotencyKey, RetryPolicy, WorkflowInstanceId};
use dealflow_guard::ResourceDemand;
use dealflow_guard::scopes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Lifecycle of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Running,
    Succeeded,
    /// The last attempt failed. Terminal unless a retry is scheduled.
    Failed,
    /// The last attempt timed out. Terminal unless a retry is scheduled.
    TimedOut,
    Cancelled,
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// What the caller asks the gateway to run.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub instance_id: WorkflowInstanceId,
    pub agent_name: String,
    pub payload: JsonValue,
    pub idempotency_key: IdempotencyKey,
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Scope checked before every attempt.
    pub permission_scope: String,
    /// Budgets drawn on for the duration of every attempt. One API call is
    /// always added.
    pub demands: Vec<ResourceDemand>,
}

impl InvocationRequest {
    /// Creates a request with the default timeout and retry policy.
    #[must_use]
    pub fn new(
        instance_id: WorkflowInstanceId,
        agent_name: impl Into<String>,
        payload: JsonValue,
        idempotency_key: IdempotencyKey,
    ) -> Self {
        Self {
            instance_id,
            agent_name: agent_name.into(),
            payload,
            idempotency_key,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            permission_scope: scopes::AGENT_INVOKE.to_string(),
            demands: Vec::new(),
        }
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry policy for failed attempts.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the scope checked before each attempt.
    #[must_use]
    pub fn with_permission_scope(mut self, scope: impl Into<String>) -> Self {
        self.permission_scope = scope.into();
        self
    }

    /// Adds resource demands acquired for each attempt.
    #[must_use]
    pub fn with_demands(mut self, demands: Vec<ResourceDemand>) -> Self {
        self.demands = demands;
        self
    }
}

/// The ledger entry for one idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub id: AgentInvocationId,
    pub instance_id: WorkflowInstanceId,
    pub agent_name: String,
    pub payload: JsonValue,
    pub status: InvocationStatus,
    pub result: Option<JsonValue>,
    pub attempt_count: u32,
    /// Set while a retry is scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub idempotency_key: IdempotencyKey,
    pub last_error: Option<InvocationError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentInvocation {
    pub(crate) fn pending(request: &InvocationRequest) -> Self {
        let now = Utc::now();
        Self {
            id: AgentInvocationId::new(),
            instance_id: request.instance_id,
            agent_name: request.agent_name.clone(),
            payload: request.payload.clone(),
            status: InvocationStatus::Pending,
            result: None,
            attempt_count: 0,
            next_retry_at: None,
            idempotency_key: request.idempotency_key.clone(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true once the invocation can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self.status {
            InvocationStatus::Succeeded | InvocationStatus::Cancelled => true,
            InvocationStatus::Failed | InvocationStatus::TimedOut => self.next_retry_at.is_none(),
            InvocationStatus::Pending | InvocationStatus::Running => false,
        }
    }

    /// True when the invocation settled with a result.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == InvocationStatus::Succeeded
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A result reported for an invocation, either by the gateway's own attempt
/// loop or out of band through the control surface.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Succeeded(JsonValue),
    Failed(InvocationError),
}

/// What happened to a reported result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDisposition {
    /// The result settled the invocation.
    Applied,
    /// The invocation had already settled or was cancelled.
    Discarded,
}
