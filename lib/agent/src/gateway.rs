//! The agent invocation gateway.

use crate::agent::{Agent, AgentRequest};
use crate::error::{AgentCallError, GatewayError, InvocationError};
use crate::invocation::{
    AgentInvocation, AgentOutcome, InvocationRequest, InvocationStatus, ResultDisposition,
};
use chrono::Utc;
use dealflow_core::{IdempotencyKey, WakeSource, Wakeup, WorkflowInstanceId};
use dealflow_guard::{Guard, GuardError, GuardRequest, ResourceDemand};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, instrument, warn};

/// Delay used when the guard reports exhaustion without a hint.
const DEFAULT_BACKPRESSURE: Duration = Duration::from_millis(100);

/// Runs agent invocations with timeout, retry and idempotency.
///
/// Cloning is cheap; clones share the ledger.
#[derive(Clone)]
pub struct AgentGateway {
    agents: Arc<HashMap<String, Arc<dyn Agent>>>,
    guard: Guard,
    ledger: Arc<RwLock<HashMap<IdempotencyKey, AgentInvocation>>>,
    wakeups: Option<mpsc::UnboundedSender<Wakeup>>,
}

impl std::fmt::Debug for AgentGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentGateway")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

enum AttemptResult {
    Settled,
    Retry { reason: String, timed_out: bool },
}

impl AgentGateway {
    /// Creates a new gateway without agents.
    #[must_use]
    pub fn new(guard: Guard) -> Self {
        Self {
            agents: Arc::new(HashMap::new()),
            guard,
            ledger: Arc::new(RwLock::new(HashMap::new())),
            wakeups: None,
        }
    }

    /// Registers an agent under its own name, replacing any previous one.
    #[must_use]
    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        Arc::make_mut(&mut self.agents).insert(agent.name().to_string(), agent);
        self
    }

    /// Sends a wakeup on this channel whenever an invocation settles.
    #[must_use]
    pub fn with_wakeups(mut self, wakeups: mpsc::UnboundedSender<Wakeup>) -> Self {
        self.wakeups = Some(wakeups);
        self
    }

    /// Returns true if an agent is registered under `name`.
    #[must_use]
    pub fn has_agent(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Starts an invocation and returns without waiting for it.
    ///
    /// If the key is already in the ledger the recorded invocation is
    /// returned as-is and nothing new is started.
    ///
    /// # Errors
    ///
    /// Returns `UnknownAgent` if no agent is registered under the name.
    #[instrument(skip(self, request), fields(agent = %request.agent_name, instance_id = %request.instance_id, key = %request.idempotency_key))]
    pub async fn invoke(&self, request: InvocationRequest) -> Result<AgentInvocation, GatewayError> {
        let agent = self
            .agents
            .get(&request.agent_name)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownAgent {
                agent: request.agent_name.clone(),
            })?;

        let invocation = {
            let mut ledger = self.ledger.write().await;
            if let Some(existing) = ledger.get(&request.idempotency_key) {
                debug!(status = %existing.status, "invocation already recorded");
                return Ok(existing.clone());
            }
            let invocation = AgentInvocation::pending(&request);
            ledger.insert(request.idempotency_key.clone(), invocation.clone());
            invocation
        };

        let gateway = self.clone();
        tokio::spawn(async move {
            gateway.run(agent, request).await;
        });

        Ok(invocation)
    }

    /// Returns the recorded invocation for a key.
    pub async fn get(&self, key: &IdempotencyKey) -> Option<AgentInvocation> {
        self.ledger.read().await.get(key).cloned()
    }

    /// Returns every invocation recorded for an instance.
    pub async fn list_for_instance(&self, instance_id: WorkflowInstanceId) -> Vec<AgentInvocation> {
        let mut invocations: Vec<_> = self
            .ledger
            .read()
            .await
            .values()
            .filter(|inv| inv.instance_id == instance_id)
            .cloned()
            .collect();
        invocations.sort_by_key(|inv| inv.created_at);
        invocations
    }

    /// Accepts a result that arrived out of band.
    ///
    /// The first terminal write for a key wins. Results for invocations that
    /// already settled or were cancelled are accepted and discarded.
    ///
    /// # Errors
    ///
    /// Returns `UnknownInvocation` if the key was never invoked.
    #[instrument(skip(self, outcome), fields(key = %key))]
    pub async fn record_result(
        &self,
        key: &IdempotencyKey,
        outcome: AgentOutcome,
    ) -> Result<ResultDisposition, GatewayError> {
        if !self.ledger.read().await.contains_key(key) {
            return Err(GatewayError::UnknownInvocation { key: key.clone() });
        }
        Ok(self.settle(key, outcome).await)
    }

    /// Marks every unsettled invocation of an instance as cancelled.
    ///
    /// Running agent calls are not aborted; whatever they return later is
    /// discarded. Returns the number of invocations cancelled.
    #[instrument(skip(self))]
    pub async fn cancel_instance(&self, instance_id: WorkflowInstanceId) -> usize {
        let mut ledger = self.ledger.write().await;
        let mut cancelled = 0;
        for invocation in ledger
            .values_mut()
            .filter(|inv| inv.instance_id == instance_id && !inv.is_terminal())
        {
            invocation.status = InvocationStatus::Cancelled;
            invocation.next_retry_at = None;
            invocation.touch();
            cancelled += 1;
        }
        if cancelled > 0 {
            info!(cancelled, "cancelled outstanding agent invocations");
        }
        cancelled
    }

    /// Drops every ledger entry of an instance that reached a terminal
    /// status. Results arriving later for those keys are unknown.
    #[instrument(skip(self))]
    pub async fn forget_instance(&self, instance_id: WorkflowInstanceId) -> usize {
        let mut ledger = self.ledger.write().await;
        let before = ledger.len();
        ledger.retain(|_, inv| inv.instance_id != instance_id);
        let removed = before - ledger.len();
        if removed > 0 {
            debug!(removed, "pruned invocation ledger");
        }
        removed
    }

    async fn run(&self, agent: Arc<dyn Agent>, request: InvocationRequest) {
        let key = request.idempotency_key.clone();
        let mut attempt = 0;

        loop {
            if self.is_settled(&key).await {
                return;
            }

            if let Err(err) = self.guard.check_permission(&request.permission_scope) {
                warn!(error = %err, agent = %request.agent_name, "agent invocation not permitted");
                self.settle(
                    &key,
                    AgentOutcome::Failed(InvocationError::PermissionDenied {
                        scope: request.permission_scope.clone(),
                    }),
                )
                .await;
                return;
            }

            let guard_request = GuardRequest {
                scopes: Vec::new(),
                demands: request
                    .demands
                    .iter()
                    .copied()
                    .chain(std::iter::once(ResourceDemand::api_call()))
                    .collect(),
            };
            let permit = match self.guard.authorize(&guard_request) {
                Ok(permit) => permit,
                Err(GuardError::ResourceExhausted { retry_after, .. }) => {
                    // Backpressure does not consume an attempt.
                    tokio::time::sleep(retry_after.unwrap_or(DEFAULT_BACKPRESSURE)).await;
                    continue;
                }
                Err(err) => {
                    self.settle(
                        &key,
                        AgentOutcome::Failed(InvocationError::ResourceUnavailable {
                            reason: err.to_string(),
                        }),
                    )
                    .await;
                    return;
                }
            };

            attempt += 1;
            if !self.mark_running(&key, attempt).await {
                return;
            }

            let agent_request = AgentRequest {
                agent_name: request.agent_name.clone(),
                instance_id: request.instance_id,
                payload: request.payload.clone(),
                idempotency_key: key.clone(),
                attempt,
            };
            let call = tokio::time::timeout(request.timeout, agent.invoke(&agent_request)).await;
            drop(permit);

            let result = match call {
                Ok(result) => result,
                Err(_) => Err(AgentCallError::Timeout),
            };

            match self.handle_attempt(&request, attempt, result).await {
                AttemptResult::Settled => return,
                AttemptResult::Retry { reason, timed_out } => {
                    if !request.retry.allows_retry(attempt) {
                        self.settle(
                            &key,
                            AgentOutcome::Failed(InvocationError::Exhausted {
                                agent: request.agent_name.clone(),
                                attempts: attempt,
                                last_error: reason,
                            }),
                        )
                        .await;
                        return;
                    }

                    let delay = request.retry.backoff_for(attempt);
                    if !self.schedule_retry(&key, timed_out, &reason, delay).await {
                        return;
                    }
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying agent invocation");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn handle_attempt(
        &self,
        request: &InvocationRequest,
        attempt: u32,
        result: Result<JsonValue, AgentCallError>,
    ) -> AttemptResult {
        match result {
            Ok(value) => {
                self.settle(&request.idempotency_key, AgentOutcome::Succeeded(value))
                    .await;
                AttemptResult::Settled
            }
            Err(err) if !err.is_retryable() => {
                warn!(error = %err, attempt, "agent rejected invocation");
                self.settle(
                    &request.idempotency_key,
                    AgentOutcome::Failed(InvocationError::Rejected {
                        agent: request.agent_name.clone(),
                        reason: err.to_string(),
                    }),
                )
                .await;
                AttemptResult::Settled
            }
            Err(err) => AttemptResult::Retry {
                timed_out: err == AgentCallError::Timeout,
                reason: err.to_string(),
            },
        }
    }

    async fn is_settled(&self, key: &IdempotencyKey) -> bool {
        self.ledger
            .read()
            .await
            .get(key)
            .is_none_or(AgentInvocation::is_terminal)
    }

    async fn mark_running(&self, key: &IdempotencyKey, attempt: u32) -> bool {
        let mut ledger = self.ledger.write().await;
        match ledger.get_mut(key) {
            Some(invocation) if !invocation.is_terminal() => {
                invocation.status = InvocationStatus::Running;
                invocation.attempt_count = attempt;
                invocation.next_retry_at = None;
                invocation.touch();
                true
            }
            _ => false,
        }
    }

    async fn schedule_retry(
        &self,
        key: &IdempotencyKey,
        timed_out: bool,
        reason: &str,
        delay: Duration,
    ) -> bool {
        let mut ledger = self.ledger.write().await;
        match ledger.get_mut(key) {
            Some(invocation) if !invocation.is_terminal() => {
                invocation.status = if timed_out {
                    InvocationStatus::TimedOut
                } else {
                    InvocationStatus::Failed
                };
                let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                invocation.next_retry_at = Some(Utc::now() + delay);
                invocation.touch();
                debug!(attempt = invocation.attempt_count, %reason, "agent attempt failed");
                true
            }
            _ => false,
        }
    }

    async fn settle(&self, key: &IdempotencyKey, outcome: AgentOutcome) -> ResultDisposition {
        let settled = {
            let mut ledger = self.ledger.write().await;
            let Some(invocation) = ledger.get_mut(key) else {
                return ResultDisposition::Discarded;
            };
            if invocation.is_terminal() {
                debug!(status = %invocation.status, "discarding result for settled invocation");
                return ResultDisposition::Discarded;
            }

            invocation.next_retry_at = None;
            match outcome {
                AgentOutcome::Succeeded(value) => {
                    invocation.status = InvocationStatus::Succeeded;
                    invocation.result = Some(value);
                    invocation.last_error = None;
                    info!(agent = %invocation.agent_name, attempts = invocation.attempt_count, "agent invocation succeeded");
                }
                AgentOutcome::Failed(err) => {
                    invocation.status = InvocationStatus::Failed;
                    warn!(agent = %invocation.agent_name, error = %err, "agent invocation failed");
                    invocation.last_error = Some(err);
                }
            }
            invocation.touch();
            invocation.instance_id
        };

        if let Some(wakeups) = &self.wakeups
            && wakeups
                .send(Wakeup::new(settled, WakeSource::Agent(key.clone())))
                .is_err()
        {
            debug!("wakeup receiver dropped");
        }
        ResultDisposition::Applied
    }
}
