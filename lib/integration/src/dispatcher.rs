//! The side-effect dispatcher.
//!
//! Tasks are either run to completion by the caller
//! ([`Dispatcher::dispatch`]) or admitted and then run on a background task
//! ([`Dispatcher::submit`]). Background tasks send a [`Wakeup`] when they
//! settle.

use crate::credential::CrmCredential;
use crate::error::{DispatchError, HandlerError};
use crate::handler::{SideEffectHandler, SideEffectRequest};
use crate::side_effect::{SideEffectKind, SideEffectStatus, SideEffectTask};
use dealflow_core::{IdempotencyKey, RetryPolicy, WakeSource, Wakeup, WorkflowInstanceId};
use dealflow_guard::{Guard, GuardError, GuardPermit, GuardRequest, ResourceDemand};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, instrument, warn};

/// Delay used when a retry finds a budget exhausted and the guard gives no hint.
const DEFAULT_BACKPRESSURE: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Ledger {
    tasks: HashMap<IdempotencyKey, SideEffectTask>,
    /// Keys whose handler is being driven right now.
    in_flight: HashSet<IdempotencyKey>,
}

/// The result of admitting a task.
enum Admission {
    /// Nothing to run. The task is settled or already in flight.
    Recorded(SideEffectTask),
    Run {
        task: SideEffectTask,
        handler: Arc<dyn SideEffectHandler>,
        permit: GuardPermit,
    },
}

/// Runs side-effect tasks through the guard with bounded retries.
///
/// The ledger is keyed by idempotency key: a key that already succeeded or
/// was skipped is never executed again, and a key that is in flight is
/// never executed twice at once.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<HashMap<SideEffectKind, Arc<dyn SideEffectHandler>>>,
    guard: Guard,
    crm_credential: Option<CrmCredential>,
    retry: RetryPolicy,
    timeout: Duration,
    ledger: Arc<RwLock<Ledger>>,
    wakeups: Option<mpsc::UnboundedSender<Wakeup>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("crm_credential", &self.crm_credential)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a new dispatcher without handlers.
    #[must_use]
    pub fn new(guard: Guard) -> Self {
        Self {
            handlers: Arc::new(HashMap::new()),
            guard,
            crm_credential: None,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(10),
            ledger: Arc::new(RwLock::new(Ledger::default())),
            wakeups: None,
        }
    }

    /// Registers a handler for its kind, replacing any previous one.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn SideEffectHandler>) -> Self {
        Arc::make_mut(&mut self.handlers).insert(handler.kind(), handler);
        self
    }

    /// Enables `crm_sync`. Without a credential CRM tasks are skipped.
    #[must_use]
    pub fn with_crm_credential(mut self, credential: Option<CrmCredential>) -> Self {
        self.crm_credential = credential;
        self
    }

    /// Sets the retry policy for handler failures.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the default per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends a wakeup on this channel whenever a submitted task settles.
    #[must_use]
    pub fn with_wakeups(mut self, wakeups: mpsc::UnboundedSender<Wakeup>) -> Self {
        self.wakeups = Some(wakeups);
        self
    }

    /// Returns true if a CRM credential is configured.
    #[must_use]
    pub fn crm_enabled(&self) -> bool {
        self.crm_credential.is_some()
    }

    /// Dispatches a task with the default per-attempt timeout.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::dispatch_with_timeout`].
    pub async fn dispatch(&self, task: SideEffectTask) -> Result<SideEffectTask, DispatchError> {
        self.dispatch_with_timeout(task, self.timeout).await
    }

    /// Runs a task to a terminal status and returns the recorded task.
    ///
    /// Handler failures end in a `Failed` task rather than an error. A key
    /// that is already in flight is returned as recorded, without waiting.
    ///
    /// # Errors
    ///
    /// - `PermissionDenied` if the task's scope is not granted
    /// - `ResourceExhausted` if a budget is full; the task stays `Pending`
    ///   and keeps its attempt count for the next dispatch
    /// - `NoHandler` if nothing handles the task's kind
    #[instrument(skip(self, task), fields(kind = %task.kind, instance_id = %task.instance_id, key = %task.idempotency_key))]
    pub async fn dispatch_with_timeout(
        &self,
        task: SideEffectTask,
        timeout: Duration,
    ) -> Result<SideEffectTask, DispatchError> {
        match self.admit(task).await? {
            Admission::Recorded(task) => Ok(task),
            Admission::Run {
                task,
                handler,
                permit,
            } => Ok(self.run(task, handler, permit, timeout).await),
        }
    }

    /// Admits a task and runs it on a background task.
    ///
    /// Returns the task as recorded at admission. When it is not terminal the
    /// caller learns about the outcome through a [`WakeSource::SideEffect`]
    /// wakeup.
    ///
    /// # Errors
    ///
    /// Same as [`Dispatcher::dispatch_with_timeout`]. Admission claims the
    /// first attempt's budget, so exhaustion surfaces here.
    #[instrument(skip(self, task), fields(kind = %task.kind, instance_id = %task.instance_id, key = %task.idempotency_key))]
    pub async fn submit(
        &self,
        task: SideEffectTask,
        timeout: Duration,
    ) -> Result<SideEffectTask, DispatchError> {
        match self.admit(task).await? {
            Admission::Recorded(task) => Ok(task),
            Admission::Run {
                task,
                handler,
                permit,
            } => {
                let admitted = task.clone();
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    let settled = dispatcher.run(task, handler, permit, timeout).await;
                    dispatcher.wake(&settled);
                });
                Ok(admitted)
            }
        }
    }

    /// Returns the recorded task for a key.
    pub async fn get(&self, key: &IdempotencyKey) -> Option<SideEffectTask> {
        self.ledger.read().await.tasks.get(key).cloned()
    }

    /// Returns every task recorded for an instance.
    pub async fn list_for_instance(&self, instance_id: WorkflowInstanceId) -> Vec<SideEffectTask> {
        let mut tasks: Vec<_> = self
            .ledger
            .read()
            .await
            .tasks
            .values()
            .filter(|task| task.instance_id == instance_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    /// Marks every pending task of an instance as cancelled.
    ///
    /// A task whose handler call is in flight is not interrupted. Returns the
    /// number of tasks cancelled.
    #[instrument(skip(self))]
    pub async fn cancel_instance(&self, instance_id: WorkflowInstanceId) -> usize {
        let mut ledger = self.ledger.write().await;
        let mut cancelled = 0;
        for task in ledger
            .tasks
            .values_mut()
            .filter(|task| task.instance_id == instance_id && !task.status.is_terminal())
        {
            task.set_status(SideEffectStatus::Cancelled);
            cancelled += 1;
        }
        cancelled
    }

    /// Drops every ledger entry of an instance. A background run whose entry
    /// was dropped stops before its next attempt. Returns the number of
    /// entries removed.
    #[instrument(skip(self))]
    pub async fn forget_instance(&self, instance_id: WorkflowInstanceId) -> usize {
        let mut ledger = self.ledger.write().await;
        let before = ledger.tasks.len();
        ledger.tasks.retain(|_, task| task.instance_id != instance_id);
        let Ledger { tasks, in_flight } = &mut *ledger;
        in_flight.retain(|key| tasks.contains_key(key));
        let removed = before - tasks.len();
        if removed > 0 {
            debug!(removed, "pruned side-effect ledger");
        }
        removed
    }

    /// Claims a task for execution and takes its first budget permit.
    async fn admit(&self, task: SideEffectTask) -> Result<Admission, DispatchError> {
        let key = task.idempotency_key.clone();
        let mut task = {
            let mut ledger = self.ledger.write().await;
            match ledger.tasks.get(&key).cloned() {
                Some(recorded) if recorded.status.is_terminal() => {
                    debug!(status = %recorded.status, "side effect already settled");
                    return Ok(Admission::Recorded(recorded));
                }
                Some(recorded) if ledger.in_flight.contains(&key) => {
                    debug!(status = %recorded.status, "side effect already in flight");
                    return Ok(Admission::Recorded(recorded));
                }
                Some(recorded) => {
                    ledger.in_flight.insert(key.clone());
                    recorded
                }
                None => {
                    ledger.tasks.insert(key.clone(), task.clone());
                    ledger.in_flight.insert(key.clone());
                    task
                }
            }
        };

        if task.kind == SideEffectKind::CrmSync && self.crm_credential.is_none() {
            warn!(label = %task.label, "no CRM credential configured, skipping crm_sync");
            task.set_status(SideEffectStatus::Skipped);
            self.settle(&task).await;
            return Ok(Admission::Recorded(task));
        }

        if let Err(GuardError::PermissionDenied { scope }) =
            self.guard.check_permission(&task.permission_scope)
        {
            task.last_error = Some(format!("permission '{scope}' is not granted"));
            task.set_status(SideEffectStatus::Failed);
            self.settle(&task).await;
            return Err(DispatchError::PermissionDenied { scope });
        }

        let Some(handler) = self.handlers.get(&task.kind).cloned() else {
            task.last_error = Some(format!("no handler for {}", task.kind));
            task.set_status(SideEffectStatus::Failed);
            self.settle(&task).await;
            return Err(DispatchError::NoHandler { kind: task.kind });
        };

        match self.guard.authorize(&guard_request(&task)) {
            Ok(permit) => Ok(Admission::Run {
                task,
                handler,
                permit,
            }),
            Err(GuardError::ResourceExhausted {
                resource,
                retry_after,
            }) => {
                task.set_status(SideEffectStatus::Pending);
                self.settle(&task).await;
                Err(DispatchError::ResourceExhausted {
                    resource,
                    retry_after,
                })
            }
            Err(err) => {
                task.last_error = Some(err.to_string());
                task.set_status(SideEffectStatus::Failed);
                self.settle(&task).await;
                Ok(Admission::Recorded(task))
            }
        }
    }

    /// Drives an admitted task until it settles.
    async fn run(
        &self,
        mut task: SideEffectTask,
        handler: Arc<dyn SideEffectHandler>,
        permit: GuardPermit,
        timeout: Duration,
    ) -> SideEffectTask {
        let key = task.idempotency_key.clone();
        let mut admitted = Some(permit);

        loop {
            if self.is_cancelled(&key).await {
                task.set_status(SideEffectStatus::Cancelled);
                self.settle(&task).await;
                return task;
            }

            let permit = match admitted.take() {
                Some(permit) => permit,
                None => match self.guard.authorize(&guard_request(&task)) {
                    Ok(permit) => permit,
                    Err(GuardError::ResourceExhausted { retry_after, .. }) => {
                        // Backpressure does not consume an attempt.
                        tokio::time::sleep(retry_after.unwrap_or(DEFAULT_BACKPRESSURE)).await;
                        continue;
                    }
                    Err(err) => {
                        task.last_error = Some(err.to_string());
                        task.set_status(SideEffectStatus::Failed);
                        self.settle(&task).await;
                        return task;
                    }
                },
            };

            task.attempt_count += 1;
            task.set_status(SideEffectStatus::Running);
            self.record(&task).await;

            let request = SideEffectRequest {
                kind: task.kind,
                label: task.label.clone(),
                instance_id: task.instance_id,
                payload: task.payload.clone(),
                idempotency_key: key.clone(),
                attempt: task.attempt_count,
                credential: match task.kind {
                    SideEffectKind::CrmSync => self.crm_credential.clone(),
                    _ => None,
                },
            };
            let result = tokio::time::timeout(timeout, handler.execute(&request))
                .await
                .unwrap_or(Err(HandlerError::Timeout));
            drop(permit);

            match result {
                Ok(()) => {
                    info!(attempts = task.attempt_count, "side effect delivered");
                    task.last_error = None;
                    task.set_status(SideEffectStatus::Succeeded);
                    self.settle(&task).await;
                    return task;
                }
                Err(err) => {
                    task.last_error = Some(err.to_string());
                    if !err.is_retryable() || !self.retry.allows_retry(task.attempt_count) {
                        warn!(error = %err, attempts = task.attempt_count, "side effect failed");
                        task.set_status(SideEffectStatus::Failed);
                        self.settle(&task).await;
                        return task;
                    }
                    let delay = self.retry.backoff_for(task.attempt_count);
                    debug!(error = %err, attempt = task.attempt_count, delay_ms = delay.as_millis() as u64, "retrying side effect");
                    task.set_status(SideEffectStatus::Pending);
                    self.record(&task).await;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Returns true if the task was cancelled or its entry was pruned.
    async fn is_cancelled(&self, key: &IdempotencyKey) -> bool {
        self.ledger
            .read()
            .await
            .tasks
            .get(key)
            .is_none_or(|task| task.status == SideEffectStatus::Cancelled)
    }

    /// Updates the ledger entry of a task. Pruned entries stay pruned.
    async fn record(&self, task: &SideEffectTask) {
        let mut ledger = self.ledger.write().await;
        Self::update(&mut ledger, task);
    }

    /// Records the task and gives up its in-flight claim.
    async fn settle(&self, task: &SideEffectTask) {
        let mut ledger = self.ledger.write().await;
        Self::update(&mut ledger, task);
        ledger.in_flight.remove(&task.idempotency_key);
    }

    fn update(ledger: &mut Ledger, task: &SideEffectTask) {
        let Some(recorded) = ledger.tasks.get_mut(&task.idempotency_key) else {
            return;
        };
        // A concurrent cancel wins over anything but a final outcome.
        let cancelled = recorded.status == SideEffectStatus::Cancelled
            && !matches!(
                task.status,
                SideEffectStatus::Succeeded | SideEffectStatus::Failed
            );
        if !cancelled {
            *recorded = task.clone();
        }
    }

    fn wake(&self, task: &SideEffectTask) {
        if let Some(wakeups) = &self.wakeups
            && wakeups
                .send(Wakeup::new(
                    task.instance_id,
                    WakeSource::SideEffect(task.idempotency_key.clone()),
                ))
                .is_err()
        {
            debug!("wakeup receiver dropped");
        }
    }
}

fn guard_request(task: &SideEffectTask) -> GuardRequest {
    GuardRequest {
        scopes: Vec::new(),
        demands: task
            .demands
            .iter()
            .copied()
            .chain(std::iter::once(ResourceDemand::api_call()))
            .collect(),
    }
}
