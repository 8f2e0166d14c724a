//! Single-step driver for workflow instances.
//!
//! One call to [`Executor::execute_step`] takes the instance lease, evaluates
//! the transitions leaving the current state in declaration order, and
//! either:
//! - fires the first eligible transition once its side effects have settled,
//!   committing the new state with a history record
//! - starts or observes the agent invocation a transition is gated on
//! - submits the side effects of an eligible transition and suspends until
//!   they settle
//! - suspends the instance until something external changes
//!
//! Agents and side effects run on background tasks. The worker that runs a
//! step only holds the lease for evaluation and commit.
//!
//! Commits are version-checked. A stale read is re-read and re-evaluated a
//! bounded number of times before surfacing as a concurrency conflict.

use crate::availability::TransitionReport;
use crate::condition::evaluation_context;
use crate::definition::{
    AgentRequirement, OverdueSeverity, Transition, TransitionTrigger, WorkflowDefinition,
};
use crate::entity::EntityRepository;
use crate::envelope::Envelope;
use crate::error::{StepError, StoreError};
use crate::event::{EventSink, LifecycleEvent};
use crate::instance::{
    AgentInvocationRef, InstanceError, InstanceStatus, SideEffectRef, StepTrigger,
    WorkflowInstance,
};
use crate::registry::WorkflowRegistry;
use crate::store::{InstanceStore, Lease};
use chrono::Utc;
use dealflow_agent::{AgentGateway, AgentInvocation, InvocationError, InvocationRequest, InvocationStatus};
use dealflow_core::{IdempotencyKey, RetryPolicy, WorkflowInstanceId};
use dealflow_guard::Guard;
use dealflow_integration::{DispatchError, Dispatcher, SideEffectStatus, SideEffectTask};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Tunables for step execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    pub lease_ttl: Duration,
    /// Re-reads allowed after a version conflict within one step.
    pub commit_retries: u32,
    pub agent_retry: RetryPolicy,
    /// How long invocation and side-effect records of a terminal instance
    /// stay queryable before they are pruned.
    pub ledger_retention: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            commit_retries: 3,
            agent_retry: RetryPolicy::default(),
            ledger_retention: Duration::from_secs(600),
        }
    }
}

/// What one step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A transition was committed.
    Transitioned {
        from: String,
        to: String,
        status: InstanceStatus,
    },
    /// Nothing fired. The instance waits for an agent, a side effect or an
    /// entity update.
    Suspended { state: String },
    /// A fatal error was recorded on the instance.
    Failed { error: StepError },
    /// The instance was already terminal.
    NoOp,
}

impl StepOutcome {
    /// Returns true if the instance should be stepped again right away.
    #[must_use]
    pub fn needs_follow_up(&self) -> bool {
        matches!(
            self,
            Self::Transitioned {
                status: InstanceStatus::Running,
                ..
            }
        )
    }
}

/// Result of one read-evaluate-commit round.
enum Round {
    Done(StepOutcome),
    /// The instance changed underneath us.
    Stale,
}

/// What evaluation decided.
enum Plan<'a> {
    Fire {
        transition: &'a Transition,
        invocation: Option<AgentInvocationRef>,
        agents: Map<String, JsonValue>,
    },
    Suspend {
        awaiting: Option<IdempotencyKey>,
        agents: Map<String, JsonValue>,
        retry_counts: HashMap<String, u32>,
    },
}

/// Where the side effects of an eligible transition stand.
enum SideEffects {
    Settled(Vec<SideEffectRef>),
    /// Still running; the key is the first task not yet settled.
    Pending(IdempotencyKey),
}

/// Overdue alerts already raised, keyed by instance. The `usize` is the
/// history length when the alert was raised, so a new state entry resets it.
type OverdueAlerts = HashMap<WorkflowInstanceId, (usize, OverdueSeverity)>;

/// Drives workflow instances one step at a time.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<WorkflowRegistry>,
    store: Arc<dyn InstanceStore>,
    entities: Arc<dyn EntityRepository>,
    gateway: AgentGateway,
    dispatcher: Dispatcher,
    guard: Guard,
    sinks: Vec<Arc<dyn EventSink>>,
    config: ExecutorConfig,
    overdue: Arc<Mutex<OverdueAlerts>>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("registry", &self.registry.entity_types())
            .field("sinks", &self.sinks.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates an executor with the default config and no event sinks.
    #[must_use]
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        store: Arc<dyn InstanceStore>,
        entities: Arc<dyn EntityRepository>,
        gateway: AgentGateway,
        dispatcher: Dispatcher,
        guard: Guard,
    ) -> Self {
        Self {
            registry,
            store,
            entities,
            gateway,
            dispatcher,
            guard,
            sinks: Vec::new(),
            config: ExecutorConfig::default(),
            overdue: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replaces the step tunables.
    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a destination for lifecycle events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Returns the workflow registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Returns the instance store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    /// Returns the entity repository.
    #[must_use]
    pub fn entities(&self) -> &Arc<dyn EntityRepository> {
        &self.entities
    }

    /// Returns the agent gateway.
    #[must_use]
    pub fn gateway(&self) -> &AgentGateway {
        &self.gateway
    }

    /// Returns the side-effect dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Returns the guard.
    #[must_use]
    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    /// Runs one step for an instance.
    ///
    /// Fatal errors are recorded on the instance and reported as
    /// [`StepOutcome::Failed`].
    ///
    /// # Errors
    ///
    /// Returns a transient error (`ConcurrencyConflict`, `ResourceExhausted`,
    /// `Repository`) when the step should be requeued, and `Validation` for
    /// unknown instances. The instance is left untouched in both cases.
    #[instrument(skip(self), fields(instance_id = %instance_id, trigger = %trigger))]
    pub async fn execute_step(
        &self,
        instance_id: WorkflowInstanceId,
        trigger: StepTrigger,
    ) -> Result<StepOutcome, StepError> {
        let lease = self
            .store
            .acquire_lease(instance_id, self.config.lease_ttl)
            .await?;
        debug!("lease acquired");

        let result = self.step_under_lease(&lease, &trigger).await;

        if let Err(e) = self.store.release(&lease).await {
            warn!(error = %e, "failed to release lease");
        }
        result
    }

    async fn step_under_lease(
        &self,
        lease: &Lease,
        trigger: &StepTrigger,
    ) -> Result<StepOutcome, StepError> {
        for round in 0..=self.config.commit_retries {
            let instance = self.load(lease.instance_id).await?;
            if instance.is_terminal() {
                debug!(status = %instance.status, "instance is terminal");
                return Ok(StepOutcome::NoOp);
            }
            match self.run_round(lease, instance, trigger).await? {
                Round::Done(outcome) => return Ok(outcome),
                Round::Stale => debug!(round, "version changed during step, re-evaluating"),
            }
        }
        Err(self.conflict(lease.instance_id))
    }

    async fn run_round(
        &self,
        lease: &Lease,
        instance: WorkflowInstance,
        trigger: &StepTrigger,
    ) -> Result<Round, StepError> {
        let Some(definition) = self.registry.get(instance.entity_type).cloned() else {
            let err = StepError::Validation {
                reason: format!("no workflow registered for {}", instance.entity_type),
            };
            return self.fail_committed(Some(lease), instance, err).await;
        };

        let entity = match self.load_entity(&instance).await {
            Ok(entity) => entity,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => return self.fail_committed(Some(lease), instance, e).await,
        };

        let plan = match self.plan(&instance, &definition, &entity).await {
            Ok(plan) => plan,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => return self.fail_committed(Some(lease), instance, e).await,
        };

        match plan {
            Plan::Fire {
                transition,
                invocation,
                agents,
            } => {
                if !transition.side_effects.is_empty() {
                    // Keeps the lease alive across admission of a long list.
                    self.store
                        .renew_lease(lease, self.config.lease_ttl)
                        .await?;
                }
                let side_effects = match self
                    .settle_side_effects(&instance, &definition, transition, &entity)
                    .await
                {
                    Ok(SideEffects::Settled(refs)) => refs,
                    Ok(SideEffects::Pending(key)) => {
                        debug!(to = %transition.to, key = %key, "waiting for side effects");
                        let retry_counts = instance.retry_counts.clone();
                        return self
                            .commit_suspension(lease, instance, Some(key), agents, retry_counts)
                            .await;
                    }
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => return self.fail_committed(Some(lease), instance, e).await,
                };
                self.commit_transition(
                    lease,
                    instance,
                    &definition,
                    transition,
                    trigger,
                    invocation,
                    side_effects,
                    agents,
                )
                .await
            }
            Plan::Suspend {
                awaiting,
                agents,
                retry_counts,
            } => {
                self.commit_suspension(lease, instance, awaiting, agents, retry_counts)
                    .await
            }
        }
    }

    /// Evaluates the current state's transitions in order.
    async fn plan<'a>(
        &self,
        instance: &WorkflowInstance,
        definition: &'a WorkflowDefinition,
        entity: &JsonValue,
    ) -> Result<Plan<'a>, StepError> {
        let state = &instance.current_state;
        if !definition.contains_state(state) {
            return Err(StepError::Validation {
                reason: format!(
                    "state '{state}' is not part of the {} workflow",
                    instance.entity_type
                ),
            });
        }

        let family = instance.attempt_family(state);
        let mut agents = instance.agent_results.clone();
        let mut retry_counts = instance.retry_counts.clone();
        let mut awaiting = None;

        for transition in definition.transitions_from(state) {
            match &transition.trigger {
                TransitionTrigger::Automatic { condition } => {
                    if condition.evaluate(&evaluation_context(entity, &agents)) {
                        self.check_permissions(transition)?;
                        return Ok(Plan::Fire {
                            transition,
                            invocation: None,
                            agents,
                        });
                    }
                }
                TransitionTrigger::Agent { requirement } => {
                    let key = IdempotencyKey::for_step(
                        instance.id,
                        &transition.from,
                        &transition.to,
                        family,
                    );
                    let Some(invocation) = self.gateway.get(&key).await else {
                        self.check_permissions(transition)?;
                        self.invoke_agent(instance, definition, requirement, entity, key.clone())
                            .await?;
                        awaiting.get_or_insert(key);
                        continue;
                    };

                    match invocation.status {
                        InvocationStatus::Succeeded => {
                            agents.insert(
                                requirement.agent.clone(),
                                invocation.result.clone().unwrap_or(JsonValue::Null),
                            );
                            let unmet = requirement
                                .result_validation
                                .unmet(&evaluation_context(entity, &agents));
                            if !unmet.is_empty() {
                                return Err(StepError::AgentInvocation {
                                    agent: requirement.agent.clone(),
                                    reason: format!("malformed result: {}", unmet.join(", ")),
                                });
                            }
                            if requirement
                                .result_guard
                                .evaluate(&evaluation_context(entity, &agents))
                            {
                                self.check_permissions(transition)?;
                                return Ok(Plan::Fire {
                                    transition,
                                    invocation: Some(AgentInvocationRef {
                                        invocation_id: invocation.id,
                                        agent: requirement.agent.clone(),
                                        idempotency_key: key,
                                    }),
                                    agents,
                                });
                            }
                            debug!(agent = %requirement.agent, "agent result does not satisfy transition guard");
                        }
                        _ if invocation.is_terminal() => {
                            return Err(invocation_failure(requirement, &invocation));
                        }
                        _ => {
                            let step = format!("{}->{}", transition.from, transition.to);
                            let retries = invocation.attempt_count.saturating_sub(1);
                            if retries > 0 {
                                retry_counts.insert(step, retries);
                            }
                            awaiting.get_or_insert(key);
                        }
                    }
                }
            }
        }

        Ok(Plan::Suspend {
            awaiting,
            agents,
            retry_counts,
        })
    }

    fn check_permissions(&self, transition: &Transition) -> Result<(), StepError> {
        for scope in &transition.required_permissions {
            self.guard.check_permission(scope)?;
        }
        Ok(())
    }

    async fn invoke_agent(
        &self,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
        requirement: &AgentRequirement,
        entity: &JsonValue,
        key: IdempotencyKey,
    ) -> Result<(), StepError> {
        self.guard.check_permission(&requirement.permission_scope)?;
        let payload = json!({
            "entity_type": instance.entity_type,
            "entity_id": instance.entity_id,
            "state": instance.current_state,
            "entity": entity,
        });
        let request = InvocationRequest::new(instance.id, &requirement.agent, payload, key)
            .with_timeout(definition.timeouts().agent())
            .with_retry(self.config.agent_retry.clone())
            .with_permission_scope(&requirement.permission_scope)
            .with_demands(requirement.demands.clone());
        let invocation = self
            .gateway
            .invoke(request)
            .await
            .map_err(|e| StepError::Validation {
                reason: e.to_string(),
            })?;
        info!(agent = %requirement.agent, key = %invocation.idempotency_key, "agent invoked");
        Ok(())
    }

    /// Submits every side effect of a transition and reports whether all
    /// of them have settled. Submitting a key that is settled or in flight
    /// returns its record without running it again.
    async fn settle_side_effects(
        &self,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
        transition: &Transition,
        entity: &JsonValue,
    ) -> Result<SideEffects, StepError> {
        let step_key = IdempotencyKey::for_step(
            instance.id,
            &transition.from,
            &transition.to,
            instance.attempt_family(&transition.from),
        );
        let mut refs = Vec::with_capacity(transition.side_effects.len());
        let mut pending = None;

        for spec in &transition.side_effects {
            let mut payload = json!({
                "entity_type": instance.entity_type,
                "entity_id": instance.entity_id,
                "from_state": transition.from,
                "to_state": transition.to,
                "entity": entity,
            });
            if let (Some(target), Some(extra)) = (payload.as_object_mut(), spec.payload.as_object())
            {
                target.extend(extra.clone());
            }
            let task = SideEffectTask::new(instance.id, spec, payload, step_key.child(&spec.label));

            let task = match self
                .dispatcher
                .submit(task, definition.timeouts().side_effect())
                .await
            {
                Ok(task) => task,
                Err(DispatchError::ResourceExhausted {
                    resource,
                    retry_after,
                }) => {
                    return Err(StepError::ResourceExhausted {
                        resource,
                        retry_after,
                    });
                }
                Err(DispatchError::PermissionDenied { scope }) => {
                    return Err(StepError::PermissionDenied { scope });
                }
                Err(e @ DispatchError::NoHandler { .. }) => {
                    if spec.required {
                        return Err(StepError::SideEffect {
                            kind: spec.kind,
                            label: spec.label.clone(),
                            reason: e.to_string(),
                        });
                    }
                    warn!(kind = %spec.kind, label = %spec.label, error = %e, "skipping side effect");
                    continue;
                }
            };

            if !task.status.is_terminal() {
                pending.get_or_insert(task.idempotency_key);
                continue;
            }

            if task.status == SideEffectStatus::Failed {
                let reason = task
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "side effect failed".to_string());
                if task.required {
                    return Err(StepError::SideEffect {
                        kind: task.kind,
                        label: task.label,
                        reason,
                    });
                }
                warn!(kind = %task.kind, label = %task.label, error = %reason, "non-critical side effect failed");
            }

            refs.push(SideEffectRef {
                task_id: task.id,
                kind: task.kind,
                label: task.label,
                status: task.status,
                idempotency_key: task.idempotency_key,
            });
        }

        Ok(match pending {
            Some(key) => SideEffects::Pending(key),
            None => SideEffects::Settled(refs),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_transition(
        &self,
        lease: &Lease,
        instance: WorkflowInstance,
        definition: &WorkflowDefinition,
        transition: &Transition,
        trigger: &StepTrigger,
        invocation: Option<AgentInvocationRef>,
        side_effects: Vec<SideEffectRef>,
        agents: Map<String, JsonValue>,
    ) -> Result<Round, StepError> {
        let terminal = definition.is_terminal(&transition.to);
        let mut next = instance.clone();
        next.agent_results = agents;
        next.apply_transition(
            &transition.to,
            trigger.clone(),
            invocation,
            side_effects,
            terminal,
        );

        let committed = match self.store.commit(Some(lease), instance.version, next).await {
            Ok(committed) => committed,
            Err(StoreError::VersionConflict { .. }) => return Ok(Round::Stale),
            Err(e) => return Err(e.into()),
        };

        info!(
            from = %transition.from,
            to = %transition.to,
            version = committed.version,
            "state transition committed"
        );
        self.emit(LifecycleEvent::StateChanged {
            instance_id: committed.id,
            entity_type: committed.entity_type,
            entity_id: committed.entity_id.clone(),
            from_state: transition.from.clone(),
            to_state: transition.to.clone(),
            version: committed.version,
            at: committed.updated_at,
        })
        .await;
        if terminal {
            info!(state = %transition.to, "workflow completed");
            self.emit(LifecycleEvent::Completed {
                instance_id: committed.id,
                entity_type: committed.entity_type,
                entity_id: committed.entity_id.clone(),
                final_state: transition.to.clone(),
                at: committed.updated_at,
            })
            .await;
            self.retire(committed.id);
        }

        Ok(Round::Done(StepOutcome::Transitioned {
            from: transition.from.clone(),
            to: transition.to.clone(),
            status: committed.status,
        }))
    }

    async fn commit_suspension(
        &self,
        lease: &Lease,
        instance: WorkflowInstance,
        awaiting: Option<IdempotencyKey>,
        agents: Map<String, JsonValue>,
        retry_counts: HashMap<String, u32>,
    ) -> Result<Round, StepError> {
        let state = instance.current_state.clone();
        let unchanged = instance.status == InstanceStatus::SuspendedWaiting
            && instance.awaiting == awaiting
            && instance.agent_results == agents
            && instance.retry_counts == retry_counts;
        if unchanged {
            return Ok(Round::Done(StepOutcome::Suspended { state }));
        }

        let mut next = instance.clone();
        next.status = InstanceStatus::SuspendedWaiting;
        next.awaiting = awaiting;
        next.agent_results = agents;
        next.retry_counts = retry_counts;
        next.touch();
        match self.store.commit(Some(lease), instance.version, next).await {
            Ok(committed) => {
                debug!(state = %state, awaiting = ?committed.awaiting, "instance suspended");
                Ok(Round::Done(StepOutcome::Suspended { state }))
            }
            Err(StoreError::VersionConflict { .. }) => Ok(Round::Stale),
            Err(e) => Err(e.into()),
        }
    }

    /// Records a fatal error on the instance.
    async fn fail_committed(
        &self,
        lease: Option<&Lease>,
        instance: WorkflowInstance,
        err: StepError,
    ) -> Result<Round, StepError> {
        let mut next = instance.clone();
        next.status = InstanceStatus::Failed;
        next.awaiting = None;
        next.last_error = Some(InstanceError::from(&err));
        next.touch();

        let committed = match self.store.commit(lease, instance.version, next).await {
            Ok(committed) => committed,
            Err(StoreError::VersionConflict { .. }) => return Ok(Round::Stale),
            Err(e) => return Err(e.into()),
        };

        error!(instance_id = %committed.id, state = %committed.current_state, error = %err, "workflow failed");
        self.emit(LifecycleEvent::Failed {
            instance_id: committed.id,
            entity_type: committed.entity_type,
            entity_id: committed.entity_id.clone(),
            state: committed.current_state.clone(),
            error: InstanceError::from(&err),
            at: committed.updated_at,
        })
        .await;
        self.retire(committed.id);
        Ok(Round::Done(StepOutcome::Failed { error: err }))
    }

    /// Marks an instance failed outside of a step, e.g. after the scheduler
    /// gave up on a transient error. Terminal instances are returned as-is.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for unknown instances and `ConcurrencyConflict`
    /// if the instance keeps changing.
    #[instrument(skip(self, err), fields(instance_id = %instance_id, error = %err))]
    pub async fn fail(
        &self,
        instance_id: WorkflowInstanceId,
        err: &StepError,
    ) -> Result<WorkflowInstance, StepError> {
        for _ in 0..=self.config.commit_retries {
            let instance = self.load(instance_id).await?;
            if instance.is_terminal() {
                return Ok(instance);
            }
            if let Round::Done(_) = self.fail_committed(None, instance, err.clone()).await? {
                return self.load(instance_id).await;
            }
        }
        Err(self.conflict(instance_id))
    }

    /// Cancels an instance and, best effort, its outstanding agent
    /// invocations and side effects. Late results are discarded.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for unknown or already terminal instances.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn cancel(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> Result<WorkflowInstance, StepError> {
        for _ in 0..=self.config.commit_retries {
            let instance = self.load(instance_id).await?;
            if instance.is_terminal() {
                return Err(StepError::Validation {
                    reason: format!("instance {instance_id} is already {}", instance.status),
                });
            }
            let mut next = instance.clone();
            next.status = InstanceStatus::Cancelled;
            next.awaiting = None;
            next.touch();

            match self.store.commit(None, instance.version, next).await {
                Ok(committed) => {
                    let invocations = self.gateway.cancel_instance(instance_id).await;
                    let tasks = self.dispatcher.cancel_instance(instance_id).await;
                    info!(
                        state = %committed.current_state,
                        invocations,
                        side_effects = tasks,
                        "workflow cancelled"
                    );
                    self.emit(LifecycleEvent::Cancelled {
                        instance_id,
                        entity_type: committed.entity_type,
                        entity_id: committed.entity_id.clone(),
                        state: committed.current_state.clone(),
                        at: Utc::now(),
                    })
                    .await;
                    self.retire(instance_id);
                    return Ok(committed);
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(self.conflict(instance_id))
    }

    /// Starts a new attempt family for the current state so its agents are
    /// invoked afresh under new idempotency keys. Previous results for those
    /// agents are forgotten.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for unknown or terminal instances and for states
    /// without agent-gated transitions.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn rerun_agents(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> Result<WorkflowInstance, StepError> {
        for _ in 0..=self.config.commit_retries {
            let instance = self.load(instance_id).await?;
            if instance.is_terminal() {
                return Err(StepError::Validation {
                    reason: format!("instance {instance_id} is already {}", instance.status),
                });
            }
            let definition = self.registry.get(instance.entity_type).ok_or_else(|| {
                StepError::Validation {
                    reason: format!("no workflow registered for {}", instance.entity_type),
                }
            })?;
            let agents: Vec<&str> = definition
                .transitions_from(&instance.current_state)
                .into_iter()
                .filter_map(|t| t.agent_requirement().map(|r| r.agent.as_str()))
                .collect();
            if agents.is_empty() {
                return Err(StepError::Validation {
                    reason: format!(
                        "state '{}' has no agent-gated transitions",
                        instance.current_state
                    ),
                });
            }

            let mut next = instance.clone();
            let family = next.attempt_family(&instance.current_state) + 1;
            next.attempt_families
                .insert(instance.current_state.clone(), family);
            for agent in agents {
                next.agent_results.remove(agent);
            }
            next.retry_counts.clear();
            next.awaiting = None;
            next.status = InstanceStatus::Running;
            next.touch();

            match self.store.commit(None, instance.version, next).await {
                Ok(committed) => {
                    info!(state = %committed.current_state, family, "agents will be re-run");
                    return Ok(committed);
                }
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(self.conflict(instance_id))
    }

    /// Reports every transition leaving the instance's current state with
    /// its met and unmet requirements, in declaration order. Terminal
    /// instances have none.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for unknown instances or entities and
    /// `Repository` if the entity cannot be loaded.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn available_transitions(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> Result<Vec<TransitionReport>, StepError> {
        let instance = self.load(instance_id).await?;
        if instance.is_terminal() {
            return Ok(Vec::new());
        }
        let definition = self.registry.get(instance.entity_type).ok_or_else(|| {
            StepError::Validation {
                reason: format!("no workflow registered for {}", instance.entity_type),
            }
        })?;
        let entity = self.load_entity(&instance).await?;
        Ok(definition
            .transitions_from(&instance.current_state)
            .into_iter()
            .map(|t| TransitionReport::evaluate(t, &entity, &instance.agent_results, &self.guard))
            .collect())
    }

    /// Raises a `StageOverdue` event for every running instance that has
    /// stayed in its state past the state's target or maximum duration.
    ///
    /// Each severity is raised once per state entry. Returns the events
    /// raised by this call.
    ///
    /// # Errors
    ///
    /// Returns `Repository` if the instances cannot be listed.
    #[instrument(skip(self))]
    pub async fn check_stage_durations(&self) -> Result<Vec<LifecycleEvent>, StepError> {
        let instances = self.store.list().await?;
        let now = Utc::now();
        let mut raised = Vec::new();

        for instance in instances.iter().filter(|i| !i.is_terminal()) {
            let Some(duration) = self
                .registry
                .get(instance.entity_type)
                .and_then(|d| d.state(&instance.current_state))
                .and_then(|s| s.duration)
            else {
                continue;
            };
            let elapsed = (now - instance.state_entered_at())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let Some(severity) = duration.severity(elapsed) else {
                continue;
            };
            let Some(limit) = duration.limit(severity) else {
                continue;
            };

            let entry = instance.history.len();
            {
                let mut overdue = self.overdue.lock().unwrap_or_else(PoisonError::into_inner);
                let already = overdue
                    .get(&instance.id)
                    .is_some_and(|(at, raised)| *at == entry && *raised >= severity);
                if already {
                    continue;
                }
                overdue.insert(instance.id, (entry, severity));
            }

            warn!(
                instance_id = %instance.id,
                state = %instance.current_state,
                severity = severity.as_str(),
                elapsed_ms = millis(elapsed),
                "instance is overdue in its state"
            );
            let event = LifecycleEvent::StageOverdue {
                instance_id: instance.id,
                entity_type: instance.entity_type,
                entity_id: instance.entity_id.clone(),
                state: instance.current_state.clone(),
                severity,
                elapsed_ms: millis(elapsed),
                limit_ms: millis(limit),
                at: now,
            };
            self.emit(event.clone()).await;
            raised.push(event);
        }
        Ok(raised)
    }

    /// Prunes the ledgers of a terminal instance once the retention period
    /// has passed.
    fn retire(&self, instance_id: WorkflowInstanceId) {
        self.overdue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&instance_id);
        let gateway = self.gateway.clone();
        let dispatcher = self.dispatcher.clone();
        let retention = self.config.ledger_retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let invocations = gateway.forget_instance(instance_id).await;
            let side_effects = dispatcher.forget_instance(instance_id).await;
            debug!(instance_id = %instance_id, invocations, side_effects, "ledgers pruned");
        });
    }

    async fn load(&self, instance_id: WorkflowInstanceId) -> Result<WorkflowInstance, StepError> {
        self.store
            .get(instance_id)
            .await?
            .ok_or_else(|| StepError::Validation {
                reason: format!("workflow instance not found: {instance_id}"),
            })
    }

    async fn load_entity(&self, instance: &WorkflowInstance) -> Result<JsonValue, StepError> {
        self.entities
            .load(instance.entity_type, &instance.entity_id)
            .await?
            .ok_or_else(|| StepError::Validation {
                reason: format!("{} '{}' does not exist", instance.entity_type, instance.entity_id),
            })
    }

    fn conflict(&self, instance_id: WorkflowInstanceId) -> StepError {
        StepError::ConcurrencyConflict {
            instance_id,
            reason: format!(
                "version changed on each of {} attempts",
                self.config.commit_retries + 1
            ),
        }
    }

    async fn emit(&self, event: LifecycleEvent) {
        let envelope = Envelope::new(event);
        for sink in &self.sinks {
            if let Err(e) = sink.publish(&envelope).await {
                warn!(event = envelope.payload().name(), error = %e, "failed to publish lifecycle event");
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn invocation_failure(requirement: &AgentRequirement, invocation: &AgentInvocation) -> StepError {
    match &invocation.last_error {
        Some(InvocationError::PermissionDenied { scope }) => StepError::PermissionDenied {
            scope: scope.clone(),
        },
        Some(err) => StepError::AgentInvocation {
            agent: requirement.agent.clone(),
            reason: err.to_string(),
        },
        None => StepError::AgentInvocation {
            agent: requirement.agent.clone(),
            reason: format!("invocation ended {}", invocation.status),
        },
    }
}
