//! The workflow control surface.
//!
//! [`EngineBuilder`] wires the guard, gateway, dispatcher, executor and
//! scheduler from an [`EngineConfig`]. [`WorkflowEngine`] is the only entry
//! point callers need: it starts, advances, cancels and reports on
//! instances, explains what their next transitions are waiting for, and
//! streams their lifecycle events.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::external::ExternalEvent;
use dealflow_agent::{
    Agent, AgentGateway, AgentInvocation, AgentOutcome, InvocationError, ResultDisposition,
};
use dealflow_core::{IdempotencyKey, Wakeup, WorkflowInstanceId};
use dealflow_guard::{BudgetSnapshot, Guard};
use dealflow_integration::{Dispatcher, SideEffectHandler, SideEffectTask};
use dealflow_scheduler::{Scheduler, SchedulerError};
use dealflow_workflow::{
    BroadcastEventSink, EntityRepository, EntityType, Envelope, EventSink, Executor,
    InMemoryEntityRepository, InMemoryInstanceStore, InstanceStore, LifecycleEvent, StepError,
    StepTrigger, StoreError, TransitionReport, WorkflowInstance, WorkflowRegistry,
};
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Assembles a [`WorkflowEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    agents: Vec<Arc<dyn Agent>>,
    handlers: Vec<Arc<dyn SideEffectHandler>>,
    entities: Option<Arc<dyn EntityRepository>>,
    store: Option<Arc<dyn InstanceStore>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EngineBuilder {
    /// Creates a builder with no agents, handlers or extra sinks.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            agents: Vec::new(),
            handlers: Vec::new(),
            entities: None,
            store: None,
            sinks: Vec::new(),
        }
    }

    /// Registers an agent under its name.
    #[must_use]
    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    /// Registers a side-effect handler for its kind.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn SideEffectHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Defaults to an empty in-memory repository.
    #[must_use]
    pub fn with_entity_repository(mut self, entities: Arc<dyn EntityRepository>) -> Self {
        self.entities = Some(entities);
        self
    }

    /// Defaults to an in-memory store.
    #[must_use]
    pub fn with_instance_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Adds a sink that receives every lifecycle event. An in-process
    /// broadcast sink backing [`WorkflowEngine::subscribe`] is always present.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Validates the registry and wires the engine together.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRegistry` if a built-in definition fails validation.
    pub fn build(self) -> dealflow_core::Result<WorkflowEngine, EngineError> {
        let config = self.config;
        let registry = WorkflowRegistry::from_settings(&config.registry_settings()).map_err(
            |e| EngineError::InvalidRegistry {
                reason: e.to_string(),
            },
        )?;
        let guard = Guard::new(config.permission_grants(), config.resources.clone());

        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let gateway = self.agents.into_iter().fold(
            AgentGateway::new(guard.clone()).with_wakeups(wake_tx.clone()),
            AgentGateway::with_agent,
        );
        let dispatcher = self.handlers.into_iter().fold(
            Dispatcher::new(guard.clone())
                .with_crm_credential(config.crm.clone())
                .with_retry(config.side_effect_retry.clone())
                .with_timeout(config.timeouts.side_effect())
                .with_wakeups(wake_tx),
            Dispatcher::with_handler,
        );
        if !dispatcher.crm_enabled() {
            warn!("no CRM credential configured, crm_sync side effects will be skipped");
        }
        for definition in registry.entity_types().into_iter().filter_map(|t| registry.get(t)) {
            for requirement in definition.transitions().filter_map(|t| t.agent_requirement()) {
                if !gateway.has_agent(&requirement.agent) {
                    warn!(
                        agent = %requirement.agent,
                        entity_type = %definition.entity_type(),
                        "no agent registered for workflow requirement"
                    );
                }
            }
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryInstanceStore::new()));
        let entities = self
            .entities
            .unwrap_or_else(|| Arc::new(InMemoryEntityRepository::new()));
        let events = BroadcastEventSink::default();
        let executor = self.sinks.into_iter().fold(
            Executor::new(
                Arc::new(registry),
                store,
                entities,
                gateway,
                dispatcher,
                guard,
            )
            .with_config(config.executor_config())
            .with_event_sink(Arc::new(events.clone())),
            Executor::with_event_sink,
        );
        let scheduler = Scheduler::new(executor.clone(), config.scheduler_config());

        info!(
            workflows = ?executor.registry().entity_types(),
            workers = scheduler.workers(),
            "workflow engine built"
        );
        Ok(WorkflowEngine {
            executor,
            scheduler,
            events,
            wakeups: Mutex::new(Some(wake_rx)),
            config,
        })
    }
}

/// Starts, advances, cancels and inspects workflow instances.
pub struct WorkflowEngine {
    executor: Executor,
    scheduler: Scheduler,
    events: BroadcastEventSink,
    wakeups: Mutex<Option<mpsc::UnboundedReceiver<Wakeup>>>,
    config: EngineConfig,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("executor", &self.executor)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// Returns a builder for `config`.
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Returns the configuration the engine was built from.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the step executor.
    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Returns the scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Requeues unfinished instances and starts the scheduler.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is already running or recovery
    /// cannot list the store.
    pub async fn spawn(&self) -> dealflow_core::Result<JoinHandle<()>, EngineError> {
        let wakeups = self
            .wakeups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if wakeups.is_none() {
            return Err(scheduler_error(SchedulerError::AlreadyRunning).into());
        }
        let recovered = self.scheduler.recover().await.map_err(scheduler_error)?;
        if recovered > 0 {
            info!(recovered, "resuming unfinished instances");
        }
        Ok(self.scheduler.spawn(wakeups).map_err(scheduler_error)?)
    }

    /// Stops the scheduler. Running steps finish; queued steps stay in the
    /// store and are recovered on the next start.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// Creates an instance for an entity in its workflow's initial state and
    /// queues its first step.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the workflow is disabled, the entity is
    /// unknown or already has a non-terminal instance.
    #[instrument(skip(self), fields(entity_type = %entity_type, entity_id = %entity_id))]
    pub async fn start(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> dealflow_core::Result<WorkflowInstanceId, EngineError> {
        let definition = self
            .executor
            .registry()
            .get(entity_type)
            .ok_or(EngineError::WorkflowDisabled { entity_type })?;

        let entity = self
            .executor
            .entities()
            .load(entity_type, entity_id)
            .await
            .map_err(|e| EngineError::from(StepError::from(e)))?;
        if entity.is_none() {
            return Err(EngineError::EntityNotFound {
                entity_type,
                entity_id: entity_id.to_string(),
            }
            .into());
        }

        let store = self.executor.store();
        if let Some(active) = store
            .find_active_for_entity(entity_type, entity_id)
            .await
            .map_err(store_error)?
        {
            return Err(EngineError::ActiveInstanceExists {
                entity_id: entity_id.to_string(),
                instance_id: active.id,
            }
            .into());
        }

        let instance = WorkflowInstance::new(entity_type, entity_id, definition.initial_state());
        let instance_id = instance.id;
        store.insert(instance).await.map_err(store_error)?;
        self.enqueue(instance_id, StepTrigger::Start)?;
        info!(instance_id = %instance_id, state = %definition.initial_state(), "workflow started");
        Ok(instance_id)
    }

    /// Delivers an external event to a running instance.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown or terminal instances, for agent results
    /// that do not match an invocation of the instance, and for reruns in
    /// states without agents.
    #[instrument(skip(self), fields(instance_id = %instance_id, event = %event))]
    pub async fn advance(
        &self,
        instance_id: WorkflowInstanceId,
        event: ExternalEvent,
    ) -> dealflow_core::Result<(), EngineError> {
        let instance = self.live_instance(instance_id).await?;
        match event {
            ExternalEvent::EntityUpdated => self.enqueue(instance_id, StepTrigger::EntityUpdated),
            ExternalEvent::AgentResult {
                idempotency_key,
                result,
            } => {
                self.record_agent_result(&instance, idempotency_key, Ok(result))
                    .await
            }
            ExternalEvent::AgentFailed {
                idempotency_key,
                reason,
            } => {
                self.record_agent_result(&instance, idempotency_key, Err(reason))
                    .await
            }
            ExternalEvent::RerunAgents => {
                self.executor
                    .rerun_agents(instance_id)
                    .await
                    .map_err(EngineError::from)?;
                self.enqueue(instance_id, StepTrigger::RerunAgents)
            }
        }
    }

    /// Cancels an instance. Outstanding agent invocations and side effects
    /// are cancelled best effort and their late results discarded.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown or already terminal instances.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn cancel(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> dealflow_core::Result<WorkflowInstance, EngineError> {
        self.live_instance(instance_id).await?;
        let cancelled = self
            .executor
            .cancel(instance_id)
            .await
            .map_err(EngineError::from)?;
        Ok(cancelled)
    }

    /// Returns a snapshot of an instance.
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound` for unknown instances.
    pub async fn get_status(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> dealflow_core::Result<WorkflowInstance, EngineError> {
        self.executor
            .store()
            .get(instance_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| EngineError::InstanceNotFound { instance_id }.into())
    }

    /// Lists every instance in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn list_instances(&self) -> dealflow_core::Result<Vec<WorkflowInstance>, EngineError> {
        Ok(self.executor.store().list().await.map_err(store_error)?)
    }

    /// Reports the transitions leaving an instance's current state and which
    /// of their requirements are met.
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound` for unknown instances and a validation
    /// error if the instance's entity no longer exists.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn available_transitions(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> dealflow_core::Result<Vec<TransitionReport>, EngineError> {
        self.get_status(instance_id).await?;
        Ok(self
            .executor
            .available_transitions(instance_id)
            .await
            .map_err(EngineError::from)?)
    }

    /// Agent invocations made on behalf of an instance, oldest first.
    pub async fn invocations(&self, instance_id: WorkflowInstanceId) -> Vec<AgentInvocation> {
        self.executor.gateway().list_for_instance(instance_id).await
    }

    /// Side-effect tasks created for an instance.
    pub async fn side_effects(&self, instance_id: WorkflowInstanceId) -> Vec<SideEffectTask> {
        self.executor.dispatcher().list_for_instance(instance_id).await
    }

    /// Streams lifecycle events of every instance.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope<LifecycleEvent>> {
        self.events.subscribe()
    }

    /// Returns current resource consumption against the configured limits.
    #[must_use]
    pub fn budget(&self) -> BudgetSnapshot {
        self.executor.guard().snapshot()
    }

    async fn live_instance(
        &self,
        instance_id: WorkflowInstanceId,
    ) -> dealflow_core::Result<WorkflowInstance, EngineError> {
        let instance = self.get_status(instance_id).await?;
        if instance.is_terminal() {
            return Err(EngineError::InstanceTerminal {
                instance_id,
                status: instance.status,
            }
            .into());
        }
        Ok(instance)
    }

    async fn record_agent_result(
        &self,
        instance: &WorkflowInstance,
        idempotency_key: IdempotencyKey,
        result: Result<JsonValue, String>,
    ) -> dealflow_core::Result<(), EngineError> {
        let unknown = || EngineError::UnknownInvocation {
            instance_id: instance.id,
            idempotency_key: idempotency_key.clone(),
        };
        let gateway = self.executor.gateway();
        let invocation = gateway
            .get(&idempotency_key)
            .await
            .filter(|inv| inv.instance_id == instance.id)
            .ok_or_else(unknown)?;

        let outcome = match result {
            Ok(value) => AgentOutcome::Succeeded(value),
            Err(reason) => AgentOutcome::Failed(InvocationError::Rejected {
                agent: invocation.agent_name.clone(),
                reason,
            }),
        };
        match gateway
            .record_result(&idempotency_key, outcome)
            .await
            .map_err(|_| unknown())?
        {
            ResultDisposition::Applied => {
                info!(agent = %invocation.agent_name, key = %idempotency_key, "agent result recorded");
                self.enqueue(
                    instance.id,
                    StepTrigger::AgentCompleted { idempotency_key },
                )
            }
            ResultDisposition::Discarded => {
                debug!(key = %idempotency_key, "late agent result discarded");
                Ok(())
            }
        }
    }

    fn enqueue(
        &self,
        instance_id: WorkflowInstanceId,
        trigger: StepTrigger,
    ) -> dealflow_core::Result<(), EngineError> {
        Ok(self
            .scheduler
            .enqueue(instance_id, trigger)
            .map_err(scheduler_error)?)
    }
}

fn store_error(err: StoreError) -> EngineError {
    match err {
        StoreError::ActiveInstanceExists {
            entity_id,
            instance_id,
        } => EngineError::ActiveInstanceExists {
            entity_id,
            instance_id,
        },
        StoreError::NotFound { instance_id } => EngineError::InstanceNotFound { instance_id },
        other => EngineError::from(StepError::from(other)),
    }
}

fn scheduler_error(err: SchedulerError) -> EngineError {
    EngineError::Scheduler {
        reason: err.to_string(),
    }
}
