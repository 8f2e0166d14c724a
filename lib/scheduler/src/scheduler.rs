//! The worker pool that drives instances forward.
//!
//! Steps for different instances run concurrently up to the worker limit.
//! Steps for the same instance never overlap: the queue parks triggers that
//! arrive while a step is in flight and releases them when it finishes.

use crate::error::SchedulerError;
use crate::queue::StepQueue;
use dealflow_core::{RetryPolicy, WakeSource, Wakeup, WorkflowInstanceId};
use dealflow_guard::ResourceKind;
use dealflow_workflow::{Executor, StepError, StepOutcome, StepTrigger};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Scheduler tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Concurrent steps. Defaults to the guard's CPU limit.
    pub workers: Option<usize>,
    /// Backoff after `ResourceExhausted` when the guard gives no hint.
    pub backpressure: RetryPolicy,
    /// Backoff after version conflicts and repository errors.
    pub transient_retry: RetryPolicy,
    /// Consecutive conflicts or repository errors tolerated before the
    /// instance is failed. Resource exhaustion never fails an instance.
    pub max_transient_retries: u32,
    /// How often instances are checked for overstaying their state. `None`
    /// disables the check.
    pub stage_check_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            backpressure: RetryPolicy {
                initial_backoff_ms: 500,
                ..RetryPolicy::default()
            },
            transient_retry: RetryPolicy::default(),
            max_transient_retries: 5,
            stage_check_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl SchedulerConfig {
    /// Delay before requeueing a step that failed with `err` for the
    /// `attempt`-th consecutive time.
    #[must_use]
    pub fn retry_delay(&self, err: &StepError, attempt: u32) -> Duration {
        match err {
            StepError::ResourceExhausted { retry_after, .. } => match retry_after {
                Some(after) => (*after).min(Duration::from_millis(self.backpressure.max_backoff_ms)),
                None => self.backpressure.backoff_for(attempt),
            },
            _ => self.transient_retry.backoff_for(attempt),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Failures {
    transient: u32,
    backpressure: u32,
}

#[derive(Debug, Default)]
struct State {
    queue: StepQueue,
    failures: HashMap<WorkflowInstanceId, Failures>,
}

struct Shared {
    executor: Executor,
    config: SchedulerConfig,
    capacity: usize,
    workers: Arc<Semaphore>,
    state: Mutex<State>,
    notify: Notify,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What to do with an instance after its step returned.
enum Disposition {
    Done,
    Requeue(StepTrigger, Instant),
    GiveUp(StepError),
}

/// Runs queued steps on a bounded pool of workers.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.shared.capacity)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a scheduler for `executor`. Nothing runs until
    /// [`spawn`](Self::spawn).
    #[must_use]
    pub fn new(executor: Executor, config: SchedulerConfig) -> Self {
        let capacity = config
            .workers
            .unwrap_or_else(|| {
                usize::try_from(executor.guard().limits().limit(ResourceKind::Cpu))
                    .unwrap_or(usize::MAX)
            })
            .clamp(1, Semaphore::MAX_PERMITS);
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                executor,
                config,
                capacity,
                workers: Arc::new(Semaphore::new(capacity)),
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                shutdown,
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the executor steps run on.
    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.shared.executor
    }

    /// The maximum number of steps running at once.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.shared.capacity
    }

    /// Queues a step for an instance.
    ///
    /// # Errors
    ///
    /// Returns `ShutDown` once [`shutdown`](Self::shutdown) has been called.
    pub fn enqueue(
        &self,
        instance_id: WorkflowInstanceId,
        trigger: StepTrigger,
    ) -> Result<(), SchedulerError> {
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }
        let queued = self.shared.lock().queue.push(instance_id, trigger);
        debug!(instance_id = %instance_id, queued, "step enqueued");
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Queues a [`StepTrigger::Recovery`] step for every non-terminal
    /// instance in the store. Returns how many were queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed or the scheduler has
    /// been shut down.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let instances = self.shared.executor.store().list().await.map_err(|e| {
            SchedulerError::RecoveryFailed {
                reason: e.to_string(),
            }
        })?;
        let mut recovered = 0;
        for instance in instances.iter().filter(|i| !i.is_terminal()) {
            self.enqueue(instance.id, StepTrigger::Recovery)?;
            recovered += 1;
        }
        info!(recovered, "recovered non-terminal instances");
        Ok(recovered)
    }

    /// Returns true when nothing is queued or running.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.shared.lock();
        state.queue.is_empty() && state.queue.in_flight_count() == 0
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Starts the dispatch loop, the stage-duration check and, when given,
    /// the wakeup listener that turns agent and side-effect completions
    /// into steps.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler is already running or shut down.
    pub fn spawn(
        &self,
        wakeups: Option<mpsc::UnboundedReceiver<Wakeup>>,
    ) -> Result<JoinHandle<()>, SchedulerError> {
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }
        let dispatcher = self.clone();
        let listener = self.clone();
        let stages = self.clone();
        Ok(tokio::spawn(async move {
            match wakeups {
                Some(wakeups) => {
                    tokio::join!(
                        dispatcher.dispatch_loop(),
                        listener.listen(wakeups),
                        stages.check_stages()
                    );
                }
                None => {
                    tokio::join!(dispatcher.dispatch_loop(), stages.check_stages());
                }
            }
        }))
    }

    /// Stops accepting work. Steps already running finish on their own.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        self.shared.notify.notify_waiters();
        info!("scheduler shutting down");
    }

    async fn dispatch_loop(self) {
        let mut shutdown = self.shared.shutdown.subscribe();
        info!(workers = self.shared.capacity, "scheduler started");
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let permit = tokio::select! {
                permit = Arc::clone(&self.shared.workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let (next, deadline) = {
                let mut state = self.shared.lock();
                let next = state.queue.pop_ready(Instant::now());
                (next, state.queue.next_deadline())
            };
            if let Some((instance_id, trigger)) = next {
                let worker = self.clone();
                tokio::spawn(async move { worker.run_step(instance_id, trigger, permit).await });
                continue;
            }

            drop(permit);
            tokio::select! {
                () = self.shared.notify.notified() => {}
                () = sleep_until(deadline) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("scheduler stopped");
    }

    async fn listen(self, mut wakeups: mpsc::UnboundedReceiver<Wakeup>) {
        let mut shutdown = self.shared.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }
        loop {
            tokio::select! {
                wakeup = wakeups.recv() => {
                    let Some(wakeup) = wakeup else { break };
                    let trigger = match wakeup.source {
                        WakeSource::Agent(idempotency_key) => {
                            StepTrigger::AgentCompleted { idempotency_key }
                        }
                        WakeSource::SideEffect(idempotency_key) => {
                            StepTrigger::SideEffectSettled { idempotency_key }
                        }
                        WakeSource::External => StepTrigger::EntityUpdated,
                    };
                    if self.enqueue(wakeup.instance_id, trigger).is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("wakeup listener stopped");
    }

    async fn check_stages(self) {
        let Some(period) = self.shared.config.stage_check_interval else {
            return;
        };
        let mut shutdown = self.shared.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }
        let mut ticks = tokio::time::interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    match self.shared.executor.check_stage_durations().await {
                        Ok(raised) if !raised.is_empty() => {
                            info!(raised = raised.len(), "overdue instances reported");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "stage duration check failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("stage duration check stopped");
    }

    #[instrument(skip(self, _permit), fields(instance_id = %instance_id, trigger = %trigger))]
    async fn run_step(
        &self,
        instance_id: WorkflowInstanceId,
        trigger: StepTrigger,
        _permit: OwnedSemaphorePermit,
    ) {
        let executor = &self.shared.executor;
        let result = match executor.guard().acquire(ResourceKind::Cpu, 1) {
            Ok(_cpu) => executor.execute_step(instance_id, trigger.clone()).await,
            Err(e) => Err(StepError::from(e)),
        };

        let disposition = self.dispose(instance_id, trigger, result);
        let follow_up = match disposition {
            Disposition::Done => None,
            Disposition::Requeue(trigger, at) => Some((trigger, at)),
            Disposition::GiveUp(err) => {
                error!(error = %err, "giving up on instance after repeated transient errors");
                if let Err(e) = executor.fail(instance_id, &err).await {
                    warn!(error = %e, "failed to record failure");
                }
                None
            }
        };

        {
            let mut state = self.shared.lock();
            let parked = state.queue.complete(instance_id);
            if let Some((trigger, at)) = follow_up {
                state.queue.push_at(instance_id, trigger, at);
            }
            if let Some(trigger) = parked {
                state.queue.push(instance_id, trigger);
            }
        }
        self.shared.notify.notify_one();
    }

    fn dispose(
        &self,
        instance_id: WorkflowInstanceId,
        trigger: StepTrigger,
        result: Result<StepOutcome, StepError>,
    ) -> Disposition {
        let config = &self.shared.config;
        let mut state = self.shared.lock();
        match result {
            Ok(outcome) => {
                state.failures.remove(&instance_id);
                match &outcome {
                    StepOutcome::Transitioned { from, to, status } => {
                        debug!(%from, %to, %status, "step transitioned");
                    }
                    StepOutcome::Failed { error } => {
                        warn!(%error, "step failed the instance");
                    }
                    StepOutcome::Suspended { state } => debug!(%state, "step suspended"),
                    StepOutcome::NoOp => debug!("instance already terminal"),
                }
                if outcome.needs_follow_up() {
                    Disposition::Requeue(StepTrigger::Continue, Instant::now())
                } else {
                    Disposition::Done
                }
            }
            Err(err) if err.is_transient() => {
                let failures = state.failures.entry(instance_id).or_default();
                let attempt = if matches!(err, StepError::ResourceExhausted { .. }) {
                    failures.backpressure += 1;
                    failures.backpressure
                } else {
                    failures.transient += 1;
                    if failures.transient > config.max_transient_retries {
                        state.failures.remove(&instance_id);
                        return Disposition::GiveUp(err);
                    }
                    failures.transient
                };
                let delay = config.retry_delay(&err, attempt);
                warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "requeueing step");
                Disposition::Requeue(trigger, Instant::now() + delay)
            }
            Err(err) => {
                state.failures.remove(&instance_id);
                warn!(error = %err, "step rejected");
                Disposition::Done
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dealflow_agent::{Agent, AgentCallError, AgentGateway, AgentRequest};
    use dealflow_guard::{Guard, PermissionGrants, ResourceLimits, scopes};
    use dealflow_integration::{
        Dispatcher, HandlerError, SideEffectHandler, SideEffectKind, SideEffectRequest,
        SideEffectSpec,
    };
    use dealflow_workflow::builtin::LEAD_SCORER;
    use dealflow_workflow::{
        BroadcastEventSink, EntityType, ErrorKind, ExecutorConfig, GuardCondition,
        InMemoryEntityRepository, InMemoryInstanceStore, InstanceStatus, InstanceStore,
        LifecycleEvent, OverdueSeverity, RegistrySettings, StageDuration, State, Transition,
        WorkflowDefinition, WorkflowInstance, WorkflowRegistry,
    };
    use serde_json::{Value as JsonValue, json};

    struct FixedScore(i64);

    #[async_trait]
    impl Agent for FixedScore {
        fn name(&self) -> &str {
            LEAD_SCORER
        }

        async fn invoke(&self, _request: &AgentRequest) -> Result<JsonValue, AgentCallError> {
            Ok(json!({ "score": self.0 }))
        }
    }

    /// Holds notifications for one entity until released; delivers the rest.
    struct HeldNotifications {
        held_entity: String,
        gate: Semaphore,
        delivered: Mutex<Vec<String>>,
    }

    impl HeldNotifications {
        fn new(held_entity: &str) -> Arc<Self> {
            Arc::new(Self {
                held_entity: held_entity.to_string(),
                gate: Semaphore::new(0),
                delivered: Mutex::new(Vec::new()),
            })
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SideEffectHandler for HeldNotifications {
        fn kind(&self) -> SideEffectKind {
            SideEffectKind::Notification
        }

        async fn execute(&self, request: &SideEffectRequest) -> Result<(), HandlerError> {
            let entity = request.payload["entity_id"].as_str().unwrap_or_default().to_string();
            if entity == self.held_entity {
                let _open = self.gate.acquire().await;
            }
            self.delivered.lock().unwrap().push(entity);
            Ok(())
        }
    }

    /// Notes when each notification reached the handler.
    #[derive(Default)]
    struct TimedNotifications {
        calls: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl SideEffectHandler for TimedNotifications {
        fn kind(&self) -> SideEffectKind {
            SideEffectKind::Notification
        }

        async fn execute(&self, _request: &SideEffectRequest) -> Result<(), HandlerError> {
            self.calls.lock().unwrap().push(Instant::now());
            Ok(())
        }
    }

    /// `NEW → NOTIFIED`, one notification and no agent.
    fn notify_only_registry() -> WorkflowRegistry {
        let mut def = WorkflowDefinition::new(EntityType::Lead, "NEW");
        def.add_state(State::new("NEW")).unwrap();
        def.add_state(State::terminal("NOTIFIED")).unwrap();
        def.add_transition(
            Transition::automatic("NEW", "NOTIFIED", GuardCondition::Always)
                .with_permission(scopes::WORKFLOW_EXECUTE)
                .with_side_effect(SideEffectSpec::notification("lead_received")),
        )
        .unwrap();
        WorkflowRegistry::new([def]).unwrap()
    }

    struct Fixture {
        scheduler: Scheduler,
        store: InMemoryInstanceStore,
        entities: InMemoryEntityRepository,
        events: BroadcastEventSink,
        guard: Guard,
        wakeups: Option<mpsc::UnboundedReceiver<Wakeup>>,
    }

    fn fixture(config: SchedulerConfig) -> Fixture {
        fixture_with(config, RegistrySettings::default(), Vec::new())
    }

    fn fixture_with(
        config: SchedulerConfig,
        settings: RegistrySettings,
        handlers: Vec<Arc<dyn SideEffectHandler>>,
    ) -> Fixture {
        fixture_from(
            config,
            WorkflowRegistry::from_settings(&settings).unwrap(),
            ResourceLimits::default(),
            handlers,
        )
    }

    fn fixture_from(
        config: SchedulerConfig,
        registry: WorkflowRegistry,
        limits: ResourceLimits,
        handlers: Vec<Arc<dyn SideEffectHandler>>,
    ) -> Fixture {
        let guard = Guard::new(PermissionGrants::builtin(), limits);
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway = AgentGateway::new(guard.clone())
            .with_agent(Arc::new(FixedScore(85)))
            .with_wakeups(tx.clone());
        let dispatcher = handlers.into_iter().fold(
            Dispatcher::new(guard.clone())
                .with_retry(RetryPolicy::immediate(1))
                .with_wakeups(tx),
            Dispatcher::with_handler,
        );
        let registry = Arc::new(registry);
        let store = InMemoryInstanceStore::new();
        let entities = InMemoryEntityRepository::new();
        let events = BroadcastEventSink::default();
        let executor = Executor::new(
            registry,
            Arc::new(store.clone()),
            Arc::new(entities.clone()),
            gateway,
            dispatcher,
            guard.clone(),
        )
        .with_config(ExecutorConfig {
            agent_retry: RetryPolicy::immediate(3),
            ..ExecutorConfig::default()
        })
        .with_event_sink(Arc::new(events.clone()));
        Fixture {
            scheduler: Scheduler::new(executor, config),
            store,
            entities,
            events,
            guard,
            wakeups: Some(rx),
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            workers: Some(4),
            backpressure: RetryPolicy::immediate(1),
            transient_retry: RetryPolicy::immediate(1),
            max_transient_retries: 2,
            stage_check_interval: None,
        }
    }

    async fn lead(fixture: &Fixture, entity_id: &str) -> WorkflowInstanceId {
        fixture
            .entities
            .upsert(EntityType::Lead, entity_id, json!({ "name": entity_id }))
            .await;
        let instance = WorkflowInstance::new(EntityType::Lead, entity_id, "NEW");
        let id = instance.id;
        fixture.store.insert(instance).await.unwrap();
        id
    }

    async fn wait_terminal(store: &InMemoryInstanceStore, id: WorkflowInstanceId) -> WorkflowInstance {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let instance = store.get(id).await.unwrap().unwrap();
                if instance.is_terminal() {
                    return instance;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[test]
    fn workers_default_to_the_cpu_limit() {
        let f = fixture(SchedulerConfig::default());
        assert_eq!(f.scheduler.workers(), 4);
    }

    #[test]
    fn resource_hints_bound_the_backpressure_delay() {
        let config = SchedulerConfig::default();
        let hinted = StepError::ResourceExhausted {
            resource: ResourceKind::ApiRate,
            retry_after: Some(Duration::from_millis(750)),
        };
        assert_eq!(config.retry_delay(&hinted, 1), Duration::from_millis(750));

        let huge = StepError::ResourceExhausted {
            resource: ResourceKind::ApiRate,
            retry_after: Some(Duration::from_secs(600)),
        };
        assert_eq!(
            config.retry_delay(&huge, 1),
            Duration::from_millis(config.backpressure.max_backoff_ms)
        );

        let unhinted = StepError::ResourceExhausted {
            resource: ResourceKind::Memory,
            retry_after: None,
        };
        assert!(config.retry_delay(&unhinted, 1) >= Duration::from_millis(500));
        assert!(config.retry_delay(&unhinted, 2) >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn leads_run_to_completion_concurrently() {
        let mut f = fixture(fast_config());
        let first = lead(&f, "lead-1").await;
        let second = lead(&f, "lead-2").await;
        let handle = f.scheduler.spawn(f.wakeups.take()).unwrap();

        f.scheduler.enqueue(first, StepTrigger::Start).unwrap();
        f.scheduler.enqueue(second, StepTrigger::Start).unwrap();

        for id in [first, second] {
            let instance = wait_terminal(&f.store, id).await;
            assert_eq!(instance.status, InstanceStatus::Completed);
            assert_eq!(instance.current_state, "QUALIFIED");
            assert_eq!(instance.history.len(), 3);
        }

        f.scheduler.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn slow_side_effects_do_not_hold_the_only_worker() {
        let notifications = HeldNotifications::new("lead-a");
        let mut f = fixture_with(
            SchedulerConfig {
                workers: Some(1),
                ..fast_config()
            },
            RegistrySettings::default(),
            vec![notifications.clone() as Arc<dyn SideEffectHandler>],
        );
        let held = lead(&f, "lead-a").await;
        let free = lead(&f, "lead-b").await;
        let handle = f.scheduler.spawn(f.wakeups.take()).unwrap();

        f.scheduler.enqueue(held, StepTrigger::Start).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let instance = f.store.get(held).await.unwrap().unwrap();
                if instance.current_state == "SCORED" && instance.awaiting.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        f.scheduler.enqueue(free, StepTrigger::Start).unwrap();
        let done = wait_terminal(&f.store, free).await;
        assert_eq!(done.current_state, "QUALIFIED");
        assert_eq!(notifications.delivered(), vec!["lead-b".to_string()]);

        let waiting = f.store.get(held).await.unwrap().unwrap();
        assert_eq!(waiting.status, InstanceStatus::SuspendedWaiting);
        assert_eq!(waiting.current_state, "SCORED");

        notifications.gate.add_permits(1);
        let released = wait_terminal(&f.store, held).await;
        assert_eq!(released.current_state, "QUALIFIED");
        assert_eq!(
            notifications.delivered(),
            vec!["lead-b".to_string(), "lead-a".to_string()]
        );

        f.scheduler.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn api_rate_spreads_side_effect_steps_across_windows() {
        let window = Duration::from_millis(400);
        let notifications = Arc::new(TimedNotifications::default());
        let opened = Instant::now();
        let mut f = fixture_from(
            SchedulerConfig {
                backpressure: RetryPolicy {
                    initial_backoff_ms: 10,
                    max_backoff_ms: 1_000,
                    ..RetryPolicy::immediate(1)
                },
                ..fast_config()
            },
            notify_only_registry(),
            ResourceLimits::default().with_api_rate(5, window),
            vec![notifications.clone() as Arc<dyn SideEffectHandler>],
        );
        let mut ids = Vec::new();
        for n in 0..10 {
            ids.push(lead(&f, &format!("lead-{n}")).await);
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let guard = f.guard.clone();
        let sampler = tokio::spawn(async move {
            let mut peak = 0;
            let mut samples = 0;
            while !*stop_rx.borrow() {
                let usage = guard.snapshot().usage(ResourceKind::ApiRate).unwrap();
                assert_eq!(usage.limit, 5);
                peak = peak.max(usage.consumed);
                samples += 1;
                let _ = tokio::time::timeout(Duration::from_millis(2), stop_rx.changed()).await;
            }
            (peak, samples)
        });

        let handle = f.scheduler.spawn(f.wakeups.take()).unwrap();
        for id in &ids {
            f.scheduler.enqueue(*id, StepTrigger::Start).unwrap();
        }
        for id in ids {
            let done = wait_terminal(&f.store, id).await;
            assert_eq!(done.status, InstanceStatus::Completed);
            assert_eq!(done.current_state, "NOTIFIED");
        }

        stop_tx.send_replace(true);
        let (peak, samples) = sampler.await.unwrap();
        assert!(samples > 10);
        assert!(peak <= 5, "api_rate consumed {peak} of 5");

        let calls = notifications.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 10);
        let (first, second): (Vec<&_>, Vec<&_>) = calls
            .iter()
            .partition(|at| at.duration_since(opened) < window);
        assert_eq!(first.len(), 5);
        assert_eq!(second.len(), 5);

        f.scheduler.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn overdue_instances_are_reported_on_the_check_interval() {
        let settings = RegistrySettings {
            stage_durations: HashMap::from([(
                "DRAFT".to_string(),
                StageDuration {
                    target_ms: None,
                    max_ms: Some(0),
                },
            )]),
            ..RegistrySettings::default()
        };
        let mut f = fixture_with(
            SchedulerConfig {
                stage_check_interval: Some(Duration::from_millis(10)),
                ..fast_config()
            },
            settings,
            Vec::new(),
        );
        f.entities
            .upsert(EntityType::Assessment, "as-1", json!({ "submitted": false }))
            .await;
        let instance = WorkflowInstance::new(EntityType::Assessment, "as-1", "DRAFT");
        let id = instance.id;
        f.store.insert(instance).await.unwrap();
        let mut events = f.events.subscribe();
        let handle = f.scheduler.spawn(f.wakeups.take()).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.payload().name() == "stage_overdue" {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        match event.payload() {
            LifecycleEvent::StageOverdue {
                instance_id,
                severity,
                ..
            } => {
                assert_eq!(*instance_id, id);
                assert_eq!(*severity, OverdueSeverity::Critical);
            }
            other => panic!("unexpected event {other:?}"),
        }

        f.scheduler.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn repeated_conflicts_fail_the_instance() {
        let mut f = fixture(fast_config());
        let id = lead(&f, "lead-1").await;
        let _held = f
            .store
            .acquire_lease(id, Duration::from_secs(60))
            .await
            .unwrap();
        let handle = f.scheduler.spawn(f.wakeups.take()).unwrap();
        f.scheduler.enqueue(id, StepTrigger::Start).unwrap();

        let instance = wait_terminal(&f.store, id).await;
        assert_eq!(instance.status, InstanceStatus::Failed);
        assert_eq!(
            instance.last_error.unwrap().kind,
            ErrorKind::ConcurrencyConflict
        );
        assert!(instance.history.is_empty());

        f.scheduler.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn recover_queues_only_live_instances() {
        let f = fixture(fast_config());
        lead(&f, "lead-1").await;
        let mut done = WorkflowInstance::new(EntityType::Lead, "lead-2", "QUALIFIED");
        done.status = InstanceStatus::Completed;
        f.store.insert(done).await.unwrap();

        assert_eq!(f.scheduler.recover().await.unwrap(), 1);
        assert!(!f.scheduler.is_idle());
    }

    #[tokio::test]
    async fn spawn_is_single_shot_and_shutdown_refuses_work() {
        let mut f = fixture(fast_config());
        let handle = f.scheduler.spawn(f.wakeups.take()).unwrap();
        assert_eq!(
            f.scheduler.spawn(None).unwrap_err(),
            SchedulerError::AlreadyRunning
        );

        f.scheduler.shutdown();
        handle.await.unwrap();
        assert_eq!(
            f.scheduler
                .enqueue(WorkflowInstanceId::new(), StepTrigger::Start)
                .unwrap_err(),
            SchedulerError::ShutDown
        );
    }
}
