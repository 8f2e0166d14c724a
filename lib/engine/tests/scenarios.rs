//! End-to-end runs of the built-in workflows through the engine.

use async_trait::async_trait;
use dealflow_agent::{Agent, AgentCallError, AgentRequest, InvocationStatus};
use dealflow_core::{IdempotencyKey, RetryPolicy, WorkflowInstanceId};
use dealflow_engine::{EngineConfig, EngineError, ExternalEvent, WorkflowEngine};
use dealflow_guard::{Guard, PermissionGrants, ResourceKind, ResourceLimits};
use dealflow_integration::{
    DispatchError, Dispatcher, HandlerError, SideEffectHandler, SideEffectKind,
    SideEffectRequest, SideEffectSpec, SideEffectStatus, SideEffectTask,
};
use dealflow_workflow::builtin::{ASSESSMENT_EVALUATOR, DEAL_SCREENER, LEAD_SCORER};
use dealflow_workflow::{
    EntityType, ErrorKind, InMemoryEntityRepository, InstanceStatus, LifecycleEvent, StepError,
    StepOutcome, StepTrigger, StepTimeouts, WorkflowInstance,
};
use serde_json::{Value as JsonValue, json};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;

/// Returns a fixed score and counts its calls.
struct ScoringAgent {
    name: &'static str,
    score: i64,
    calls: AtomicU32,
}

impl ScoringAgent {
    fn new(name: &'static str, score: i64) -> Arc<Self> {
        Arc::new(Self {
            name,
            score,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Agent for ScoringAgent {
    fn name(&self) -> &str {
        self.name
    }

    async fn invoke(&self, _request: &AgentRequest) -> Result<JsonValue, AgentCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "score": self.score }))
    }
}

/// Sleeps far past any configured timeout.
struct HangingAgent {
    name: &'static str,
    calls: AtomicU32,
}

#[async_trait]
impl Agent for HangingAgent {
    fn name(&self) -> &str {
        self.name
    }

    async fn invoke(&self, _request: &AgentRequest) -> Result<JsonValue, AgentCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!({ "score": 100 }))
    }
}

/// Signals when called, then holds its answer until released.
struct GatedAgent {
    name: &'static str,
    started: Notify,
    release: Notify,
    finished: Notify,
}

#[async_trait]
impl Agent for GatedAgent {
    fn name(&self) -> &str {
        self.name
    }

    async fn invoke(&self, _request: &AgentRequest) -> Result<JsonValue, AgentCallError> {
        self.started.notify_one();
        self.release.notified().await;
        self.finished.notify_one();
        Ok(json!({ "score": 95 }))
    }
}

/// Records every delivered key.
#[derive(Default)]
struct RecordingHandler {
    delivered: Mutex<Vec<IdempotencyKey>>,
}

#[async_trait]
impl SideEffectHandler for RecordingHandler {
    fn kind(&self) -> SideEffectKind {
        SideEffectKind::Notification
    }

    async fn execute(&self, request: &SideEffectRequest) -> Result<(), HandlerError> {
        self.delivered
            .lock()
            .unwrap()
            .push(request.idempotency_key.clone());
        Ok(())
    }
}

async fn wait_for(
    engine: &WorkflowEngine,
    id: WorkflowInstanceId,
    done: impl Fn(&WorkflowInstance) -> bool,
) -> WorkflowInstance {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let instance = engine.get_status(id).await.unwrap();
            if done(&instance) {
                return instance;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap()
}

fn transitions(instance: &WorkflowInstance) -> Vec<(&str, &str)> {
    instance
        .history
        .iter()
        .map(|r| (r.from_state.as_str(), r.to_state.as_str()))
        .collect()
}

#[tokio::test]
async fn qualified_lead_has_exactly_three_transitions() {
    let entities = InMemoryEntityRepository::new();
    entities
        .upsert(EntityType::Lead, "lead-1", json!({ "company": "Acme" }))
        .await;
    let scorer = ScoringAgent::new(LEAD_SCORER, 80);
    let notifications = Arc::new(RecordingHandler::default());
    let engine = WorkflowEngine::builder(EngineConfig::default())
        .with_entity_repository(Arc::new(entities))
        .with_agent(scorer.clone())
        .with_handler(notifications.clone())
        .build()
        .unwrap();
    let mut events = engine.subscribe();
    let handle = engine.spawn().await.unwrap();

    let id = engine.start("lead-1", EntityType::Lead).await.unwrap();
    let done = wait_for(&engine, id, WorkflowInstance::is_terminal).await;

    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(done.current_state, "QUALIFIED");
    assert_eq!(
        transitions(&done),
        vec![
            ("NEW", "SCORING"),
            ("SCORING", "SCORED"),
            ("SCORED", "QUALIFIED")
        ]
    );
    let sequences: Vec<u64> = done.history.iter().map(|r| r.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));

    let definition = engine
        .executor()
        .registry()
        .get(EntityType::Lead)
        .unwrap()
        .clone();
    assert!(
        done.history
            .iter()
            .all(|r| definition.contains_state(&r.to_state))
    );
    assert_eq!(scorer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(notifications.delivered.lock().unwrap().len(), 1);

    let mut names = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        if envelope.payload.instance_id() == id {
            names.push(envelope.payload.name());
        }
    }
    assert_eq!(
        names,
        vec!["state_changed", "state_changed", "state_changed", "completed"]
    );

    engine.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn assessment_agent_timing_out_three_times_fails_the_instance() {
    let entities = InMemoryEntityRepository::new();
    entities
        .upsert(EntityType::Assessment, "asmt-1", json!({ "submitted": true }))
        .await;
    let evaluator = Arc::new(HangingAgent {
        name: ASSESSMENT_EVALUATOR,
        calls: AtomicU32::new(0),
    });
    let config = EngineConfig {
        agent_retry: RetryPolicy::immediate(3),
        timeouts: StepTimeouts {
            agent_ms: 20,
            ..StepTimeouts::default()
        },
        ..EngineConfig::default()
    };
    let engine = WorkflowEngine::builder(config)
        .with_entity_repository(Arc::new(entities))
        .with_agent(evaluator.clone())
        .build()
        .unwrap();
    let handle = engine.spawn().await.unwrap();

    let id = engine
        .start("asmt-1", EntityType::Assessment)
        .await
        .unwrap();
    let failed = wait_for(&engine, id, WorkflowInstance::is_terminal).await;

    assert_eq!(failed.status, InstanceStatus::Failed);
    assert_eq!(failed.current_state, "IN_REVIEW");
    assert_eq!(failed.last_error.unwrap().kind, ErrorKind::AgentInvocation);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(evaluator.calls.load(Ordering::SeqCst), 3);
    let invocations = engine.invocations(id).await;
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].attempt_count, 3);

    engine.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn deal_cancelled_during_screening_discards_the_late_result() {
    let entities = InMemoryEntityRepository::new();
    entities
        .upsert(EntityType::Deal, "deal-1", json!({ "deal_lead": "ana" }))
        .await;
    let screener = Arc::new(GatedAgent {
        name: DEAL_SCREENER,
        started: Notify::new(),
        release: Notify::new(),
        finished: Notify::new(),
    });
    let engine = WorkflowEngine::builder(EngineConfig::default())
        .with_entity_repository(Arc::new(entities))
        .with_agent(screener.clone())
        .build()
        .unwrap();
    let mut events = engine.subscribe();
    let handle = engine.spawn().await.unwrap();

    let id = engine.start("deal-1", EntityType::Deal).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), screener.started.notified())
        .await
        .unwrap();

    let cancelled = engine.cancel(id).await.unwrap();
    assert_eq!(cancelled.status, InstanceStatus::Cancelled);
    let history_at_cancel = cancelled.history.clone();
    assert_eq!(transitions(&cancelled), vec![("SOURCED", "NEGOTIATION")]);

    screener.release.notify_one();
    tokio::time::timeout(Duration::from_secs(5), screener.finished.notified())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let after = engine.get_status(id).await.unwrap();
    assert_eq!(after.status, InstanceStatus::Cancelled);
    assert_eq!(after.current_state, "NEGOTIATION");
    assert_eq!(after.history, history_at_cancel);
    assert!(after.agent_results.is_empty());

    let invocations = engine.invocations(id).await;
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].status, InvocationStatus::Cancelled);
    assert!(invocations[0].result.is_none());

    let err = engine
        .advance(id, ExternalEvent::EntityUpdated)
        .await
        .unwrap_err();
    assert!(matches!(
        err.current_context(),
        EngineError::InstanceTerminal { .. }
    ));

    let mut names = Vec::new();
    while let Ok(envelope) = events.try_recv() {
        names.push(envelope.payload.name());
    }
    assert_eq!(names, vec!["state_changed", "cancelled"]);

    engine.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn api_rate_budget_admits_five_per_window() {
    let guard = Guard::new(
        PermissionGrants::builtin(),
        ResourceLimits::default().with_api_rate(5, Duration::from_millis(300)),
    );
    let handler = Arc::new(RecordingHandler::default());
    let dispatcher = Dispatcher::new(guard.clone()).with_handler(handler.clone());
    let instance_id = WorkflowInstanceId::new();
    let tasks: Vec<SideEffectTask> = (0..10)
        .map(|i| {
            let spec = SideEffectSpec::notification("lead_qualified");
            SideEffectTask::new(
                instance_id,
                &spec,
                json!({ "n": i }),
                IdempotencyKey::from_raw(format!("burst#{i}")),
            )
        })
        .collect();

    let mut burst = JoinSet::new();
    for task in tasks.clone() {
        let dispatcher = dispatcher.clone();
        burst.spawn(async move { dispatcher.dispatch(task).await });
    }
    let mut delivered = 0;
    let mut deferred = Vec::new();
    while let Some(result) = burst.join_next().await {
        match result.unwrap() {
            Ok(task) => {
                assert_eq!(task.status, SideEffectStatus::Succeeded);
                delivered += 1;
            }
            Err(DispatchError::ResourceExhausted {
                resource,
                retry_after,
            }) => {
                assert_eq!(resource, ResourceKind::ApiRate);
                deferred.push(retry_after.unwrap());
            }
            Err(other) => panic!("unexpected dispatch error: {other}"),
        }
    }
    assert_eq!(delivered, 5);
    assert_eq!(deferred.len(), 5);
    assert_eq!(handler.delivered.lock().unwrap().len(), 5);
    let usage = guard.snapshot().usage(ResourceKind::ApiRate).unwrap();
    assert_eq!(usage.consumed, 5);

    let pending: Vec<SideEffectTask> = {
        let mut pending = Vec::new();
        for task in &tasks {
            let recorded = dispatcher.get(&task.idempotency_key).await.unwrap();
            if recorded.status == SideEffectStatus::Pending {
                pending.push(recorded);
            }
        }
        pending
    };
    assert_eq!(pending.len(), 5);

    // Still inside the window: nothing more gets through.
    assert!(matches!(
        dispatcher.dispatch(pending[0].clone()).await,
        Err(DispatchError::ResourceExhausted { .. })
    ));

    let wait = deferred.into_iter().max().unwrap();
    tokio::time::sleep(wait + Duration::from_millis(20)).await;
    for task in pending {
        let settled = dispatcher.dispatch(task).await.unwrap();
        assert_eq!(settled.status, SideEffectStatus::Succeeded);
        let usage = guard.snapshot().usage(ResourceKind::ApiRate).unwrap();
        assert!(usage.consumed <= 5);
    }
    assert_eq!(handler.delivered.lock().unwrap().len(), 10);
}

#[tokio::test]
async fn leads_complete_under_a_tight_api_budget() {
    let entities = InMemoryEntityRepository::new();
    for n in 0..3 {
        entities
            .upsert(EntityType::Lead, format!("lead-{n}"), json!({}))
            .await;
    }
    let config = EngineConfig {
        resources: ResourceLimits::default().with_api_rate(2, Duration::from_millis(200)),
        backpressure_delay_ms: 50,
        ..EngineConfig::default()
    };
    let notifications = Arc::new(RecordingHandler::default());
    let engine = WorkflowEngine::builder(config)
        .with_entity_repository(Arc::new(entities))
        .with_agent(ScoringAgent::new(LEAD_SCORER, 75))
        .with_handler(notifications.clone())
        .build()
        .unwrap();
    let handle = engine.spawn().await.unwrap();

    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(
            engine
                .start(&format!("lead-{n}"), EntityType::Lead)
                .await
                .unwrap(),
        );
    }
    for id in ids {
        let done = wait_for(&engine, id, WorkflowInstance::is_terminal).await;
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.history.len(), 3);
    }
    assert_eq!(notifications.delivered.lock().unwrap().len(), 3);

    engine.shutdown();
    handle.await.unwrap();
}

#[tokio::test]
async fn concurrent_steps_fire_a_transition_once() {
    let entities = InMemoryEntityRepository::new();
    entities
        .upsert(EntityType::Deal, "deal-1", json!({ "deal_lead": "ana" }))
        .await;
    let screener = Arc::new(HangingAgent {
        name: DEAL_SCREENER,
        calls: AtomicU32::new(0),
    });
    let engine = WorkflowEngine::builder(EngineConfig::default())
        .with_entity_repository(Arc::new(entities))
        .with_agent(screener.clone())
        .build()
        .unwrap();
    // The scheduler is not running; steps are driven directly.
    let id = engine.start("deal-1", EntityType::Deal).await.unwrap();

    let mut steps = JoinSet::new();
    for _ in 0..16 {
        let executor = engine.executor().clone();
        steps.spawn(async move { executor.execute_step(id, StepTrigger::Start).await });
    }
    let mut fired = 0;
    while let Some(result) = steps.join_next().await {
        match result.unwrap() {
            Ok(StepOutcome::Transitioned { .. }) => fired += 1,
            Ok(_) | Err(StepError::ConcurrencyConflict { .. }) => {}
            Err(other) => panic!("unexpected step error: {other}"),
        }
    }

    assert_eq!(fired, 1);
    let instance = engine.get_status(id).await.unwrap();
    assert_eq!(transitions(&instance), vec![("SOURCED", "NEGOTIATION")]);
    assert!(engine.invocations(id).await.len() <= 1);
}

#[tokio::test]
async fn replayed_steps_reuse_agent_invocations() {
    let entities = InMemoryEntityRepository::new();
    entities
        .upsert(EntityType::Deal, "deal-1", json!({ "deal_lead": "ana" }))
        .await;
    let screener = Arc::new(HangingAgent {
        name: DEAL_SCREENER,
        calls: AtomicU32::new(0),
    });
    let engine = WorkflowEngine::builder(EngineConfig::default())
        .with_entity_repository(Arc::new(entities))
        .with_agent(screener.clone())
        .build()
        .unwrap();
    let id = engine.start("deal-1", EntityType::Deal).await.unwrap();
    let executor = engine.executor();

    executor.execute_step(id, StepTrigger::Start).await.unwrap();
    for _ in 0..3 {
        let outcome = executor
            .execute_step(id, StepTrigger::Recovery)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Suspended {
                state: "NEGOTIATION".to_string()
            }
        );
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.invocations(id).await.len(), 1);
    assert_eq!(screener.calls.load(Ordering::SeqCst), 1);

    let instance = engine.get_status(id).await.unwrap();
    let key = instance.awaiting.unwrap();
    engine
        .advance(
            id,
            ExternalEvent::AgentResult {
                idempotency_key: key.clone(),
                result: json!({ "score": 64 }),
            },
        )
        .await
        .unwrap();
    // A second delivery of the same result is accepted and ignored.
    engine
        .advance(
            id,
            ExternalEvent::AgentResult {
                idempotency_key: key,
                result: json!({ "score": 12 }),
            },
        )
        .await
        .unwrap();

    executor
        .execute_step(id, StepTrigger::Continue)
        .await
        .unwrap();
    let instance = engine.get_status(id).await.unwrap();
    assert_eq!(instance.current_state, "DUE_DILIGENCE");
    assert_eq!(instance.agent_results[DEAL_SCREENER]["score"], 64);
}

#[tokio::test]
async fn lifecycle_events_name_their_instance() {
    let entities = InMemoryEntityRepository::new();
    entities
        .upsert(EntityType::Lead, "lead-1", json!({}))
        .await;
    let engine = WorkflowEngine::builder(EngineConfig::default())
        .with_entity_repository(Arc::new(entities))
        .with_agent(ScoringAgent::new(LEAD_SCORER, 20))
        .build()
        .unwrap();
    let mut events = engine.subscribe();
    let handle = engine.spawn().await.unwrap();
    let id = engine.start("lead-1", EntityType::Lead).await.unwrap();
    wait_for(&engine, id, WorkflowInstance::is_terminal).await;

    let mut last = None;
    while let Ok(envelope) = events.try_recv() {
        assert!(envelope.is_current_version());
        assert_eq!(envelope.payload.instance_id(), id);
        last = Some(envelope.payload);
    }
    match last {
        Some(LifecycleEvent::Completed { final_state, .. }) => {
            assert_eq!(final_state, "DISQUALIFIED");
        }
        other => panic!("expected completion, got {other:?}"),
    }

    engine.shutdown();
    handle.await.unwrap();
}
