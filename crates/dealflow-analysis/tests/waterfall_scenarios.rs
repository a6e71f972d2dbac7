use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dealflow_analysis::{
    AnalysisConfig, AnalysisServices, Collaborators, ControlState, EngineSpec, EnqueueError,
    EnqueueRequest,
};
use dealflow_core::{BlockScope, CompletionState, CompletionStatus, ManualClock, Priority};
use dealflow_engines::{
    CollaboratorError, EngineContext, EngineInvoker, EngineResponse, IntegrationOutcome,
    Integrator,
};
use dealflow_storage::{JobStore, MemoryStore};
use serde_json::json;

struct CompleteData;

#[async_trait]
impl EngineInvoker for CompleteData {
    async fn invoke(
        &self,
        _engine_name: &str,
        _subject_id: &str,
        _context: &EngineContext,
    ) -> Result<EngineResponse, CollaboratorError> {
        Ok(EngineResponse::ok(json!({"data_completeness": 100, "confidence": 88})))
    }
}

#[derive(Default)]
struct CountingIntegrator {
    calls: AtomicUsize,
}

#[async_trait]
impl Integrator for CountingIntegrator {
    async fn integrate(
        &self,
        _subject_id: &str,
        _tenant_id: &str,
        _status: &CompletionStatus,
    ) -> Result<IntegrationOutcome, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(IntegrationOutcome {
            success: true,
            data_points_created: 1,
        })
    }
}

fn start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

struct World {
    services: AnalysisServices,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    integrator: Arc<CountingIntegrator>,
}

fn world() -> World {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(start()));
    let integrator = Arc::new(CountingIntegrator::default());
    let config = AnalysisConfig {
        engines: vec![EngineSpec::new("crunchbase", 0.6), EngineSpec::new("linkedin", 0.4)],
        ..AnalysisConfig::default()
    };
    let services = AnalysisServices::new(
        store.clone(),
        config,
        Collaborators {
            invoker: Arc::new(CompleteData),
            integrator: integrator.clone(),
            clock: clock.clone(),
        },
        Arc::new(ControlState::default()),
    );
    World {
        services,
        store,
        clock,
        integrator,
    }
}

fn request(engine: &str) -> EnqueueRequest {
    EnqueueRequest {
        subject_id: "acme".into(),
        tenant_id: "fund-a".into(),
        engine_name: engine.into(),
        priority: Priority::Normal,
        delay: std::time::Duration::ZERO,
    }
}

#[tokio::test]
async fn silent_engine_times_out_with_partial_score() {
    let w = world();
    w.services.queue.enqueue(request("crunchbase")).await.unwrap();

    let summary = w.services.scheduler.tick().await.unwrap();
    assert_eq!(summary.successful, 1);

    let status = w.services.tracker.evaluate("acme").await.unwrap();
    assert_eq!(status.completion_status, CompletionState::Pending);
    assert!((status.completeness_score - 60.0).abs() < 1e-9);
    assert_eq!(w.integrator.calls.load(Ordering::SeqCst), 0);

    w.clock.advance(TimeDelta::seconds(301));
    w.services.scheduler.tick().await.unwrap();

    let status = w.services.tracker.evaluate("acme").await.unwrap();
    assert_eq!(status.completion_status, CompletionState::Timeout);
    assert!((status.completeness_score - 60.0).abs() < 1e-9);
    assert_eq!(w.integrator.calls.load(Ordering::SeqCst), 1);

    w.services.scheduler.tick().await.unwrap();
    assert_eq!(w.integrator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn blocked_subject_reports_reason_and_gets_no_job() {
    let w = world();
    w.services
        .kill_switch
        .block(BlockScope::Subject("acme".into()), "LP conflict review", None)
        .await
        .unwrap();

    let block = w.services.kill_switch.is_blocked("acme").await.unwrap();
    assert!(block.blocked);
    assert_eq!(block.reason.as_deref(), Some("LP conflict review"));

    let err = w.services.queue.enqueue(request("crunchbase")).await.unwrap_err();
    assert!(matches!(err, EnqueueError::SubjectBlocked { .. }));
    assert!(w.store.jobs_for_subject("acme").await.unwrap().is_empty());
}

#[tokio::test]
async fn timed_block_rejects_enqueue_until_it_expires() {
    let w = world();
    let until = start() + TimeDelta::hours(1);
    w.services
        .kill_switch
        .block(BlockScope::Subject("acme".into()), "IC memo pending", Some(until))
        .await
        .unwrap();

    match w.services.queue.enqueue(request("crunchbase")).await {
        Err(EnqueueError::SubjectBlocked {
            reason,
            blocked_until,
            ..
        }) => {
            assert_eq!(reason, "IC memo pending");
            assert_eq!(blocked_until, Some(until));
        }
        other => panic!("expected a block, got {other:?}"),
    }
    assert!(w.store.jobs_for_subject("acme").await.unwrap().is_empty());

    w.clock.advance(TimeDelta::hours(2));
    assert!(!w.services.kill_switch.is_blocked("acme").await.unwrap().blocked);
    w.services.queue.enqueue(request("crunchbase")).await.unwrap();
    assert_eq!(w.store.jobs_for_subject("acme").await.unwrap().len(), 1);
}

#[tokio::test]
async fn repeated_enqueue_keeps_one_active_job() {
    let w = world();
    w.services.queue.enqueue(request("crunchbase")).await.unwrap();
    let second = w.services.queue.enqueue(request("crunchbase")).await;
    assert!(second.is_err());

    let depth = w.store.queue_depth().await.unwrap();
    let queued: u64 = depth.iter().map(|row| row.count).sum();
    assert_eq!(queued, 1);
}
