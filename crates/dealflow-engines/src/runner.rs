use std::sync::Arc;
use std::time::Duration;

use dealflow_core::{
    instant_after, AnalysisError, Clock, EngineResult, EngineStatus, Job,
};
use dealflow_storage::AnalysisStore;
use serde_json::Value;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{BackoffPolicy, CollaboratorError, EngineContext, EngineInvoker, EngineResponse};

#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    pub engine_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            engine_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Executes one claimed job: invoke the engine, record the result, settle
/// the job (complete, requeue with backoff, or fail terminally).
pub struct EngineRunner {
    store: Arc<dyn AnalysisStore>,
    invoker: Arc<dyn EngineInvoker>,
    clock: Arc<dyn Clock>,
    config: RunnerConfig,
}

impl EngineRunner {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        invoker: Arc<dyn EngineInvoker>,
        clock: Arc<dyn Clock>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            invoker,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run a job that is already in `processing`. Never fails: engine and
    /// store errors are folded into the returned result and the logs.
    pub async fn run(&self, job: &Job) -> EngineResult {
        let attempt = job.attempt_count + 1;
        let span = info_span!(
            "engine_run",
            job_id = %job.id,
            subject_id = %job.subject_id,
            engine = %job.engine_name,
            attempt
        );
        self.run_inner(job, attempt).instrument(span).await
    }

    async fn run_inner(&self, job: &Job, attempt: u32) -> EngineResult {
        let context = EngineContext {
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            attempt,
        };
        let call = self
            .invoker
            .invoke(&job.engine_name, &job.subject_id, &context);
        let outcome = match tokio::time::timeout(self.config.engine_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CollaboratorError::timed_out(self.config.engine_timeout)),
        };

        let now = self.clock.now();
        let (result, failure) = build_result(job, outcome, now);

        if let Err(err) = self.store.append_result(&result).await {
            warn!(error = %err, "failed to record engine result");
        }

        match failure {
            None => match self.store.complete_job(job.id, now).await {
                Ok(_) => info!(
                    status = result.status.as_str(),
                    completeness = result.data_completeness,
                    "engine run finished"
                ),
                Err(err) => warn!(error = %err, "could not mark job completed"),
            },
            Some(err) => self.settle_failure(job, attempt, err, now).await,
        }

        result
    }

    async fn settle_failure(
        &self,
        job: &Job,
        attempt: u32,
        err: CollaboratorError,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let backoff = &self.config.backoff;
        if err.is_retryable() && backoff.allows_another(attempt) {
            let delay = backoff.delay_for_attempt(attempt - 1);
            let message = AnalysisError::TransientEngineFailure {
                engine: job.engine_name.clone(),
                message: err.message,
            }
            .to_string();
            match self
                .store
                .requeue_job(job.id, &message, instant_after(now, delay))
                .await
            {
                Ok(_) => warn!(delay_ms = delay.as_millis() as u64, %message, "engine run failed; requeued"),
                Err(store_err) => warn!(error = %store_err, "could not requeue job"),
            }
            return;
        }

        let message = AnalysisError::TerminalEngineFailure {
            engine: job.engine_name.clone(),
            attempts: attempt,
            message: err.message,
        }
        .to_string();
        match self.store.fail_job(job.id, &message, now).await {
            Ok(_) => warn!(%message, "engine run failed terminally"),
            Err(store_err) => warn!(error = %store_err, "could not mark job failed"),
        }
    }
}

fn score_field(data: &Value, key: &str) -> f64 {
    data.get(key)
        .and_then(Value::as_f64)
        .map(|v| v.clamp(0.0, 100.0))
        .unwrap_or(100.0)
}

/// Translate an engine outcome into the persisted result plus, for failures,
/// the error that decides retry handling.
fn build_result(
    job: &Job,
    outcome: Result<EngineResponse, CollaboratorError>,
    now: chrono::DateTime<chrono::Utc>,
) -> (EngineResult, Option<CollaboratorError>) {
    let mut result = EngineResult {
        id: Uuid::new_v4(),
        job_id: Some(job.id),
        engine_name: job.engine_name.clone(),
        subject_id: job.subject_id.clone(),
        tenant_id: job.tenant_id.clone(),
        status: EngineStatus::Failure,
        confidence: 0.0,
        data_completeness: 0.0,
        payload: Value::Null,
        error: None,
        produced_at: now,
    };

    match outcome {
        Ok(resp) if resp.success => {
            let completeness = score_field(&resp.data, "data_completeness");
            result.confidence = score_field(&resp.data, "confidence");
            result.data_completeness = completeness;
            result.status = if completeness < 100.0 {
                EngineStatus::Partial
            } else {
                EngineStatus::Success
            };
            result.payload = resp.data;
            (result, None)
        }
        Ok(resp) => {
            let message = resp
                .error
                .unwrap_or_else(|| "engine reported failure".to_string());
            result.error = Some(message.clone());
            result.payload = resp.data;
            (result, Some(CollaboratorError::retryable(message)))
        }
        Err(err) => {
            result.error = Some(err.message.clone());
            (result, Some(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta, Utc};
    use dealflow_core::{JobStatus, ManualClock, NewJob};
    use dealflow_storage::{ClaimRequest, JobStore, MemoryStore, ResultStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedInvoker {
        replies: Vec<Result<EngineResponse, CollaboratorError>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedInvoker {
        fn new(replies: Vec<Result<EngineResponse, CollaboratorError>>) -> Self {
            Self {
                replies,
                calls: AtomicUsize::new(0),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl EngineInvoker for ScriptedInvoker {
        async fn invoke(
            &self,
            _engine_name: &str,
            _subject_id: &str,
            _context: &EngineContext,
        ) -> Result<EngineResponse, CollaboratorError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies[idx.min(self.replies.len() - 1)].clone()
        }
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn config(max_attempts: u32) -> RunnerConfig {
        RunnerConfig {
            engine_timeout: Duration::from_millis(200),
            backoff: BackoffPolicy {
                max_attempts,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(600),
            },
        }
    }

    async fn claimed_job(store: &MemoryStore, now: DateTime<Utc>) -> Job {
        store
            .enqueue(NewJob::new("acme", "fund-a", "crunchbase"), now)
            .await
            .unwrap();
        let request = ClaimRequest {
            max_jobs: 1,
            default_tenant_cap: 5,
            ..ClaimRequest::default()
        };
        store
            .claim_next_batch(&request, now)
            .await
            .unwrap()
            .pop()
            .unwrap()
    }

    fn runner(
        store: Arc<MemoryStore>,
        invoker: ScriptedInvoker,
        clock: Arc<ManualClock>,
        config: RunnerConfig,
    ) -> EngineRunner {
        EngineRunner::new(store, Arc::new(invoker), clock, config)
    }

    #[tokio::test]
    async fn full_response_completes_job_and_records_success() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let job = claimed_job(&store, start()).await;
        let invoker = ScriptedInvoker::new(vec![Ok(EngineResponse::ok(
            json!({"confidence": 88.0, "headcount": 42}),
        ))]);

        let result = runner(store.clone(), invoker, clock, config(3)).run(&job).await;

        assert_eq!(result.status, EngineStatus::Success);
        assert_eq!(result.confidence, 88.0);
        assert_eq!(result.data_completeness, 100.0);
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(store.results_since("acme", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn incomplete_data_is_partial() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let job = claimed_job(&store, start()).await;
        let invoker = ScriptedInvoker::new(vec![Ok(EngineResponse::ok(
            json!({"data_completeness": 40}),
        ))]);

        let result = runner(store.clone(), invoker, clock, config(3)).run(&job).await;

        assert_eq!(result.status, EngineStatus::Partial);
        assert_eq!(result.data_completeness, 40.0);
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn transient_failure_requeues_with_backoff() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let job = claimed_job(&store, start()).await;
        let invoker =
            ScriptedInvoker::new(vec![Err(CollaboratorError::retryable("upstream 503"))]);

        let result = runner(store.clone(), invoker, clock, config(3)).run(&job).await;

        assert_eq!(result.status, EngineStatus::Failure);
        assert_eq!(result.error.as_deref(), Some("upstream 503"));
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.next_eligible_at, start() + TimeDelta::seconds(30));
        assert!(stored.error_message.unwrap().contains("upstream 503"));
    }

    #[tokio::test]
    async fn second_retry_waits_twice_as_long() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let job = claimed_job(&store, start()).await;
        let runner = runner(
            store.clone(),
            ScriptedInvoker::new(vec![Err(CollaboratorError::retryable("flaky"))]),
            clock.clone(),
            config(3),
        );
        runner.run(&job).await;

        let later = start() + TimeDelta::seconds(31);
        clock.set(later);
        let request = ClaimRequest {
            max_jobs: 1,
            default_tenant_cap: 5,
            ..ClaimRequest::default()
        };
        let job = store.claim_next_batch(&request, later).await.unwrap().pop().unwrap();
        runner.run(&job).await;

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(stored.next_eligible_at, later + TimeDelta::seconds(60));
    }

    #[tokio::test]
    async fn retry_ceiling_fails_terminally() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let job = claimed_job(&store, start()).await;
        let invoker = ScriptedInvoker::new(vec![Err(CollaboratorError::retryable("still down"))]);

        runner(store.clone(), invoker, clock, config(1)).run(&job).await;

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.completed_at.is_some());
        assert!(stored.error_message.unwrap().contains("1 attempt"));
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let job = claimed_job(&store, start()).await;
        let invoker =
            ScriptedInvoker::new(vec![Err(CollaboratorError::non_retryable("http status 404"))]);

        runner(store.clone(), invoker, clock, config(5)).run(&job).await;

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn slow_engine_times_out_and_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let job = claimed_job(&store, start()).await;
        let mut invoker = ScriptedInvoker::new(vec![Ok(EngineResponse::ok(json!({})))]);
        invoker.delay = Some(Duration::from_secs(5));

        let result = runner(store.clone(), invoker, clock, config(3)).run(&job).await;

        assert_eq!(result.status, EngineStatus::Failure);
        assert!(result.error.unwrap().contains("timed out"));
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn reported_failure_keeps_engine_error_text() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let job = claimed_job(&store, start()).await;
        let invoker = ScriptedInvoker::new(vec![Ok(EngineResponse::failed("rate limited"))]);

        let result = runner(store.clone(), invoker, clock, config(3)).run(&job).await;

        assert_eq!(result.status, EngineStatus::Failure);
        assert_eq!(result.error.as_deref(), Some("rate limited"));
    }
}
