//! Weighted completion tracking across engines for one subject.
//!
//! A waterfall run opens on the first dispatch for a subject and closes once
//! the aggregate is complete enough, every expected engine has reported, or
//! the wall-clock budget runs out. Engines marked `required` must have
//! reported before the threshold alone can complete a run. Only the caller that closes the run hands
//! the result to the downstream integrator.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dealflow_core::{
    to_time_delta, Clock, CompletionState, CompletionStatus, EngineResult, EngineStatus,
    WaterfallRun,
};
use dealflow_engines::Integrator;
use dealflow_storage::{AnalysisStore, StoreResult};
use tracing::{info, info_span, warn, Instrument};

use crate::config::EngineSpec;

#[derive(Debug, Clone)]
pub struct WaterfallPolicy {
    pub engines: Vec<EngineSpec>,
    pub completeness_threshold: f64,
    pub timeout: Duration,
}

impl WaterfallPolicy {
    /// Expected engines with their weights. Without configured engines every
    /// engine seen in the results counts with weight 1.
    fn expected_weights(&self, results: &[EngineResult]) -> BTreeMap<String, f64> {
        if self.engines.is_empty() {
            return results
                .iter()
                .map(|r| (r.engine_name.clone(), 1.0))
                .collect();
        }
        self.engines
            .iter()
            .map(|e| (e.name.clone(), e.weight))
            .collect()
    }

    fn required_engines(&self) -> impl Iterator<Item = &str> {
        self.engines
            .iter()
            .filter(|e| e.required)
            .map(|e| e.name.as_str())
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Best completeness each engine has reached, counting only data-producing results.
fn best_completeness(results: &[EngineResult]) -> BTreeMap<&str, f64> {
    let mut best = BTreeMap::new();
    for result in results.iter().filter(|r| r.status.produced_data()) {
        let entry = best.entry(result.engine_name.as_str()).or_insert(0.0_f64);
        *entry = entry.max(result.data_completeness.clamp(0.0, 100.0));
    }
    best
}

/// Weighted completeness over the expected engines, rounded to two decimals.
pub fn score_results(policy: &WaterfallPolicy, results: &[EngineResult]) -> f64 {
    let expected = policy.expected_weights(results);
    let total_weight: f64 = expected.values().sum();
    if total_weight <= 0.0 {
        return 0.0;
    }
    let best = best_completeness(results);
    let weighted: f64 = expected
        .iter()
        .map(|(name, weight)| weight * best.get(name.as_str()).copied().unwrap_or(0.0))
        .sum();
    round2(weighted / total_weight)
}

/// Decide the completion view from the run's results. Pure; no I/O.
pub fn assess(
    policy: &WaterfallPolicy,
    subject_id: &str,
    results: &[EngineResult],
    active_engines: &BTreeSet<String>,
    run_started_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> CompletionStatus {
    let expected = policy.expected_weights(results);
    let score = score_results(policy, results);

    let mut latest: BTreeMap<&str, EngineStatus> = BTreeMap::new();
    for result in results {
        latest.insert(result.engine_name.as_str(), result.status);
    }

    let processed: BTreeSet<String> = best_completeness(results)
        .into_keys()
        .map(str::to_string)
        .collect();
    let failed: BTreeSet<String> = latest
        .iter()
        .filter(|(name, status)| {
            **status == EngineStatus::Failure
                && !processed.contains(**name)
                && !active_engines.contains(**name)
        })
        .map(|(name, _)| name.to_string())
        .collect();
    let pending: BTreeSet<String> = expected
        .keys()
        .filter(|name| !processed.contains(*name) && !failed.contains(*name))
        .cloned()
        .collect();

    let terminal = |name: &str| processed.contains(name) || failed.contains(name);
    let all_terminal = !expected.is_empty() && expected.keys().all(|name| terminal(name.as_str()));
    let required_reported = policy.required_engines().all(terminal);
    let timed_out = run_started_at
        .is_some_and(|started| now.signed_duration_since(started) > to_time_delta(policy.timeout));

    let completion_status = if !expected.is_empty()
        && required_reported
        && score >= policy.completeness_threshold
    {
        CompletionState::Completed
    } else if all_terminal && !processed.is_empty() {
        CompletionState::Completed
    } else if all_terminal {
        CompletionState::Failed
    } else if timed_out {
        CompletionState::Timeout
    } else {
        CompletionState::Pending
    };

    CompletionStatus {
        subject_id: subject_id.to_string(),
        engines_processed: processed,
        engines_failed: failed,
        engines_pending: pending,
        completeness_score: score,
        completion_status,
        run_started_at,
        evaluated_at: now,
    }
}

pub struct WaterfallTracker {
    store: Arc<dyn AnalysisStore>,
    integrator: Arc<dyn Integrator>,
    clock: Arc<dyn Clock>,
    policy: WaterfallPolicy,
}

impl WaterfallTracker {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        integrator: Arc<dyn Integrator>,
        clock: Arc<dyn Clock>,
        policy: WaterfallPolicy,
    ) -> Self {
        Self {
            store,
            integrator,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &WaterfallPolicy {
        &self.policy
    }

    /// Open the subject's run if none is open. Called on dispatch.
    pub async fn note_dispatch(&self, subject_id: &str, tenant_id: &str) -> StoreResult<WaterfallRun> {
        self.store
            .open_run(subject_id, tenant_id, self.clock.now())
            .await
    }

    pub async fn evaluate(&self, subject_id: &str) -> StoreResult<CompletionStatus> {
        self.evaluate_inner(subject_id)
            .instrument(info_span!("waterfall_evaluate", subject_id))
            .await
    }

    async fn evaluate_inner(&self, subject_id: &str) -> StoreResult<CompletionStatus> {
        let now = self.clock.now();
        let open = self.store.current_run(subject_id).await?;
        let last_closed = self.store.last_closed_run(subject_id).await?;
        if let (Some(open), Some(closed)) = (&open, &last_closed) {
            // Closed by a concurrent evaluation between the two reads.
            if closed.started_at == open.started_at {
                return self.closed_view(subject_id, closed, now).await;
            }
        }
        let since = last_closed.as_ref().and_then(|run| run.closed_at);
        let results = self.store.results_since(subject_id, since).await?;

        let run = match open {
            Some(run) => run,
            None => match (results.first(), last_closed) {
                (Some(first), _) => {
                    self.store
                        .open_run(subject_id, &first.tenant_id, first.produced_at)
                        .await?
                }
                (None, Some(closed)) => return self.closed_view(subject_id, &closed, now).await,
                (None, None) => {
                    return Ok(assess(
                        &self.policy,
                        subject_id,
                        &[],
                        &BTreeSet::new(),
                        None,
                        now,
                    ))
                }
            },
        };

        let active = self.store.active_engines(subject_id).await?;
        let status = assess(
            &self.policy,
            subject_id,
            &results,
            &active,
            Some(run.started_at),
            now,
        );
        if status.completion_status.is_terminal() {
            self.finish(&run, &status, now).await?;
        }
        Ok(status)
    }

    /// Report a closed run as it was decided, without re-triggering anything.
    async fn closed_view(
        &self,
        subject_id: &str,
        run: &WaterfallRun,
        now: DateTime<Utc>,
    ) -> StoreResult<CompletionStatus> {
        let results: Vec<EngineResult> = self
            .store
            .results_since(subject_id, None)
            .await?
            .into_iter()
            .filter(|r| {
                r.produced_at >= run.started_at && run.closed_at.map_or(true, |c| r.produced_at <= c)
            })
            .collect();
        let mut status = assess(
            &self.policy,
            subject_id,
            &results,
            &BTreeSet::new(),
            Some(run.started_at),
            now,
        );
        if let Some(outcome) = run.outcome {
            status.completion_status = outcome;
        }
        if let Some(score) = run.completeness_score {
            status.completeness_score = score;
        }
        Ok(status)
    }

    async fn finish(
        &self,
        run: &WaterfallRun,
        status: &CompletionStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let closed = self
            .store
            .close_run(
                &run.subject_id,
                run.started_at,
                status.completion_status,
                status.completeness_score,
                now,
            )
            .await?;
        if !closed {
            return Ok(());
        }

        let outcome = self
            .integrator
            .integrate(&run.subject_id, &run.tenant_id, status)
            .await;
        match outcome {
            Ok(outcome) if outcome.success => {
                self.store
                    .record_integration(
                        &run.subject_id,
                        run.started_at,
                        true,
                        outcome.data_points_created,
                    )
                    .await?;
                info!(
                    completion = status.completion_status.as_str(),
                    score = status.completeness_score,
                    data_points = outcome.data_points_created,
                    "waterfall integrated"
                );
            }
            Ok(_) => {
                warn!("integration reported failure; reopening waterfall run");
                self.reopen_after_failed_integration(run).await?;
            }
            Err(err) => {
                warn!(error = %err, "integration failed; reopening waterfall run");
                self.reopen_after_failed_integration(run).await?;
            }
        }
        Ok(())
    }

    /// A newer run opened while integrating blocks the reopen. The closed run
    /// then keeps its failed integration on record.
    async fn reopen_after_failed_integration(&self, run: &WaterfallRun) -> StoreResult<()> {
        if self.store.reopen_run(&run.subject_id, run.started_at).await? {
            return Ok(());
        }
        warn!(
            started_at = %run.started_at,
            "newer waterfall run already open; integration will not be retried"
        );
        self.store
            .record_integration(&run.subject_id, run.started_at, false, 0)
            .await
    }

    /// Evaluate every open run so budgets expire without new results.
    /// Returns how many runs reached a terminal state.
    pub async fn sweep_open_runs(&self) -> usize {
        let runs = match self.store.open_runs().await {
            Ok(runs) => runs,
            Err(err) => {
                warn!(error = %err, "could not list open waterfall runs");
                return 0;
            }
        };

        let mut finished = 0;
        for run in runs {
            match self.evaluate(&run.subject_id).await {
                Ok(status) if status.completion_status.is_terminal() => finished += 1,
                Ok(_) => {}
                Err(err) => warn!(subject_id = %run.subject_id, error = %err, "waterfall sweep failed"),
            }
        }
        finished
    }
}
