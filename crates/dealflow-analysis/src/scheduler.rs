use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dealflow_core::{Clock, Job, TickSummary};
use dealflow_engines::EngineRunner;
use dealflow_storage::{AnalysisStore, StoreResult};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::AnalysisConfig;
use crate::kill_switch::KillSwitch;
use crate::waterfall::WaterfallTracker;

pub const TICK_LEASE: &str = "analysis-scheduler-tick";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TickPhase {
    Idle,
    Fetching,
    Dispatching,
}

impl TickPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Fetching,
            2 => Self::Dispatching,
            _ => Self::Idle,
        }
    }
}

/// Clears the in-process guard when a tick ends, however it ends.
struct TickGuard<'a> {
    running: &'a AtomicBool,
    phase: &'a AtomicU8,
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.phase.store(TickPhase::Idle as u8, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    store: Arc<dyn AnalysisStore>,
    kill_switch: Arc<KillSwitch>,
    runner: Arc<EngineRunner>,
    tracker: Arc<WaterfallTracker>,
    clock: Arc<dyn Clock>,
    config: Arc<AnalysisConfig>,
    holder: String,
    lease_ttl: Duration,
    running: AtomicBool,
    phase: AtomicU8,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        kill_switch: Arc<KillSwitch>,
        runner: Arc<EngineRunner>,
        tracker: Arc<WaterfallTracker>,
        clock: Arc<dyn Clock>,
        config: Arc<AnalysisConfig>,
    ) -> Self {
        let lease_ttl = lease_ttl_for(&config);
        Self {
            store,
            kill_switch,
            runner,
            tracker,
            clock,
            config,
            holder: format!("scheduler-{}", Uuid::new_v4()),
            lease_ttl,
            running: AtomicBool::new(false),
            phase: AtomicU8::new(TickPhase::Idle as u8),
        }
    }

    pub fn phase(&self) -> TickPhase {
        TickPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: TickPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// One scheduler pass. Overlapping calls return `skipped` immediately.
    pub async fn tick(&self) -> StoreResult<TickSummary> {
        let started = Instant::now();
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("tick already running in this process; skipping");
            return Ok(skipped());
        }
        let _guard = TickGuard {
            running: &self.running,
            phase: &self.phase,
        };

        let acquired = self
            .store
            .try_acquire_lease(TICK_LEASE, &self.holder, self.lease_ttl, self.clock.now())
            .await?;
        if !acquired {
            debug!("tick lease held by another scheduler; skipping");
            return Ok(skipped());
        }

        let span = info_span!("scheduler_tick", holder = %self.holder);
        let outcome = self.tick_locked(started).instrument(span).await;

        if let Err(err) = self.store.release_lease(TICK_LEASE, &self.holder).await {
            warn!(error = %err, "could not release tick lease");
        }
        outcome
    }

    async fn tick_locked(&self, started: Instant) -> StoreResult<TickSummary> {
        if self.kill_switch.system_disabled().await? {
            info!("analysis system disabled; tick is a no-op");
            return Ok(TickSummary {
                system_disabled: true,
                processing_time_ms: elapsed_ms(started),
                ..TickSummary::default()
            });
        }

        self.set_phase(TickPhase::Fetching);
        let request = self
            .config
            .claim_request(self.kill_switch.emergency_subjects());
        let claimed = self
            .store
            .claim_next_batch(&request, self.clock.now())
            .await?;
        let total_items = claimed.len();

        let mut runnable = Vec::with_capacity(claimed.len());
        for job in claimed {
            let release = match self.kill_switch.is_blocked(&job.subject_id).await {
                Ok(block) if block.blocked => {
                    info!(
                        job_id = %job.id,
                        subject_id = %job.subject_id,
                        reason = block.reason.as_deref().unwrap_or(""),
                        "subject blocked; releasing claimed job"
                    );
                    true
                }
                Ok(_) => false,
                Err(err) => {
                    warn!(
                        job_id = %job.id,
                        subject_id = %job.subject_id,
                        error = %err,
                        "block check failed; releasing claimed job"
                    );
                    true
                }
            };
            if release {
                if let Err(err) = self.store.release_job(job.id).await {
                    warn!(job_id = %job.id, error = %err, "could not release blocked job");
                }
                continue;
            }
            runnable.push(job);
        }

        self.set_phase(TickPhase::Dispatching);
        let (successful, failed) = self.dispatch(runnable).await;
        let closed = self.tracker.sweep_open_runs().await;

        let summary = TickSummary {
            processed: successful + failed,
            successful,
            failed,
            total_items,
            processing_time_ms: elapsed_ms(started),
            system_disabled: false,
            skipped: false,
        };
        info!(
            processed = summary.processed,
            successful,
            failed,
            total_items,
            waterfalls_closed = closed,
            elapsed_ms = summary.processing_time_ms,
            "tick finished"
        );
        Ok(summary)
    }

    async fn renew_lease(&self) {
        match self
            .store
            .try_acquire_lease(TICK_LEASE, &self.holder, self.lease_ttl, self.clock.now())
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!("tick lease taken over by another scheduler mid-dispatch"),
            Err(err) => warn!(error = %err, "could not renew tick lease"),
        }
    }

    /// Run jobs concurrently, at most `max_in_flight` at a time. A failing or
    /// panicking job never aborts the batch.
    async fn dispatch(&self, jobs: Vec<Job>) -> (usize, usize) {
        let limit = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut set = JoinSet::new();

        for job in jobs {
            if let Err(err) = self.tracker.note_dispatch(&job.subject_id, &job.tenant_id).await {
                warn!(subject_id = %job.subject_id, error = %err, "could not open waterfall run");
            }
            let Ok(permit) = limit.clone().acquire_owned().await else {
                break;
            };
            self.renew_lease().await;
            let runner = self.runner.clone();
            let tracker = self.tracker.clone();
            set.spawn(async move {
                let _permit = permit;
                let result = runner.run(&job).await;
                if let Err(err) = tracker.evaluate(&job.subject_id).await {
                    warn!(subject_id = %job.subject_id, error = %err, "waterfall evaluation failed");
                }
                result.status.produced_data()
            });
        }

        let (mut successful, mut failed) = (0, 0);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(true) => successful += 1,
                Ok(false) => failed += 1,
                Err(err) => {
                    warn!(error = %err, "engine task aborted");
                    failed += 1;
                }
            }
        }
        (successful, failed)
    }
}

const LEASE_MARGIN: Duration = Duration::from_secs(60);

/// Covers a full batch run in `max_in_flight` waves, each wave waiting out
/// the engine timeout. The lease is also renewed before every dispatch.
pub fn lease_ttl_for(config: &AnalysisConfig) -> Duration {
    let in_flight = config.max_in_flight.max(1) as u64;
    let waves = (config.batch_size.max(1) as u64).div_ceil(in_flight);
    Duration::from_secs(config.engine_timeout_secs.saturating_mul(waves)).saturating_add(LEASE_MARGIN)
}

fn skipped() -> TickSummary {
    TickSummary {
        skipped: true,
        ..TickSummary::default()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
