//! Process-local store used for single-node deployments and tests.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealflow_core::{
    instant_after, BlockScope, CompletionState, EngineResult, Job, JobStatus, KillSwitchEntry,
    NewJob, Priority, QueueDepthRow, ReclaimSummary, SubjectConfig, TenantActivity, WaterfallRun,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    append_note, reclaim_note, BlocklistStore, ClaimRequest, EnqueueOutcome, JobStore,
    LeaseStore, ResultStore, RunStore, StoreError, StoreResult, SubjectStore,
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<Uuid, Job>,
    results: Vec<EngineResult>,
    runs: Vec<WaterfallRun>,
    blocks: Vec<KillSwitchEntry>,
    subjects: HashMap<String, SubjectConfig>,
    leases: HashMap<String, Lease>,
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryState {
    fn blocked_subjects(&self, now: DateTime<Utc>) -> HashSet<String> {
        let mut blocked = blocked_subjects(&self.blocks, now);
        blocked.extend(
            self.subjects
                .values()
                .filter(|s| s.blocked_until.is_some_and(|until| until > now))
                .map(|s| s.subject_id.clone()),
        );
        blocked
    }

    fn processing_job_mut(&mut self, id: Uuid) -> StoreResult<&mut Job> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        if job.status != JobStatus::Processing {
            return Err(StoreError::StaleTransition {
                id,
                expected: JobStatus::Processing,
            });
        }
        Ok(job)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> StoreResult<EnqueueOutcome> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.jobs.values_mut().find(|j| {
            j.status.is_active() && j.subject_id == job.subject_id && j.engine_name == job.engine_name
        }) {
            if job.priority > existing.priority {
                let from = existing.priority;
                existing.priority = job.priority;
                return Ok(EnqueueOutcome::Promoted {
                    id: existing.id,
                    from,
                });
            }
            return Err(StoreError::DuplicateActiveJob {
                existing_id: existing.id,
                subject_id: job.subject_id,
                engine_name: job.engine_name,
            });
        }

        let id = Uuid::new_v4();
        state.jobs.insert(
            id,
            Job {
                id,
                subject_id: job.subject_id,
                tenant_id: job.tenant_id,
                engine_name: job.engine_name,
                priority: job.priority,
                status: JobStatus::Queued,
                attempt_count: 0,
                created_at: now,
                started_at: None,
                completed_at: None,
                next_eligible_at: instant_after(now, job.delay),
                error_message: None,
            },
        );
        Ok(EnqueueOutcome::Created(id))
    }

    async fn claim_next_batch(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Job>> {
        let mut state = self.state.lock().await;

        let mut running: HashMap<String, usize> = HashMap::new();
        for job in state.jobs.values() {
            if job.status == JobStatus::Processing {
                *running.entry(job.tenant_id.clone()).or_default() += 1;
            }
        }

        let blocked = state.blocked_subjects(now);
        let mut candidates = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && j.next_eligible_at <= now)
            .filter(|j| !request.excluded_subjects.contains(&j.subject_id))
            .filter(|j| !blocked.contains(&j.subject_id))
            .map(|j| (Reverse(j.priority), j.created_at, j.id))
            .collect::<Vec<_>>();
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, _, id) in candidates {
            if claimed.len() >= request.max_jobs {
                break;
            }
            let Some(job) = state.jobs.get_mut(&id) else { continue };
            let in_flight = running.entry(job.tenant_id.clone()).or_default();
            if *in_flight >= request.cap_for(&job.tenant_id) {
                continue;
            }
            *in_flight += 1;
            job.status = JobStatus::Processing;
            job.started_at = Some(now);
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn complete_job(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Job> {
        let mut state = self.state.lock().await;
        let job = state.processing_job_mut(id)?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.attempt_count += 1;
        Ok(job.clone())
    }

    async fn fail_job(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> StoreResult<Job> {
        let mut state = self.state.lock().await;
        let job = state.processing_job_mut(id)?;
        job.status = JobStatus::Failed;
        job.completed_at = Some(now);
        job.attempt_count += 1;
        job.error_message = Some(error.to_string());
        Ok(job.clone())
    }

    async fn requeue_job(
        &self,
        id: Uuid,
        error: &str,
        next_eligible_at: DateTime<Utc>,
    ) -> StoreResult<Job> {
        let mut state = self.state.lock().await;
        let job = state.processing_job_mut(id)?;
        job.status = JobStatus::Queued;
        job.started_at = None;
        job.attempt_count += 1;
        job.next_eligible_at = next_eligible_at;
        job.error_message = Some(error.to_string());
        Ok(job.clone())
    }

    async fn release_job(&self, id: Uuid) -> StoreResult<Job> {
        let mut state = self.state.lock().await;
        let job = state.processing_job_mut(id)?;
        job.status = JobStatus::Queued;
        job.started_at = None;
        Ok(job.clone())
    }

    async fn reclaim_stuck(
        &self,
        stuck_before: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<ReclaimSummary> {
        let mut state = self.state.lock().await;
        let note = reclaim_note(now);
        let mut summary = ReclaimSummary::default();
        for job in state.jobs.values_mut() {
            let stuck = job.status == JobStatus::Processing
                && job.started_at.is_some_and(|started| started < stuck_before);
            if !stuck {
                continue;
            }
            job.attempt_count += 1;
            job.started_at = None;
            job.error_message = Some(append_note(job.error_message.as_deref(), &note));
            if job.attempt_count >= max_attempts {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                summary.failed += 1;
            } else {
                job.status = JobStatus::Queued;
                job.next_eligible_at = now;
                summary.reclaimed += 1;
            }
        }
        Ok(summary)
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn jobs_for_subject(&self, subject_id: &str) -> StoreResult<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs = state
            .jobs
            .values()
            .filter(|j| j.subject_id == subject_id)
            .cloned()
            .collect::<Vec<_>>();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn active_engines(&self, subject_id: &str) -> StoreResult<BTreeSet<String>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.subject_id == subject_id && j.status.is_active())
            .map(|j| j.engine_name.clone())
            .collect())
    }

    async fn tenant_activity(&self, tenant_id: &str) -> StoreResult<TenantActivity> {
        let state = self.state.lock().await;
        let mut activity = TenantActivity::default();
        for job in state.jobs.values().filter(|j| j.tenant_id == tenant_id) {
            match job.status {
                JobStatus::Queued => activity.queued += 1,
                JobStatus::Processing => activity.processing += 1,
                JobStatus::Completed | JobStatus::Failed => {}
            }
        }
        Ok(activity)
    }

    async fn queue_depth(&self) -> StoreResult<Vec<QueueDepthRow>> {
        let state = self.state.lock().await;
        let mut counts: BTreeMap<(&'static str, Reverse<Priority>), (JobStatus, u64)> =
            BTreeMap::new();
        for job in state.jobs.values() {
            counts
                .entry((job.status.as_str(), Reverse(job.priority)))
                .or_insert((job.status, 0))
                .1 += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((_, Reverse(priority)), (status, count))| QueueDepthRow {
                status,
                priority,
                count,
            })
            .collect())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn append_result(&self, result: &EngineResult) -> StoreResult<()> {
        self.state.lock().await.results.push(result.clone());
        Ok(())
    }

    async fn results_since(
        &self,
        subject_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<EngineResult>> {
        let state = self.state.lock().await;
        let mut results = state
            .results
            .iter()
            .filter(|r| r.subject_id == subject_id)
            .filter(|r| since.map_or(true, |since| r.produced_at > since))
            .cloned()
            .collect::<Vec<_>>();
        results.sort_by_key(|r| r.produced_at);
        Ok(results)
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn open_run(
        &self,
        subject_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<WaterfallRun> {
        let mut state = self.state.lock().await;
        if let Some(run) = state
            .runs
            .iter()
            .find(|r| r.subject_id == subject_id && r.is_open())
        {
            return Ok(run.clone());
        }
        let run = WaterfallRun {
            subject_id: subject_id.to_string(),
            tenant_id: tenant_id.to_string(),
            started_at: now,
            closed_at: None,
            outcome: None,
            completeness_score: None,
            integration_succeeded: None,
            data_points_created: None,
        };
        state.runs.push(run.clone());
        Ok(run)
    }

    async fn current_run(&self, subject_id: &str) -> StoreResult<Option<WaterfallRun>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .find(|r| r.subject_id == subject_id && r.is_open())
            .cloned())
    }

    async fn last_closed_run(&self, subject_id: &str) -> StoreResult<Option<WaterfallRun>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.subject_id == subject_id && !r.is_open())
            .max_by_key(|r| r.closed_at)
            .cloned())
    }

    async fn open_runs(&self) -> StoreResult<Vec<WaterfallRun>> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().filter(|r| r.is_open()).cloned().collect())
    }

    async fn close_run(
        &self,
        subject_id: &str,
        started_at: DateTime<Utc>,
        outcome: CompletionState,
        completeness_score: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let Some(run) = state.runs.iter_mut().find(|r| {
            r.subject_id == subject_id && r.started_at == started_at && r.is_open()
        }) else {
            return Ok(false);
        };
        run.closed_at = Some(now);
        run.outcome = Some(outcome);
        run.completeness_score = Some(completeness_score);
        Ok(true)
    }

    async fn reopen_run(&self, subject_id: &str, started_at: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state
            .runs
            .iter()
            .any(|r| r.subject_id == subject_id && r.is_open())
        {
            return Ok(false);
        }
        let Some(run) = state
            .runs
            .iter_mut()
            .find(|r| r.subject_id == subject_id && r.started_at == started_at)
        else {
            return Ok(false);
        };
        run.closed_at = None;
        run.outcome = None;
        run.completeness_score = None;
        run.integration_succeeded = None;
        run.data_points_created = None;
        Ok(true)
    }

    async fn record_integration(
        &self,
        subject_id: &str,
        started_at: DateTime<Utc>,
        succeeded: bool,
        data_points_created: i64,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.subject_id == subject_id && r.started_at == started_at)
            .ok_or_else(|| StoreError::NotFound(format!("waterfall run for {subject_id}")))?;
        run.integration_succeeded = Some(succeeded);
        run.data_points_created = Some(data_points_created);
        Ok(())
    }
}

#[async_trait]
impl BlocklistStore for MemoryStore {
    async fn add_block(&self, entry: &KillSwitchEntry) -> StoreResult<()> {
        self.state.lock().await.blocks.push(entry.clone());
        Ok(())
    }

    async fn remove_block(&self, id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let before = state.blocks.len();
        state.blocks.retain(|entry| entry.id != id);
        Ok(state.blocks.len() != before)
    }

    async fn list_blocks(&self) -> StoreResult<Vec<KillSwitchEntry>> {
        let state = self.state.lock().await;
        let mut blocks = state.blocks.clone();
        blocks.sort_by_key(|entry| entry.created_at);
        Ok(blocks)
    }

    async fn active_blocks(
        &self,
        scope: &BlockScope,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<KillSwitchEntry>> {
        let state = self.state.lock().await;
        let mut blocks = state
            .blocks
            .iter()
            .filter(|entry| &entry.scope == scope && entry.is_active(now))
            .cloned()
            .collect::<Vec<_>>();
        blocks.sort_by_key(|entry| entry.created_at);
        Ok(blocks)
    }
}

#[async_trait]
impl SubjectStore for MemoryStore {
    async fn upsert_subject(
        &self,
        subject_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<SubjectConfig> {
        let mut state = self.state.lock().await;
        let config = state
            .subjects
            .entry(subject_id.to_string())
            .or_insert_with(|| SubjectConfig {
                subject_id: subject_id.to_string(),
                tenant_id: tenant_id.to_string(),
                settings: serde_json::json!({}),
                version: 0,
                blocked_until: None,
                block_reason: None,
                updated_at: now,
            });
        Ok(config.clone())
    }

    async fn get_subject(&self, subject_id: &str) -> StoreResult<Option<SubjectConfig>> {
        Ok(self.state.lock().await.subjects.get(subject_id).cloned())
    }

    async fn update_settings(
        &self,
        subject_id: &str,
        expected_version: i64,
        settings: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<SubjectConfig> {
        let mut state = self.state.lock().await;
        let config = state
            .subjects
            .get_mut(subject_id)
            .ok_or_else(|| StoreError::NotFound(format!("subject {subject_id}")))?;
        if config.version != expected_version {
            return Err(StoreError::WriteConflict(format!(
                "subject {subject_id} at version {} (expected {expected_version})",
                config.version
            )));
        }
        config.settings = settings.clone();
        config.version += 1;
        config.updated_at = now;
        Ok(config.clone())
    }

    async fn set_subject_block(
        &self,
        subject_id: &str,
        blocked_until: Option<DateTime<Utc>>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<SubjectConfig> {
        let mut state = self.state.lock().await;
        let config = state
            .subjects
            .get_mut(subject_id)
            .ok_or_else(|| StoreError::NotFound(format!("subject {subject_id}")))?;
        config.blocked_until = blocked_until;
        config.block_reason = reason.map(ToString::to_string);
        config.updated_at = now;
        Ok(config.clone())
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: std::time::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let free = state
            .leases
            .get(name)
            .map_or(true, |lease| lease.expires_at <= now || lease.holder == holder);
        if free {
            state.leases.insert(
                name.to_string(),
                Lease {
                    holder: holder.to_string(),
                    expires_at: instant_after(now, ttl),
                },
            );
        }
        Ok(free)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state
            .leases
            .get(name)
            .is_some_and(|lease| lease.holder == holder)
        {
            state.leases.remove(name);
        }
        Ok(())
    }
}

/// Subjects with an unexpired table-driven block at `now`.
fn blocked_subjects(
    blocks: &[KillSwitchEntry],
    now: DateTime<Utc>,
) -> HashSet<String> {
    blocks
        .iter()
        .filter(|entry| entry.is_active(now))
        .filter_map(|entry| entry.scope.subject_id().map(ToString::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeDelta, TimeZone};
    use tokio::task::JoinSet;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap()
    }

    fn claim_all(max_jobs: usize, default_tenant_cap: usize) -> ClaimRequest {
        ClaimRequest {
            max_jobs,
            default_tenant_cap,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn duplicate_enqueue_at_equal_priority_is_rejected() {
        let store = MemoryStore::new();
        let first = store
            .enqueue(NewJob::new("deal-1", "fund-a", "crunchbase"), t0())
            .await
            .unwrap();
        let second = store
            .enqueue(NewJob::new("deal-1", "fund-a", "crunchbase"), t0())
            .await;

        match second {
            Err(StoreError::DuplicateActiveJob { existing_id, .. }) => {
                assert_eq!(existing_id, first.job_id())
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(store.jobs_for_subject("deal-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn higher_priority_enqueue_promotes_existing_job() {
        let store = MemoryStore::new();
        let first = store
            .enqueue(
                NewJob::new("deal-1", "fund-a", "crunchbase").with_priority(Priority::Low),
                t0(),
            )
            .await
            .unwrap();
        let promoted = store
            .enqueue(
                NewJob::new("deal-1", "fund-a", "crunchbase").with_priority(Priority::High),
                t0(),
            )
            .await
            .unwrap();

        assert_eq!(
            promoted,
            EnqueueOutcome::Promoted {
                id: first.job_id(),
                from: Priority::Low
            }
        );
        let job = store.get_job(first.job_id()).await.unwrap().unwrap();
        assert_eq!(job.priority, Priority::High);

        let lower = store
            .enqueue(
                NewJob::new("deal-1", "fund-a", "crunchbase").with_priority(Priority::Normal),
                t0(),
            )
            .await;
        assert!(matches!(lower, Err(StoreError::DuplicateActiveJob { .. })));
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_fifo() {
        let store = MemoryStore::new();
        let low = store
            .enqueue(
                NewJob::new("deal-1", "fund-a", "web").with_priority(Priority::Low),
                t0(),
            )
            .await
            .unwrap();
        let normal_old = store
            .enqueue(NewJob::new("deal-2", "fund-a", "web"), t0() + TimeDelta::seconds(1))
            .await
            .unwrap();
        let normal_new = store
            .enqueue(NewJob::new("deal-3", "fund-a", "web"), t0() + TimeDelta::seconds(2))
            .await
            .unwrap();
        let high = store
            .enqueue(
                NewJob::new("deal-4", "fund-a", "web").with_priority(Priority::High),
                t0() + TimeDelta::seconds(3),
            )
            .await
            .unwrap();

        let claimed = store
            .claim_next_batch(&claim_all(10, 10), t0() + TimeDelta::seconds(5))
            .await
            .unwrap();
        let order = claimed.iter().map(|j| j.id).collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![
                high.job_id(),
                normal_old.job_id(),
                normal_new.job_id(),
                low.job_id()
            ]
        );
        assert!(claimed
            .iter()
            .all(|j| j.status == JobStatus::Processing && j.started_at.is_some()));
    }

    #[tokio::test]
    async fn delayed_jobs_wait_until_eligible() {
        let store = MemoryStore::new();
        store
            .enqueue(
                NewJob::new("deal-1", "fund-a", "web").with_delay(Duration::from_secs(60)),
                t0(),
            )
            .await
            .unwrap();

        let early = store.claim_next_batch(&claim_all(5, 5), t0()).await.unwrap();
        assert!(early.is_empty());

        let later = store
            .claim_next_batch(&claim_all(5, 5), t0() + TimeDelta::seconds(60))
            .await
            .unwrap();
        assert_eq!(later.len(), 1);
    }

    #[tokio::test]
    async fn claim_respects_tenant_cap_including_running_jobs() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .enqueue(NewJob::new(format!("deal-{i}"), "fund-a", "web"), t0())
                .await
                .unwrap();
        }
        store
            .enqueue(NewJob::new("deal-b", "fund-b", "web"), t0())
            .await
            .unwrap();

        let request = ClaimRequest {
            max_jobs: 10,
            tenant_caps: HashMap::from([("fund-a".to_string(), 2)]),
            default_tenant_cap: 5,
            excluded_subjects: HashSet::new(),
        };
        let first = store.claim_next_batch(&request, t0()).await.unwrap();
        assert_eq!(first.iter().filter(|j| j.tenant_id == "fund-a").count(), 2);
        assert_eq!(first.iter().filter(|j| j.tenant_id == "fund-b").count(), 1);

        let second = store.claim_next_batch(&request, t0()).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn concurrent_claimers_never_share_jobs_or_break_caps() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..40 {
            let tenant = if i % 2 == 0 { "fund-a" } else { "fund-b" };
            store
                .enqueue(NewJob::new(format!("deal-{i}"), tenant, "web"), t0())
                .await
                .unwrap();
            store
                .enqueue(NewJob::new(format!("deal-{i}"), tenant, "news"), t0())
                .await
                .unwrap();
        }

        let request = Arc::new(ClaimRequest {
            max_jobs: 4,
            tenant_caps: HashMap::from([("fund-a".to_string(), 3), ("fund-b".to_string(), 5)]),
            default_tenant_cap: 1,
            excluded_subjects: HashSet::new(),
        });
        let mut set = JoinSet::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let request = Arc::clone(&request);
            set.spawn(async move { store.claim_next_batch(&request, t0()).await.unwrap() });
        }

        let mut seen = HashSet::new();
        let mut pairs = HashSet::new();
        while let Some(batch) = set.join_next().await {
            for job in batch.unwrap() {
                assert!(seen.insert(job.id), "job claimed twice");
                assert!(pairs.insert((job.subject_id.clone(), job.engine_name.clone())));
            }
        }
        assert_eq!(store.tenant_activity("fund-a").await.unwrap().processing, 3);
        assert_eq!(store.tenant_activity("fund-b").await.unwrap().processing, 5);
    }

    #[tokio::test]
    async fn blocked_and_excluded_subjects_are_skipped() {
        let store = MemoryStore::new();
        for subject in ["deal-listed", "deal-flagged", "deal-excluded", "deal-ok"] {
            store
                .enqueue(NewJob::new(subject, "fund-a", "web"), t0())
                .await
                .unwrap();
        }
        store
            .add_block(&KillSwitchEntry {
                id: Uuid::new_v4(),
                scope: BlockScope::Subject("deal-listed".into()),
                reason: "legal hold".into(),
                blocked_until: None,
                created_at: t0(),
            })
            .await
            .unwrap();
        store.upsert_subject("deal-flagged", "fund-a", t0()).await.unwrap();
        store
            .set_subject_block(
                "deal-flagged",
                Some(t0() + TimeDelta::hours(1)),
                Some("cooldown"),
                t0(),
            )
            .await
            .unwrap();

        let request = ClaimRequest {
            max_jobs: 10,
            default_tenant_cap: 10,
            excluded_subjects: HashSet::from(["deal-excluded".to_string()]),
            ..Default::default()
        };
        let claimed = store.claim_next_batch(&request, t0()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].subject_id, "deal-ok");
    }

    #[tokio::test]
    async fn reclaim_requeues_then_fails_at_ceiling() {
        let store = MemoryStore::new();
        let id = store
            .enqueue(NewJob::new("deal-1", "fund-a", "web"), t0())
            .await
            .unwrap()
            .job_id();
        store.claim_next_batch(&claim_all(1, 1), t0()).await.unwrap();

        let later = t0() + TimeDelta::minutes(31);
        let cutoff = later - TimeDelta::minutes(30);
        let summary = store.reclaim_stuck(cutoff, 2, later).await.unwrap();
        assert_eq!(summary, ReclaimSummary { reclaimed: 1, failed: 0 });

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 1);
        assert!(job.started_at.is_none());
        assert!(job.error_message.as_deref().unwrap().contains("reclaimed at"));

        // A second sweep with nothing processing is a no-op.
        let again = store.reclaim_stuck(cutoff, 2, later).await.unwrap();
        assert_eq!(again.total(), 0);

        store.claim_next_batch(&claim_all(1, 1), later).await.unwrap();
        let much_later = later + TimeDelta::minutes(31);
        let summary = store
            .reclaim_stuck(much_later - TimeDelta::minutes(30), 2, much_later)
            .await
            .unwrap();
        assert_eq!(summary, ReclaimSummary { reclaimed: 0, failed: 1 });
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 2);
    }

    #[tokio::test]
    async fn transitions_require_processing() {
        let store = MemoryStore::new();
        let id = store
            .enqueue(NewJob::new("deal-1", "fund-a", "web"), t0())
            .await
            .unwrap()
            .job_id();
        let err = store.complete_job(id, t0()).await.unwrap_err();
        assert!(matches!(err, StoreError::StaleTransition { .. }));

        let missing = store.complete_job(Uuid::new_v4(), t0()).await.unwrap_err();
        assert!(matches!(missing, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn settings_update_detects_stale_version() {
        let store = MemoryStore::new();
        store.upsert_subject("deal-1", "fund-a", t0()).await.unwrap();
        let updated = store
            .update_settings("deal-1", 0, &serde_json::json!({"irr_threshold": 20}), t0())
            .await
            .unwrap();
        assert_eq!(updated.version, 1);

        let stale = store
            .update_settings("deal-1", 0, &serde_json::json!({"irr_threshold": 25}), t0())
            .await
            .unwrap_err();
        assert!(matches!(stale, StoreError::WriteConflict(_)));
    }

    #[tokio::test]
    async fn run_closes_exactly_once() {
        let store = MemoryStore::new();
        let run = store.open_run("deal-1", "fund-a", t0()).await.unwrap();
        let same = store
            .open_run("deal-1", "fund-a", t0() + TimeDelta::seconds(5))
            .await
            .unwrap();
        assert_eq!(run.started_at, same.started_at);

        let first = store
            .close_run("deal-1", run.started_at, CompletionState::Completed, 80.0, t0())
            .await
            .unwrap();
        let second = store
            .close_run("deal-1", run.started_at, CompletionState::Completed, 80.0, t0())
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
        assert!(store.current_run("deal-1").await.unwrap().is_none());
        assert_eq!(
            store.last_closed_run("deal-1").await.unwrap().unwrap().outcome,
            Some(CompletionState::Completed)
        );
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.try_acquire_lease("tick", "a", ttl, t0()).await.unwrap());
        assert!(!store.try_acquire_lease("tick", "b", ttl, t0()).await.unwrap());
        assert!(store.try_acquire_lease("tick", "a", ttl, t0()).await.unwrap());
        assert!(store
            .try_acquire_lease("tick", "b", ttl, t0() + TimeDelta::seconds(61))
            .await
            .unwrap());
        store.release_lease("tick", "b").await.unwrap();
        assert!(store.try_acquire_lease("tick", "a", ttl, t0()).await.unwrap());
    }

    #[test]
    fn blocked_subject_set_ignores_expired_and_global() {
        let entries = vec![
            KillSwitchEntry {
                id: Uuid::new_v4(),
                scope: BlockScope::Global,
                reason: "maintenance".into(),
                blocked_until: None,
                created_at: t0(),
            },
            KillSwitchEntry {
                id: Uuid::new_v4(),
                scope: BlockScope::Subject("deal-old".into()),
                reason: "expired".into(),
                blocked_until: Some(t0() - TimeDelta::minutes(1)),
                created_at: t0(),
            },
            KillSwitchEntry {
                id: Uuid::new_v4(),
                scope: BlockScope::Subject("deal-live".into()),
                reason: "hold".into(),
                blocked_until: None,
                created_at: t0(),
            },
        ];
        assert_eq!(
            blocked_subjects(&entries, t0()),
            HashSet::from(["deal-live".to_string()])
        );
    }
}
