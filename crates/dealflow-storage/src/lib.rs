//! Durable state for the analysis engine: jobs, engine results, waterfall
//! runs, kill-switch entries, subject configuration and scheduler leases.
//!
//! Every state transition is conditional on the expected prior state so that
//! concurrent schedulers, reclaimers and operators never lose updates.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealflow_core::{
    BlockScope, CompletionState, EngineResult, Job, JobStatus, KillSwitchEntry, NewJob, Priority,
    QueueDepthRow, ReclaimSummary, SubjectConfig, TenantActivity, WaterfallRun,
};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "dealflow-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("active job {existing_id} already exists for {subject_id}/{engine_name}")]
    DuplicateActiveJob {
        existing_id: Uuid,
        subject_id: String,
        engine_name: String,
    },
    #[error("write conflict on {0}")]
    WriteConflict(String),
    #[error("job {id} is no longer {expected}")]
    StaleTransition { id: Uuid, expected: JobStatus },
    #[error("{0} not found")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Decode(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(Uuid),
    /// An active job already existed at a lower priority and was bumped.
    Promoted { id: Uuid, from: Priority },
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Created(id) => *id,
            Self::Promoted { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClaimRequest {
    pub max_jobs: usize,
    pub tenant_caps: HashMap<String, usize>,
    pub default_tenant_cap: usize,
    /// Subjects that must not be claimed regardless of stored block state.
    pub excluded_subjects: HashSet<String>,
}

impl ClaimRequest {
    pub fn cap_for(&self, tenant_id: &str) -> usize {
        self.tenant_caps
            .get(tenant_id)
            .copied()
            .unwrap_or(self.default_tenant_cap)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a queued job, or promote the active one for the same
    /// (subject, engine) when the new priority is strictly higher.
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> StoreResult<EnqueueOutcome>;

    /// Move up to `max_jobs` eligible queued jobs to `processing`, highest
    /// priority first and FIFO within a priority, never exceeding tenant caps.
    async fn claim_next_batch(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Job>>;

    async fn complete_job(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Job>;

    async fn fail_job(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> StoreResult<Job>;

    /// Put a failed attempt back in the queue, eligible again at `next_eligible_at`.
    async fn requeue_job(
        &self,
        id: Uuid,
        error: &str,
        next_eligible_at: DateTime<Utc>,
    ) -> StoreResult<Job>;

    /// Undo a claim without consuming an attempt.
    async fn release_job(&self, id: Uuid) -> StoreResult<Job>;

    async fn reclaim_stuck(
        &self,
        stuck_before: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<ReclaimSummary>;

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>>;

    async fn jobs_for_subject(&self, subject_id: &str) -> StoreResult<Vec<Job>>;

    /// Engines with a queued or processing job for the subject.
    async fn active_engines(&self, subject_id: &str) -> StoreResult<BTreeSet<String>>;

    async fn tenant_activity(&self, tenant_id: &str) -> StoreResult<TenantActivity>;

    async fn queue_depth(&self) -> StoreResult<Vec<QueueDepthRow>>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn append_result(&self, result: &EngineResult) -> StoreResult<()>;

    /// Results for the subject produced strictly after `since`, oldest first.
    async fn results_since(
        &self,
        subject_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<EngineResult>>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Return the subject's open run, opening one at `now` if there is none.
    async fn open_run(
        &self,
        subject_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<WaterfallRun>;

    async fn current_run(&self, subject_id: &str) -> StoreResult<Option<WaterfallRun>>;

    async fn last_closed_run(&self, subject_id: &str) -> StoreResult<Option<WaterfallRun>>;

    async fn open_runs(&self) -> StoreResult<Vec<WaterfallRun>>;

    /// Close the run identified by its trigger timestamp. Returns `true` only
    /// for the single caller that performed the close.
    async fn close_run(
        &self,
        subject_id: &str,
        started_at: DateTime<Utc>,
        outcome: CompletionState,
        completeness_score: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn reopen_run(&self, subject_id: &str, started_at: DateTime<Utc>) -> StoreResult<bool>;

    async fn record_integration(
        &self,
        subject_id: &str,
        started_at: DateTime<Utc>,
        succeeded: bool,
        data_points_created: i64,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait BlocklistStore: Send + Sync {
    async fn add_block(&self, entry: &KillSwitchEntry) -> StoreResult<()>;

    async fn remove_block(&self, id: Uuid) -> StoreResult<bool>;

    async fn list_blocks(&self) -> StoreResult<Vec<KillSwitchEntry>>;

    /// Unexpired entries for exactly this scope, oldest first.
    async fn active_blocks(
        &self,
        scope: &BlockScope,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<KillSwitchEntry>>;
}

#[async_trait]
pub trait SubjectStore: Send + Sync {
    /// Ensure a config row exists for the subject and return it.
    async fn upsert_subject(
        &self,
        subject_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<SubjectConfig>;

    async fn get_subject(&self, subject_id: &str) -> StoreResult<Option<SubjectConfig>>;

    /// Replace settings if the stored version still equals `expected_version`;
    /// otherwise fail with [`StoreError::WriteConflict`].
    async fn update_settings(
        &self,
        subject_id: &str,
        expected_version: i64,
        settings: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<SubjectConfig>;

    async fn set_subject_block(
        &self,
        subject_id: &str,
        blocked_until: Option<DateTime<Utc>>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<SubjectConfig>;
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take or renew the named lease if it is free, expired, or already ours.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: std::time::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn release_lease(&self, name: &str, holder: &str) -> StoreResult<()>;
}

/// Everything the analysis services need from persistence.
pub trait AnalysisStore:
    JobStore + ResultStore + RunStore + BlocklistStore + SubjectStore + LeaseStore
{
}

impl<T> AnalysisStore for T where
    T: JobStore + ResultStore + RunStore + BlocklistStore + SubjectStore + LeaseStore
{
}

pub(crate) fn reclaim_note(now: DateTime<Utc>) -> String {
    format!(
        "reclaimed at {} after exceeding the stuck-processing threshold",
        now.to_rfc3339()
    )
}

pub(crate) fn append_note(existing: Option<&str>, note: &str) -> String {
    match existing {
        Some(prev) if !prev.is_empty() => format!("{prev}; {note}"),
        _ => note.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_lookup_falls_back_to_default() {
        let request = ClaimRequest {
            max_jobs: 10,
            tenant_caps: HashMap::from([("fund-a".to_string(), 1)]),
            default_tenant_cap: 4,
            excluded_subjects: HashSet::new(),
        };
        assert_eq!(request.cap_for("fund-a"), 1);
        assert_eq!(request.cap_for("fund-b"), 4);
    }

    #[test]
    fn notes_accumulate() {
        assert_eq!(append_note(None, "first"), "first");
        assert_eq!(append_note(Some(""), "first"), "first");
        assert_eq!(append_note(Some("timeout"), "reclaimed"), "timeout; reclaimed");
    }
}
