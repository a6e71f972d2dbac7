//! Postgres-backed store. Claims serialize on a transaction-scoped advisory
//! lock and lock candidate rows with `FOR UPDATE SKIP LOCKED`, so several
//! scheduler processes can share one queue.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealflow_core::{
    instant_after, BlockScope, CompletionState, EngineResult, Job, JobStatus, KillSwitchEntry,
    NewJob, Priority, QueueDepthRow, ReclaimSummary, SubjectConfig, TenantActivity, WaterfallRun,
};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    reclaim_note, BlocklistStore, ClaimRequest, EnqueueOutcome, JobStore, LeaseStore,
    ResultStore, RunStore, StoreError, StoreResult, SubjectStore,
};

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

const CLAIM_LOCK_KEY: i64 = 0x6466_636c_6169_6d;

const JOB_COLUMNS: &str = "id, subject_id, tenant_id, engine_name, priority, status, \
     attempt_count, created_at, started_at, completed_at, next_eligible_at, error_message";

const RUN_COLUMNS: &str = "subject_id, tenant_id, started_at, closed_at, outcome, \
     completeness_score, integration_succeeded, data_points_created";

const SUBJECT_COLUMNS: &str =
    "subject_id, tenant_id, settings, version, blocked_until, block_reason, updated_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("analysis schema migrations applied");
        Ok(())
    }

    async fn stale_or_missing(&self, id: Uuid) -> StoreError {
        let exists = sqlx::query("SELECT 1 FROM analysis_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await;
        match exists {
            Ok(Some(_)) => StoreError::StaleTransition {
                id,
                expected: JobStatus::Processing,
            },
            Ok(None) => StoreError::NotFound(format!("job {id}")),
            Err(err) => StoreError::Database(err),
        }
    }

    async fn transition(&self, id: Uuid, query: PgQuery<'_>) -> StoreResult<Job> {
        match query.fetch_optional(&self.pool).await? {
            Some(row) => job_from_row(&row),
            None => Err(self.stale_or_missing(id).await),
        }
    }
}

fn job_from_row(row: &PgRow) -> StoreResult<Job> {
    let priority: i16 = row.try_get("priority")?;
    let status: String = row.try_get("status")?;
    let attempt_count: i32 = row.try_get("attempt_count")?;
    Ok(Job {
        id: row.try_get("id")?,
        subject_id: row.try_get("subject_id")?,
        tenant_id: row.try_get("tenant_id")?,
        engine_name: row.try_get("engine_name")?,
        priority: Priority::from_rank(priority)
            .ok_or_else(|| StoreError::Decode(format!("priority rank {priority}")))?,
        status: status
            .parse()
            .map_err(|_| StoreError::Decode(format!("job status `{status}`")))?,
        attempt_count: u32::try_from(attempt_count).unwrap_or_default(),
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        next_eligible_at: row.try_get("next_eligible_at")?,
        error_message: row.try_get("error_message")?,
    })
}

fn result_from_row(row: &PgRow) -> StoreResult<EngineResult> {
    let status: String = row.try_get("status")?;
    Ok(EngineResult {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        engine_name: row.try_get("engine_name")?,
        subject_id: row.try_get("subject_id")?,
        tenant_id: row.try_get("tenant_id")?,
        status: status
            .parse()
            .map_err(|_| StoreError::Decode(format!("engine status `{status}`")))?,
        confidence: row.try_get("confidence")?,
        data_completeness: row.try_get("data_completeness")?,
        payload: row.try_get("payload")?,
        error: row.try_get("error")?,
        produced_at: row.try_get("produced_at")?,
    })
}

fn run_from_row(row: &PgRow) -> StoreResult<WaterfallRun> {
    let outcome: Option<String> = row.try_get("outcome")?;
    let outcome = outcome
        .map(|o| {
            o.parse::<CompletionState>()
                .map_err(|_| StoreError::Decode(format!("run outcome `{o}`")))
        })
        .transpose()?;
    Ok(WaterfallRun {
        subject_id: row.try_get("subject_id")?,
        tenant_id: row.try_get("tenant_id")?,
        started_at: row.try_get("started_at")?,
        closed_at: row.try_get("closed_at")?,
        outcome,
        completeness_score: row.try_get("completeness_score")?,
        integration_succeeded: row.try_get("integration_succeeded")?,
        data_points_created: row.try_get("data_points_created")?,
    })
}

fn block_from_row(row: &PgRow) -> StoreResult<KillSwitchEntry> {
    let scope_kind: String = row.try_get("scope_kind")?;
    let subject_id: Option<String> = row.try_get("subject_id")?;
    let scope = match (scope_kind.as_str(), subject_id) {
        ("global", _) => BlockScope::Global,
        ("subject", Some(id)) => BlockScope::Subject(id),
        (kind, _) => return Err(StoreError::Decode(format!("block scope `{kind}`"))),
    };
    Ok(KillSwitchEntry {
        id: row.try_get("id")?,
        scope,
        reason: row.try_get("reason")?,
        blocked_until: row.try_get("blocked_until")?,
        created_at: row.try_get("created_at")?,
    })
}

fn subject_from_row(row: &PgRow) -> StoreResult<SubjectConfig> {
    Ok(SubjectConfig {
        subject_id: row.try_get("subject_id")?,
        tenant_id: row.try_get("tenant_id")?,
        settings: row.try_get("settings")?,
        version: row.try_get("version")?,
        blocked_until: row.try_get("blocked_until")?,
        block_reason: row.try_get("block_reason")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn scope_parts(scope: &BlockScope) -> (&'static str, Option<&str>) {
    match scope {
        BlockScope::Global => ("global", None),
        BlockScope::Subject(id) => ("subject", Some(id.as_str())),
    }
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

async fn running_per_tenant(
    tx: &mut Transaction<'_, Postgres>,
) -> StoreResult<HashMap<String, usize>> {
    let rows = sqlx::query(
        r#"
        SELECT tenant_id, COUNT(*) AS running
          FROM analysis_jobs
         WHERE status = 'processing'
         GROUP BY tenant_id
        "#,
    )
    .fetch_all(&mut **tx)
    .await?;

    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        let running: i64 = row.try_get("running")?;
        out.insert(row.try_get("tenant_id")?, count(running) as usize);
    }
    Ok(out)
}

#[async_trait]
impl JobStore for PgStore {
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> StoreResult<EnqueueOutcome> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            r#"
            SELECT id, priority
              FROM analysis_jobs
             WHERE subject_id = $1
               AND engine_name = $2
               AND status IN ('queued', 'processing')
             FOR UPDATE
            "#,
        )
        .bind(&job.subject_id)
        .bind(&job.engine_name)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let id: Uuid = row.try_get("id")?;
            let rank: i16 = row.try_get("priority")?;
            let from = Priority::from_rank(rank)
                .ok_or_else(|| StoreError::Decode(format!("priority rank {rank}")))?;
            if job.priority > from {
                sqlx::query("UPDATE analysis_jobs SET priority = $2 WHERE id = $1")
                    .bind(id)
                    .bind(job.priority.rank())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                return Ok(EnqueueOutcome::Promoted { id, from });
            }
            tx.rollback().await?;
            return Err(StoreError::DuplicateActiveJob {
                existing_id: id,
                subject_id: job.subject_id,
                engine_name: job.engine_name,
            });
        }

        let id = Uuid::new_v4();
        let inserted = sqlx::query(
            r#"
            INSERT INTO analysis_jobs
                (id, subject_id, tenant_id, engine_name, priority, status,
                 attempt_count, created_at, next_eligible_at)
            VALUES ($1, $2, $3, $4, $5, 'queued', 0, $6, $7)
            ON CONFLICT (subject_id, engine_name) WHERE status IN ('queued', 'processing')
            DO NOTHING
            "#,
        )
        .bind(id)
        .bind(&job.subject_id)
        .bind(&job.tenant_id)
        .bind(&job.engine_name)
        .bind(job.priority.rank())
        .bind(now)
        .bind(instant_after(now, job.delay))
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            let winner: Uuid = sqlx::query(
                r#"
                SELECT id FROM analysis_jobs
                 WHERE subject_id = $1 AND engine_name = $2
                   AND status IN ('queued', 'processing')
                "#,
            )
            .bind(&job.subject_id)
            .bind(&job.engine_name)
            .fetch_one(&self.pool)
            .await?
            .try_get("id")?;
            return Err(StoreError::DuplicateActiveJob {
                existing_id: winner,
                subject_id: job.subject_id,
                engine_name: job.engine_name,
            });
        }

        tx.commit().await?;
        Ok(EnqueueOutcome::Created(id))
    }

    async fn claim_next_batch(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Job>> {
        if request.max_jobs == 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CLAIM_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let mut running = running_per_tenant(&mut tx).await?;
        let excluded = request.excluded_subjects.iter().cloned().collect::<Vec<_>>();
        // Over-fetch so capped tenants do not starve the rest of the batch.
        let scan_limit =
            i64::try_from(request.max_jobs.saturating_mul(8).max(64)).unwrap_or(i64::MAX);
        let candidates = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
              FROM analysis_jobs j
             WHERE j.status = 'queued'
               AND j.next_eligible_at <= $1
               AND NOT (j.subject_id = ANY($2))
               AND NOT EXISTS (
                     SELECT 1 FROM kill_switch_entries k
                      WHERE k.scope_kind = 'subject'
                        AND k.subject_id = j.subject_id
                        AND (k.blocked_until IS NULL OR k.blocked_until > $1))
               AND NOT EXISTS (
                     SELECT 1 FROM subjects s
                      WHERE s.subject_id = j.subject_id
                        AND s.blocked_until > $1)
             ORDER BY j.priority DESC, j.created_at ASC
             LIMIT $3
             FOR UPDATE OF j SKIP LOCKED
            "#
        ))
        .bind(now)
        .bind(&excluded)
        .bind(scan_limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::new();
        for row in candidates {
            if claimed.len() >= request.max_jobs {
                break;
            }
            let candidate = job_from_row(&row)?;
            let in_flight = running.entry(candidate.tenant_id.clone()).or_default();
            if *in_flight >= request.cap_for(&candidate.tenant_id) {
                continue;
            }
            let updated = sqlx::query(&format!(
                r#"
                UPDATE analysis_jobs
                   SET status = 'processing',
                       started_at = $2
                 WHERE id = $1
                   AND status = 'queued'
                RETURNING {JOB_COLUMNS}
                "#
            ))
            .bind(candidate.id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = updated {
                *in_flight += 1;
                claimed.push(job_from_row(&row)?);
            }
        }

        tx.commit().await?;
        debug!(claimed = claimed.len(), "claimed analysis jobs");
        Ok(claimed)
    }

    async fn complete_job(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<Job> {
        let sql = format!(
            r#"
            UPDATE analysis_jobs
               SET status = 'completed',
                   completed_at = $2,
                   attempt_count = attempt_count + 1
             WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.transition(id, sqlx::query(&sql).bind(id).bind(now)).await
    }

    async fn fail_job(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> StoreResult<Job> {
        let sql = format!(
            r#"
            UPDATE analysis_jobs
               SET status = 'failed',
                   completed_at = $2,
                   attempt_count = attempt_count + 1,
                   error_message = $3
             WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.transition(id, sqlx::query(&sql).bind(id).bind(now).bind(error))
            .await
    }

    async fn requeue_job(
        &self,
        id: Uuid,
        error: &str,
        next_eligible_at: DateTime<Utc>,
    ) -> StoreResult<Job> {
        let sql = format!(
            r#"
            UPDATE analysis_jobs
               SET status = 'queued',
                   started_at = NULL,
                   attempt_count = attempt_count + 1,
                   next_eligible_at = $2,
                   error_message = $3
             WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.transition(
            id,
            sqlx::query(&sql).bind(id).bind(next_eligible_at).bind(error),
        )
        .await
    }

    async fn release_job(&self, id: Uuid) -> StoreResult<Job> {
        let sql = format!(
            r#"
            UPDATE analysis_jobs
               SET status = 'queued',
                   started_at = NULL
             WHERE id = $1 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.transition(id, sqlx::query(&sql).bind(id)).await
    }

    async fn reclaim_stuck(
        &self,
        stuck_before: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<ReclaimSummary> {
        let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);
        let rows = sqlx::query(
            r#"
            WITH stuck AS (
                SELECT id
                  FROM analysis_jobs
                 WHERE status = 'processing'
                   AND started_at < $1
                 FOR UPDATE SKIP LOCKED
            )
            UPDATE analysis_jobs j
               SET attempt_count = j.attempt_count + 1,
                   status = CASE WHEN j.attempt_count + 1 >= $2 THEN 'failed' ELSE 'queued' END,
                   started_at = NULL,
                   completed_at = CASE WHEN j.attempt_count + 1 >= $2 THEN $3::timestamptz END,
                   next_eligible_at = $3::timestamptz,
                   error_message = CONCAT_WS('; ', NULLIF(j.error_message, ''), $4::text)
              FROM stuck
             WHERE j.id = stuck.id
               AND j.status = 'processing'
            RETURNING j.status
            "#,
        )
        .bind(stuck_before)
        .bind(max_attempts)
        .bind(now)
        .bind(reclaim_note(now))
        .fetch_all(&self.pool)
        .await?;

        let mut summary = ReclaimSummary::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            if status == JobStatus::Failed.as_str() {
                summary.failed += 1;
            } else {
                summary.reclaimed += 1;
            }
        }
        Ok(summary)
    }

    async fn get_job(&self, id: Uuid) -> StoreResult<Option<Job>> {
        sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(job_from_row)
            .transpose()
    }

    async fn jobs_for_subject(&self, subject_id: &str) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE subject_id = $1 ORDER BY created_at, id"
        ))
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn active_engines(&self, subject_id: &str) -> StoreResult<BTreeSet<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT engine_name
              FROM analysis_jobs
             WHERE subject_id = $1
               AND status IN ('queued', 'processing')
            "#,
        )
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = BTreeSet::new();
        for row in rows {
            out.insert(row.try_get("engine_name")?);
        }
        Ok(out)
    }

    async fn tenant_activity(&self, tenant_id: &str) -> StoreResult<TenantActivity> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                   COUNT(*) FILTER (WHERE status = 'processing') AS processing
              FROM analysis_jobs
             WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(TenantActivity {
            queued: count(row.try_get("queued")?),
            processing: count(row.try_get("processing")?),
        })
    }

    async fn queue_depth(&self) -> StoreResult<Vec<QueueDepthRow>> {
        let rows = sqlx::query(
            r#"
            SELECT status, priority, COUNT(*) AS jobs
              FROM analysis_jobs
             GROUP BY status, priority
             ORDER BY status, priority DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let rank: i16 = row.try_get("priority")?;
            out.push(QueueDepthRow {
                status: status
                    .parse()
                    .map_err(|_| StoreError::Decode(format!("job status `{status}`")))?,
                priority: Priority::from_rank(rank)
                    .ok_or_else(|| StoreError::Decode(format!("priority rank {rank}")))?,
                count: count(row.try_get("jobs")?),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl ResultStore for PgStore {
    async fn append_result(&self, result: &EngineResult) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO engine_results
                (id, job_id, engine_name, subject_id, tenant_id, status,
                 confidence, data_completeness, payload, error, produced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(result.id)
        .bind(result.job_id)
        .bind(&result.engine_name)
        .bind(&result.subject_id)
        .bind(&result.tenant_id)
        .bind(result.status.as_str())
        .bind(result.confidence)
        .bind(result.data_completeness)
        .bind(&result.payload)
        .bind(&result.error)
        .bind(result.produced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn results_since(
        &self,
        subject_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<EngineResult>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, engine_name, subject_id, tenant_id, status,
                   confidence, data_completeness, payload, error, produced_at
              FROM engine_results
             WHERE subject_id = $1
               AND ($2::timestamptz IS NULL OR produced_at > $2)
             ORDER BY produced_at ASC
            "#,
        )
        .bind(subject_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn open_run(
        &self,
        subject_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<WaterfallRun> {
        sqlx::query(
            r#"
            INSERT INTO waterfall_runs (subject_id, tenant_id, started_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (subject_id) WHERE closed_at IS NULL DO NOTHING
            "#,
        )
        .bind(subject_id)
        .bind(tenant_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.current_run(subject_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("open waterfall run for {subject_id}")))
    }

    async fn current_run(&self, subject_id: &str) -> StoreResult<Option<WaterfallRun>> {
        sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM waterfall_runs WHERE subject_id = $1 AND closed_at IS NULL"
        ))
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(run_from_row)
        .transpose()
    }

    async fn last_closed_run(&self, subject_id: &str) -> StoreResult<Option<WaterfallRun>> {
        sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS}
              FROM waterfall_runs
             WHERE subject_id = $1 AND closed_at IS NOT NULL
             ORDER BY closed_at DESC
             LIMIT 1
            "#
        ))
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(run_from_row)
        .transpose()
    }

    async fn open_runs(&self) -> StoreResult<Vec<WaterfallRun>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM waterfall_runs WHERE closed_at IS NULL ORDER BY started_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn close_run(
        &self,
        subject_id: &str,
        started_at: DateTime<Utc>,
        outcome: CompletionState,
        completeness_score: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let done = sqlx::query(
            r#"
            UPDATE waterfall_runs
               SET closed_at = $3,
                   outcome = $4,
                   completeness_score = $5
             WHERE subject_id = $1
               AND started_at = $2
               AND closed_at IS NULL
            "#,
        )
        .bind(subject_id)
        .bind(started_at)
        .bind(now)
        .bind(outcome.as_str())
        .bind(completeness_score)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn reopen_run(&self, subject_id: &str, started_at: DateTime<Utc>) -> StoreResult<bool> {
        let done = sqlx::query(
            r#"
            UPDATE waterfall_runs
               SET closed_at = NULL,
                   outcome = NULL,
                   completeness_score = NULL,
                   integration_succeeded = NULL,
                   data_points_created = NULL
             WHERE subject_id = $1
               AND started_at = $2
               AND closed_at IS NOT NULL
               AND NOT EXISTS (
                     SELECT 1 FROM waterfall_runs o
                      WHERE o.subject_id = $1 AND o.closed_at IS NULL)
            "#,
        )
        .bind(subject_id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn record_integration(
        &self,
        subject_id: &str,
        started_at: DateTime<Utc>,
        succeeded: bool,
        data_points_created: i64,
    ) -> StoreResult<()> {
        let done = sqlx::query(
            r#"
            UPDATE waterfall_runs
               SET integration_succeeded = $3,
                   data_points_created = $4
             WHERE subject_id = $1 AND started_at = $2
            "#,
        )
        .bind(subject_id)
        .bind(started_at)
        .bind(succeeded)
        .bind(data_points_created)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("waterfall run for {subject_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl BlocklistStore for PgStore {
    async fn add_block(&self, entry: &KillSwitchEntry) -> StoreResult<()> {
        let (kind, subject_id) = scope_parts(&entry.scope);
        sqlx::query(
            r#"
            INSERT INTO kill_switch_entries (id, scope_kind, subject_id, reason, blocked_until, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(kind)
        .bind(subject_id)
        .bind(&entry.reason)
        .bind(entry.blocked_until)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_block(&self, id: Uuid) -> StoreResult<bool> {
        let done = sqlx::query("DELETE FROM kill_switch_entries WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn list_blocks(&self) -> StoreResult<Vec<KillSwitchEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, scope_kind, subject_id, reason, blocked_until, created_at
              FROM kill_switch_entries
             ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(block_from_row).collect()
    }

    async fn active_blocks(
        &self,
        scope: &BlockScope,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<KillSwitchEntry>> {
        let (kind, subject_id) = scope_parts(scope);
        let rows = sqlx::query(
            r#"
            SELECT id, scope_kind, subject_id, reason, blocked_until, created_at
              FROM kill_switch_entries
             WHERE scope_kind = $1
               AND subject_id IS NOT DISTINCT FROM $2
               AND (blocked_until IS NULL OR blocked_until > $3)
             ORDER BY created_at
            "#,
        )
        .bind(kind)
        .bind(subject_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(block_from_row).collect()
    }
}

#[async_trait]
impl SubjectStore for PgStore {
    async fn upsert_subject(
        &self,
        subject_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<SubjectConfig> {
        sqlx::query(
            r#"
            INSERT INTO subjects (subject_id, tenant_id, settings, version, updated_at)
            VALUES ($1, $2, '{}'::jsonb, 0, $3)
            ON CONFLICT (subject_id) DO NOTHING
            "#,
        )
        .bind(subject_id)
        .bind(tenant_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get_subject(subject_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("subject {subject_id}")))
    }

    async fn get_subject(&self, subject_id: &str) -> StoreResult<Option<SubjectConfig>> {
        sqlx::query(&format!(
            "SELECT {SUBJECT_COLUMNS} FROM subjects WHERE subject_id = $1"
        ))
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(subject_from_row)
        .transpose()
    }

    async fn update_settings(
        &self,
        subject_id: &str,
        expected_version: i64,
        settings: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> StoreResult<SubjectConfig> {
        let updated = sqlx::query(&format!(
            r#"
            UPDATE subjects
               SET settings = $3,
                   version = version + 1,
                   updated_at = $4
             WHERE subject_id = $1 AND version = $2
            RETURNING {SUBJECT_COLUMNS}
            "#
        ))
        .bind(subject_id)
        .bind(expected_version)
        .bind(settings)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(row) => subject_from_row(&row),
            None => match self.get_subject(subject_id).await? {
                Some(current) => Err(StoreError::WriteConflict(format!(
                    "subject {subject_id} at version {} (expected {expected_version})",
                    current.version
                ))),
                None => Err(StoreError::NotFound(format!("subject {subject_id}"))),
            },
        }
    }

    async fn set_subject_block(
        &self,
        subject_id: &str,
        blocked_until: Option<DateTime<Utc>>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<SubjectConfig> {
        sqlx::query(&format!(
            r#"
            UPDATE subjects
               SET blocked_until = $2,
                   block_reason = $3,
                   updated_at = $4
             WHERE subject_id = $1
            RETURNING {SUBJECT_COLUMNS}
            "#
        ))
        .bind(subject_id)
        .bind(blocked_until)
        .bind(reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(subject_from_row)
        .transpose()?
        .ok_or_else(|| StoreError::NotFound(format!("subject {subject_id}")))
    }
}

#[async_trait]
impl LeaseStore for PgStore {
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: std::time::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let done = sqlx::query(
            r#"
            INSERT INTO scheduler_leases (name, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
               SET holder = EXCLUDED.holder,
                   expires_at = EXCLUDED.expires_at
             WHERE scheduler_leases.expires_at <= $4
                OR scheduler_leases.holder = EXCLUDED.holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(instant_after(now, ttl))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM scheduler_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
