use std::sync::Arc;
use std::time::Duration;

use dealflow_core::{instant_before, Clock, ReclaimSummary};
use dealflow_storage::AnalysisStore;
use tracing::{debug, warn};

/// Requeues or fails jobs left in `processing` past the stuck threshold.
pub struct ZombieReclaimer {
    store: Arc<dyn AnalysisStore>,
    clock: Arc<dyn Clock>,
    stuck_threshold: Duration,
    max_attempts: u32,
}

impl ZombieReclaimer {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        clock: Arc<dyn Clock>,
        stuck_threshold: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            clock,
            stuck_threshold,
            max_attempts,
        }
    }

    /// One sweep. Store errors are logged and left for the next sweep.
    pub async fn reclaim(&self) -> ReclaimSummary {
        let now = self.clock.now();
        let cutoff = instant_before(now, self.stuck_threshold);
        match self
            .store
            .reclaim_stuck(cutoff, self.max_attempts, now)
            .await
        {
            Ok(summary) if summary.total() > 0 => {
                warn!(
                    reclaimed = summary.reclaimed,
                    failed = summary.failed,
                    stuck_before = %cutoff,
                    "reclaimed zombie jobs"
                );
                summary
            }
            Ok(summary) => {
                debug!("no zombie jobs found");
                summary
            }
            Err(err) => {
                warn!(error = %err, "zombie sweep failed; retrying next sweep");
                ReclaimSummary::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeDelta, Utc};
    use dealflow_core::{JobStatus, ManualClock, NewJob};
    use dealflow_storage::{ClaimRequest, JobStore, MemoryStore};

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn claim_one(store: &MemoryStore, at: DateTime<Utc>) -> uuid::Uuid {
        let request = ClaimRequest {
            max_jobs: 1,
            default_tenant_cap: 5,
            ..ClaimRequest::default()
        };
        store.claim_next_batch(&request, at).await.unwrap()[0].id
    }

    #[tokio::test]
    async fn stuck_jobs_are_requeued_once_per_sweep_then_failed() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let reclaimer = ZombieReclaimer::new(
            store.clone(),
            clock.clone(),
            Duration::from_secs(30 * 60),
            2,
        );
        store
            .enqueue(NewJob::new("acme", "fund-a", "crunchbase"), start())
            .await
            .unwrap();
        let id = claim_one(&store, start()).await;

        clock.advance(TimeDelta::minutes(10));
        assert_eq!(reclaimer.reclaim().await, ReclaimSummary::default());

        clock.advance(TimeDelta::minutes(25));
        let summary = reclaimer.reclaim().await;
        assert_eq!(summary.reclaimed, 1);
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 1);
        assert!(job.started_at.is_none());

        assert_eq!(reclaimer.reclaim().await.total(), 0);

        claim_one(&store, clock.now()).await;
        clock.advance(TimeDelta::minutes(31));
        let summary = reclaimer.reclaim().await;
        assert_eq!(summary.failed, 1);
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 2);
    }
}
