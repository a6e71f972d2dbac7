//! Guards subject configuration writes against in-flight analysis.

use std::future::Future;
use std::sync::Arc;

use dealflow_core::{Clock, SafetyCheck, TenantActivity};
use dealflow_engines::BackoffPolicy;
use dealflow_storage::{AnalysisStore, StoreError, StoreResult};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SafeUpdateError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("gave up after {attempts} conflicting write attempt(s)")]
    MaxRetriesExceeded { attempts: u32 },
    #[error("subject {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(StoreError),
}

impl SafeUpdateError {
    /// Stable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            Self::NotFound(_) => "not_found",
            Self::Store(_) => "store_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafeUpdateOutcome {
    pub version: i64,
    pub attempts: u32,
    pub safety: SafetyCheck,
}

pub struct ConflictGuard {
    store: Arc<dyn AnalysisStore>,
    clock: Arc<dyn Clock>,
    low_activity_threshold: u64,
    backoff: BackoffPolicy,
}

impl ConflictGuard {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        clock: Arc<dyn Clock>,
        low_activity_threshold: u64,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            low_activity_threshold,
            backoff,
        }
    }

    pub async fn check_safety(&self, tenant_id: &str) -> StoreResult<SafetyCheck> {
        let activity = self.store.tenant_activity(tenant_id).await?;
        Ok(safety_from_activity(activity, self.low_activity_threshold))
    }

    /// Merge `patch` into the subject's settings, retrying version conflicts
    /// up to `max_retries` times.
    pub async fn safe_update(
        &self,
        subject_id: &str,
        patch: &Value,
        max_retries: u32,
    ) -> Result<SafeUpdateOutcome, SafeUpdateError> {
        let patch = validate_patch(patch)?;

        let (updated, attempts) = retry_on_conflict(&self.backoff, max_retries, move || async move {
            let current = self
                .store
                .get_subject(subject_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("subject {subject_id}")))?;
            let merged = merge_settings(&current.settings, patch);
            self.store
                .update_settings(subject_id, current.version, &merged, self.clock.now())
                .await
        })
        .await
        .map_err(|err| match err {
            SafeUpdateError::Store(StoreError::NotFound(_)) => {
                SafeUpdateError::NotFound(subject_id.to_string())
            }
            other => other,
        })?;

        let safety = self
            .check_safety(&updated.tenant_id)
            .await
            .map_err(SafeUpdateError::Store)?;
        if !safety.can_safely_update {
            warn!(
                subject_id,
                tenant_id = %updated.tenant_id,
                processing = safety.processing_count,
                "settings changed while analysis is active"
            );
        }
        info!(subject_id, version = updated.version, attempts, "subject settings updated");
        Ok(SafeUpdateOutcome {
            version: updated.version,
            attempts,
            safety,
        })
    }
}

pub fn safety_from_activity(activity: TenantActivity, low_activity_threshold: u64) -> SafetyCheck {
    let can_safely_update =
        activity.processing == 0 && activity.queued < low_activity_threshold;
    let recommendation = if can_safely_update {
        "safe to update now".to_string()
    } else if activity.processing > 0 {
        format!(
            "{} job(s) processing; use safe_update or wait for them to finish",
            activity.processing
        )
    } else {
        format!(
            "{} job(s) queued; use safe_update or update after the queue drains",
            activity.queued
        )
    };
    SafetyCheck {
        has_active_analysis: activity.queued + activity.processing > 0,
        queued_count: activity.queued,
        processing_count: activity.processing,
        can_safely_update,
        recommendation,
    }
}

/// Run `op` until it stops reporting write conflicts. Returns the value and
/// the number of attempts made.
pub async fn retry_on_conflict<T, F, Fut>(
    backoff: &BackoffPolicy,
    max_retries: u32,
    mut op: F,
) -> Result<(T, u32), SafeUpdateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok((value, attempts)),
            Err(StoreError::WriteConflict(what)) if attempts <= max_retries => {
                let delay = backoff.delay_for_attempt(attempts - 1);
                warn!(%what, attempt = attempts, delay_ms = delay.as_millis() as u64, "write conflict; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(StoreError::WriteConflict(_)) => {
                return Err(SafeUpdateError::MaxRetriesExceeded { attempts })
            }
            Err(other) => return Err(SafeUpdateError::Store(other)),
        }
    }
}

fn validate_patch(patch: &Value) -> Result<&Map<String, Value>, SafeUpdateError> {
    let Some(object) = patch.as_object() else {
        return Err(SafeUpdateError::Validation(
            "patch must be a JSON object".to_string(),
        ));
    };
    if object.is_empty() {
        return Err(SafeUpdateError::Validation("patch is empty".to_string()));
    }
    for (key, value) in object {
        if key.ends_with("_threshold") {
            let in_range = value.as_f64().is_some_and(|v| (0.0..=100.0).contains(&v));
            if !in_range {
                return Err(SafeUpdateError::Validation(format!(
                    "`{key}` must be a number between 0 and 100"
                )));
            }
        }
    }
    Ok(object)
}

/// Shallow merge; `null` removes a key.
fn merge_settings(current: &Value, patch: &Map<String, Value>) -> Value {
    let mut merged = current.as_object().cloned().unwrap_or_default();
    for (key, value) in patch {
        if value.is_null() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use dealflow_core::{ManualClock, NewJob};
    use dealflow_storage::{ClaimRequest, JobStore, MemoryStore, SubjectStore};
    use serde_json::json;
    use std::time::Duration;

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn quick_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn guard(store: Arc<MemoryStore>) -> ConflictGuard {
        ConflictGuard::new(
            store,
            Arc::new(ManualClock::new(start())),
            3,
            quick_backoff(),
        )
    }

    #[tokio::test]
    async fn processing_jobs_make_updates_unsafe() {
        let store = Arc::new(MemoryStore::new());
        for engine in ["a", "b", "c"] {
            store
                .enqueue(NewJob::new("acme", "fund-a", engine), start())
                .await
                .unwrap();
        }
        let request = ClaimRequest {
            max_jobs: 10,
            default_tenant_cap: 10,
            ..ClaimRequest::default()
        };
        store.claim_next_batch(&request, start()).await.unwrap();

        let safety = guard(store).check_safety("fund-a").await.unwrap();
        assert_eq!(safety.processing_count, 3);
        assert!(safety.has_active_analysis);
        assert!(!safety.can_safely_update);
    }

    #[tokio::test]
    async fn idle_tenant_is_safe() {
        let store = Arc::new(MemoryStore::new());
        let safety = guard(store).check_safety("fund-a").await.unwrap();
        assert_eq!(safety.queued_count, 0);
        assert_eq!(safety.processing_count, 0);
        assert!(!safety.has_active_analysis);
        assert!(safety.can_safely_update);
    }

    #[test]
    fn queued_backlog_at_threshold_is_unsafe() {
        let activity = TenantActivity {
            queued: 3,
            processing: 0,
        };
        assert!(!safety_from_activity(activity, 3).can_safely_update);
        assert!(safety_from_activity(activity, 4).can_safely_update);
    }

    #[tokio::test]
    async fn safe_update_merges_and_bumps_version() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_subject("acme", "fund-a", start()).await.unwrap();
        let guard = guard(store.clone());

        let outcome = guard
            .safe_update("acme", &json!({"score_threshold": 65, "sector": "fintech"}), 3)
            .await
            .unwrap();
        assert_eq!(outcome.version, 1);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.safety.can_safely_update);

        guard
            .safe_update("acme", &json!({"sector": null}), 3)
            .await
            .unwrap();
        let config = store.get_subject("acme").await.unwrap().unwrap();
        assert_eq!(config.version, 2);
        assert_eq!(config.settings, json!({"score_threshold": 65}));
    }

    #[tokio::test]
    async fn invalid_patches_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_subject("acme", "fund-a", start()).await.unwrap();
        let guard = guard(store);

        for patch in [json!([1, 2]), json!({}), json!({"score_threshold": 140}), json!({"risk_threshold": "high"})] {
            let err = guard.safe_update("acme", &patch, 3).await.unwrap_err();
            assert_eq!(err.code(), "validation_failed", "{patch}");
        }
    }

    #[tokio::test]
    async fn unknown_subject_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let err = guard(store)
            .safe_update("ghost", &json!({"sector": "bio"}), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, SafeUpdateError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn persistent_conflicts_exhaust_retries() {
        let mut calls = 0;
        let result: Result<((), u32), _> = retry_on_conflict(&quick_backoff(), 2, || {
            calls += 1;
            async { Err(StoreError::WriteConflict("subject acme".into())) }
        })
        .await;
        assert!(matches!(
            result,
            Err(SafeUpdateError::MaxRetriesExceeded { attempts: 3 })
        ));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn transient_conflict_is_retried() {
        let mut calls = 0;
        let (value, attempts) = retry_on_conflict(&quick_backoff(), 2, || {
            calls += 1;
            let conflict = calls == 1;
            async move {
                if conflict {
                    Err(StoreError::WriteConflict("subject acme".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!((value, attempts), (7, 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_all_land() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_subject("acme", "fund-a", start()).await.unwrap();
        let guard = Arc::new(guard(store.clone()));

        let mut set = tokio::task::JoinSet::new();
        for i in 0..8 {
            let guard = guard.clone();
            let mut patch = Map::new();
            patch.insert(format!("field_{i}"), json!(i));
            set.spawn(async move {
                guard
                    .safe_update("acme", &Value::Object(patch), 50)
                    .await
                    .unwrap()
            });
        }
        while let Some(joined) = set.join_next().await {
            joined.unwrap();
        }

        let config = store.get_subject("acme").await.unwrap().unwrap();
        assert_eq!(config.version, 8);
        assert_eq!(config.settings.as_object().unwrap().len(), 8);
    }
}
