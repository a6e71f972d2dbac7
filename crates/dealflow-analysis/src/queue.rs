use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dealflow_core::{Clock, NewJob, Priority};
use dealflow_storage::{AnalysisStore, EnqueueOutcome, StoreError};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::AnalysisConfig;
use crate::kill_switch::KillSwitch;

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("subject {subject_id} is blocked: {reason}")]
    SubjectBlocked {
        subject_id: String,
        reason: String,
        blocked_until: Option<DateTime<Utc>>,
    },
    #[error("invalid enqueue request: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub subject_id: String,
    pub tenant_id: String,
    pub engine_name: String,
    pub priority: Priority,
    pub delay: Duration,
}

impl From<EnqueueRequest> for NewJob {
    fn from(req: EnqueueRequest) -> Self {
        NewJob::new(req.subject_id, req.tenant_id, req.engine_name)
            .with_priority(req.priority)
            .with_delay(req.delay)
    }
}

/// Public entry point for new analysis work.
pub struct AnalysisQueue {
    store: Arc<dyn AnalysisStore>,
    kill_switch: Arc<KillSwitch>,
    clock: Arc<dyn Clock>,
    config: Arc<AnalysisConfig>,
}

impl AnalysisQueue {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        kill_switch: Arc<KillSwitch>,
        clock: Arc<dyn Clock>,
        config: Arc<AnalysisConfig>,
    ) -> Self {
        Self {
            store,
            kill_switch,
            clock,
            config,
        }
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome, EnqueueError> {
        self.validate(&request)?;

        let block = self.kill_switch.is_blocked(&request.subject_id).await?;
        if block.blocked {
            let reason = block.reason.unwrap_or_default();
            warn!(
                subject_id = %request.subject_id,
                engine = %request.engine_name,
                %reason,
                "enqueue refused; subject is blocked"
            );
            return Err(EnqueueError::SubjectBlocked {
                subject_id: request.subject_id,
                reason,
                blocked_until: block.blocked_until,
            });
        }

        let now = self.clock.now();
        self.store
            .upsert_subject(&request.subject_id, &request.tenant_id, now)
            .await?;

        let subject_id = request.subject_id.clone();
        let engine = request.engine_name.clone();
        let outcome = self.store.enqueue(request.into(), now).await?;
        match outcome {
            EnqueueOutcome::Created(id) => info!(%id, %subject_id, %engine, "analysis job queued"),
            EnqueueOutcome::Promoted { id, from } => {
                info!(%id, %subject_id, %engine, from = from.as_str(), "queued job promoted")
            }
        }
        Ok(outcome)
    }

    /// Queue every configured engine for a subject. Engines that already have
    /// an active job are reported but do not fail the batch.
    pub async fn enqueue_waterfall(
        &self,
        subject_id: &str,
        tenant_id: &str,
        priority: Priority,
    ) -> Result<Vec<(String, Result<EnqueueOutcome, EnqueueError>)>, EnqueueError> {
        if self.config.engines.is_empty() {
            return Err(EnqueueError::Validation(
                "no engines are configured".to_string(),
            ));
        }

        let mut outcomes = Vec::with_capacity(self.config.engines.len());
        for engine in &self.config.engines {
            let outcome = self
                .enqueue(EnqueueRequest {
                    subject_id: subject_id.to_string(),
                    tenant_id: tenant_id.to_string(),
                    engine_name: engine.name.clone(),
                    priority,
                    delay: Duration::ZERO,
                })
                .await;
            match outcome {
                Err(err @ EnqueueError::SubjectBlocked { .. }) => return Err(err),
                other => outcomes.push((engine.name.clone(), other)),
            }
        }
        Ok(outcomes)
    }

    fn validate(&self, request: &EnqueueRequest) -> Result<(), EnqueueError> {
        if request.subject_id.trim().is_empty() || request.tenant_id.trim().is_empty() {
            return Err(EnqueueError::Validation(
                "subject_id and tenant_id are required".to_string(),
            ));
        }
        if !self.config.engines.is_empty() && self.config.engine(&request.engine_name).is_none() {
            return Err(EnqueueError::Validation(format!(
                "unknown engine `{}`",
                request.engine_name
            )));
        }
        Ok(())
    }
}
