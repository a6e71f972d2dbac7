//! Engine and integration collaborator contracts, their HTTP implementations,
//! and the [`EngineRunner`] that executes one job against an engine.

use std::time::Duration;

use async_trait::async_trait;
use dealflow_core::CompletionStatus;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

mod http;
mod runner;

pub use http::{HttpClientConfig, HttpEngineInvoker, HttpIntegrator};
pub use runner::{EngineRunner, RunnerConfig};

pub const CRATE_NAME: &str = "dealflow-engines";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts_made` have run.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Context handed to an engine alongside the subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineContext {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub attempt: u32,
}

/// Uniform reply every enrichment provider returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResponse {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl EngineResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationOutcome {
    pub success: bool,
    #[serde(default)]
    pub data_points_created: i64,
}

/// Failure calling an external collaborator, tagged with whether a retry can help.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CollaboratorError {
    pub disposition: RetryDisposition,
    pub message: String,
}

impl CollaboratorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            disposition: RetryDisposition::Retryable,
            message: message.into(),
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            disposition: RetryDisposition::NonRetryable,
            message: message.into(),
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        Self::retryable(format!("engine call timed out after {}ms", after.as_millis()))
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition == RetryDisposition::Retryable
    }
}

#[async_trait]
pub trait EngineInvoker: Send + Sync {
    async fn invoke(
        &self,
        engine_name: &str,
        subject_id: &str,
        context: &EngineContext,
    ) -> Result<EngineResponse, CollaboratorError>;
}

#[async_trait]
pub trait Integrator: Send + Sync {
    async fn integrate(
        &self,
        subject_id: &str,
        tenant_id: &str,
        status: &CompletionStatus,
    ) -> Result<IntegrationOutcome, CollaboratorError>;
}

/// Integrator used when no downstream endpoint is configured.
#[derive(Debug, Default)]
pub struct LoggingIntegrator;

#[async_trait]
impl Integrator for LoggingIntegrator {
    async fn integrate(
        &self,
        subject_id: &str,
        tenant_id: &str,
        status: &CompletionStatus,
    ) -> Result<IntegrationOutcome, CollaboratorError> {
        info!(
            subject_id,
            tenant_id,
            completion = status.completion_status.as_str(),
            score = status.completeness_score,
            "waterfall finished; no integration endpoint configured"
        );
        Ok(IntegrationOutcome {
            success: true,
            data_points_created: status.engines_processed.len() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
        assert!(policy.allows_another(4));
        assert!(!policy.allows_another(5));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn engine_response_tolerates_missing_fields() {
        let parsed: EngineResponse = serde_json::from_str(r#"{"success": false}"#).unwrap();
        assert!(!parsed.success);
        assert!(parsed.data.is_null());
        assert!(parsed.error.is_none());

        let outcome: IntegrationOutcome =
            serde_json::from_str(r#"{"success": true, "dataPointsCreated": 7}"#).unwrap();
        assert_eq!(outcome.data_points_created, 7);
    }
}
