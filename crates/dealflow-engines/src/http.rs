use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dealflow_core::CompletionStatus;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, Instrument};

use crate::{
    classify_reqwest_error, classify_status, CollaboratorError, EngineContext, EngineInvoker,
    EngineResponse, IntegrationOutcome, Integrator,
};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Transport-level ceiling; the runner applies its own per-engine timeout.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: Some(format!("dealflow/{}", env!("CARGO_PKG_VERSION"))),
            max_concurrency: 16,
        }
    }
}

fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

async fn post_json<B, R>(
    client: &reqwest::Client,
    limit: &Semaphore,
    url: &str,
    body: &B,
) -> Result<R, CollaboratorError>
where
    B: Serialize + Sync,
    R: serde::de::DeserializeOwned,
{
    let _permit = limit
        .acquire()
        .await
        .map_err(|_| CollaboratorError::non_retryable("http client is shutting down"))?;

    let resp = client.post(url).json(body).send().await.map_err(|err| {
        CollaboratorError {
            disposition: classify_reqwest_error(&err),
            message: format!("request to {url} failed: {err}"),
        }
    })?;

    let status = resp.status();
    if !status.is_success() {
        let detail = resp.text().await.unwrap_or_default();
        return Err(CollaboratorError {
            disposition: classify_status(status),
            message: format!("http status {} from {url}: {}", status.as_u16(), detail.trim()),
        });
    }

    resp.json::<R>()
        .await
        .map_err(|err| CollaboratorError::non_retryable(format!("invalid body from {url}: {err}")))
}

/// Calls each engine's configured endpoint with a JSON POST.
#[derive(Debug)]
pub struct HttpEngineInvoker {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    endpoints: HashMap<String, String>,
}

#[derive(Serialize)]
struct EngineRequest<'a> {
    engine_name: &'a str,
    subject_id: &'a str,
    context: &'a EngineContext,
}

impl HttpEngineInvoker {
    pub fn new(config: HttpClientConfig, endpoints: HashMap<String, String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            endpoints,
        })
    }

    pub fn endpoint(&self, engine_name: &str) -> Option<&str> {
        self.endpoints.get(engine_name).map(String::as_str)
    }
}

#[async_trait]
impl EngineInvoker for HttpEngineInvoker {
    async fn invoke(
        &self,
        engine_name: &str,
        subject_id: &str,
        context: &EngineContext,
    ) -> Result<EngineResponse, CollaboratorError> {
        let Some(url) = self.endpoint(engine_name) else {
            return Err(CollaboratorError::non_retryable(format!(
                "no endpoint configured for engine {engine_name}"
            )));
        };

        let span = tracing::info_span!("engine_http", engine_name, subject_id, url);
        let request = EngineRequest {
            engine_name,
            subject_id,
            context,
        };
        async {
            let response: EngineResponse =
                post_json(&self.client, &self.limit, url, &request).await?;
            debug!(success = response.success, "engine responded");
            Ok::<_, CollaboratorError>(response)
        }
        .instrument(span)
        .await
    }
}

/// Hands completed waterfalls to the downstream integration service.
#[derive(Debug)]
pub struct HttpIntegrator {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IntegrationRequest<'a> {
    subject_id: &'a str,
    tenant_id: &'a str,
    completion: &'a CompletionStatus,
}

impl HttpIntegrator {
    pub fn new(config: HttpClientConfig, url: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&config)?,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            url: url.into(),
        })
    }
}

#[async_trait]
impl Integrator for HttpIntegrator {
    async fn integrate(
        &self,
        subject_id: &str,
        tenant_id: &str,
        status: &CompletionStatus,
    ) -> Result<IntegrationOutcome, CollaboratorError> {
        let request = IntegrationRequest {
            subject_id,
            tenant_id,
            completion: status,
        };
        post_json(&self.client, &self.limit, &self.url, &request)
            .instrument(tracing::info_span!("integration_http", subject_id, tenant_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn unknown_engine_is_a_terminal_failure() {
        let invoker = HttpEngineInvoker::new(
            HttpClientConfig::default(),
            HashMap::from([("crunchbase".to_string(), "http://127.0.0.1:9/".to_string())]),
        )
        .unwrap();
        assert_eq!(invoker.endpoint("crunchbase"), Some("http://127.0.0.1:9/"));

        let ctx = EngineContext {
            job_id: Uuid::new_v4(),
            tenant_id: "fund-a".into(),
            attempt: 1,
        };
        let err = invoker.invoke("pitchbook", "acme", &ctx).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.message.contains("pitchbook"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_retryable() {
        let invoker = HttpEngineInvoker::new(
            HttpClientConfig {
                timeout: Duration::from_secs(2),
                ..HttpClientConfig::default()
            },
            HashMap::from([("crunchbase".to_string(), "http://127.0.0.1:9/".to_string())]),
        )
        .unwrap();
        let ctx = EngineContext {
            job_id: Uuid::new_v4(),
            tenant_id: "fund-a".into(),
            attempt: 1,
        };
        let err = invoker.invoke("crunchbase", "acme", &ctx).await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }
}
