use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dealflow_engines::{BackoffPolicy, RunnerConfig};
use dealflow_storage::ClaimRequest;
use serde::Deserialize;
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineSpec {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// A required engine must have reported before the completeness threshold
    /// alone can close a waterfall.
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_weight() -> f64 {
    1.0
}

impl EngineSpec {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            required: false,
            endpoint: None,
        }
    }
}

/// Tunables loaded from `analysis.yaml`. Every key has a default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub engines: Vec<EngineSpec>,
    pub tenant_caps: HashMap<String, usize>,
    pub default_tenant_cap: usize,
    pub max_in_flight: usize,
    pub batch_size: usize,
    pub completeness_threshold: f64,
    pub waterfall_timeout_secs: u64,
    pub stuck_threshold_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub engine_timeout_secs: u64,
    pub low_activity_threshold: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            engines: Vec::new(),
            tenant_caps: HashMap::new(),
            default_tenant_cap: 5,
            max_in_flight: 8,
            batch_size: 25,
            completeness_threshold: 70.0,
            waterfall_timeout_secs: 5 * 60,
            stuck_threshold_secs: 30 * 60,
            max_attempts: 3,
            backoff_base_ms: 30_000,
            backoff_max_ms: 30 * 60 * 1000,
            engine_timeout_secs: 60,
            low_activity_threshold: 3,
        }
    }
}

impl AnalysisConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.completeness_threshold) {
            bail!(
                "completeness_threshold must be within 0..=100, got {}",
                self.completeness_threshold
            );
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        let mut seen = HashSet::new();
        for engine in &self.engines {
            if engine.name.trim().is_empty() {
                bail!("engine names must not be empty");
            }
            if !seen.insert(engine.name.as_str()) {
                bail!("engine `{}` is configured twice", engine.name);
            }
            if !engine.weight.is_finite() || engine.weight <= 0.0 {
                bail!("engine `{}` needs a positive weight", engine.name);
            }
        }
        Ok(())
    }

    pub fn engine(&self, name: &str) -> Option<&EngineSpec> {
        self.engines.iter().find(|e| e.name == name)
    }

    pub fn endpoints(&self) -> HashMap<String, String> {
        self.engines
            .iter()
            .filter_map(|e| e.endpoint.clone().map(|url| (e.name.clone(), url)))
            .collect()
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            engine_timeout: Duration::from_secs(self.engine_timeout_secs),
            backoff: self.backoff(),
        }
    }

    pub fn claim_request(&self, excluded_subjects: HashSet<String>) -> ClaimRequest {
        ClaimRequest {
            max_jobs: self.batch_size,
            tenant_caps: self.tenant_caps.clone(),
            default_tenant_cap: self.default_tenant_cap,
            excluded_subjects,
        }
    }

    pub fn waterfall_timeout(&self) -> Duration {
        Duration::from_secs(self.waterfall_timeout_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }
}

/// Process-level settings taken from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub database_url: Option<String>,
    pub config_path: PathBuf,
    pub scheduler_enabled: bool,
    pub tick_cron: String,
    pub reclaim_cron: String,
    pub web_port: u16,
    pub integration_url: Option<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            config_path: std::env::var("DEALFLOW_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./analysis.yaml")),
            scheduler_enabled: std::env::var("DEALFLOW_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            tick_cron: std::env::var("DEALFLOW_TICK_CRON")
                .unwrap_or_else(|_| "0 */2 * * * *".to_string()),
            reclaim_cron: std::env::var("DEALFLOW_RECLAIM_CRON")
                .unwrap_or_else(|_| "0 */10 * * * *".to_string()),
            web_port: std::env::var("DEALFLOW_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            integration_url: std::env::var("DEALFLOW_INTEGRATION_URL")
                .ok()
                .filter(|v| !v.is_empty()),
        }
    }
}
