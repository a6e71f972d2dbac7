use std::sync::Arc;

use anyhow::{Context, Result};
use dealflow_core::{Clock, SystemClock};
use dealflow_engines::{
    EngineInvoker, EngineRunner, HttpClientConfig, HttpEngineInvoker, HttpIntegrator, Integrator,
    LoggingIntegrator,
};
use dealflow_storage::{AnalysisStore, MemoryStore, PgStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::{AnalysisConfig, RuntimeConfig};
use crate::conflict::ConflictGuard;
use crate::kill_switch::{ControlState, KillSwitch};
use crate::queue::AnalysisQueue;
use crate::reclaimer::ZombieReclaimer;
use crate::scheduler::Scheduler;
use crate::waterfall::{WaterfallPolicy, WaterfallTracker};

/// External collaborators the services are built around.
pub struct Collaborators {
    pub invoker: Arc<dyn EngineInvoker>,
    pub integrator: Arc<dyn Integrator>,
    pub clock: Arc<dyn Clock>,
}

/// Every analysis component, wired to one store and one control state.
pub struct AnalysisServices {
    pub store: Arc<dyn AnalysisStore>,
    pub config: Arc<AnalysisConfig>,
    pub control: Arc<ControlState>,
    pub kill_switch: Arc<KillSwitch>,
    pub queue: Arc<AnalysisQueue>,
    pub tracker: Arc<WaterfallTracker>,
    pub scheduler: Arc<Scheduler>,
    pub reclaimer: Arc<ZombieReclaimer>,
    pub conflict: Arc<ConflictGuard>,
}

impl AnalysisServices {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        config: AnalysisConfig,
        collaborators: Collaborators,
        control: Arc<ControlState>,
    ) -> Self {
        let Collaborators {
            invoker,
            integrator,
            clock,
        } = collaborators;
        let config = Arc::new(config);

        let kill_switch = Arc::new(KillSwitch::new(
            store.clone(),
            control.clone(),
            clock.clone(),
        ));
        let queue = Arc::new(AnalysisQueue::new(
            store.clone(),
            kill_switch.clone(),
            clock.clone(),
            config.clone(),
        ));
        let tracker = Arc::new(WaterfallTracker::new(
            store.clone(),
            integrator,
            clock.clone(),
            WaterfallPolicy {
                engines: config.engines.clone(),
                completeness_threshold: config.completeness_threshold,
                timeout: config.waterfall_timeout(),
            },
        ));
        let runner = Arc::new(EngineRunner::new(
            store.clone(),
            invoker,
            clock.clone(),
            config.runner_config(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            kill_switch.clone(),
            runner,
            tracker.clone(),
            clock.clone(),
            config.clone(),
        ));
        let reclaimer = Arc::new(ZombieReclaimer::new(
            store.clone(),
            clock.clone(),
            config.stuck_threshold(),
            config.max_attempts,
        ));
        let conflict = Arc::new(ConflictGuard::new(
            store.clone(),
            clock,
            config.low_activity_threshold,
            config.backoff(),
        ));

        Self {
            store,
            config,
            control,
            kill_switch,
            queue,
            tracker,
            scheduler,
            reclaimer,
            conflict,
        }
    }

    /// Process-local services with the logging integrator. Used by tests and
    /// single-node dry runs.
    pub fn in_memory(config: AnalysisConfig, invoker: Arc<dyn EngineInvoker>) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            config,
            Collaborators {
                invoker,
                integrator: Arc::new(LoggingIntegrator),
                clock: Arc::new(SystemClock),
            },
            Arc::new(ControlState::default()),
        )
    }

    pub async fn from_env(runtime: &RuntimeConfig) -> Result<Self> {
        let config = if runtime.config_path.exists() {
            AnalysisConfig::load(&runtime.config_path).await?
        } else {
            warn!(
                path = %runtime.config_path.display(),
                "analysis config not found; using defaults"
            );
            AnalysisConfig::default()
        };

        let store: Arc<dyn AnalysisStore> = match &runtime.database_url {
            Some(url) => {
                let store = PgStore::connect(url).await.context("connecting to postgres")?;
                store.migrate().await.context("applying migrations")?;
                info!("using postgres store");
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set; state is process-local and lost on exit");
                Arc::new(MemoryStore::new())
            }
        };

        let http = HttpClientConfig {
            max_concurrency: config.max_in_flight.max(1),
            ..HttpClientConfig::default()
        };
        let invoker = Arc::new(HttpEngineInvoker::new(http.clone(), config.endpoints())?);
        let integrator: Arc<dyn Integrator> = match &runtime.integration_url {
            Some(url) => Arc::new(HttpIntegrator::new(http, url.clone())?),
            None => Arc::new(LoggingIntegrator),
        };

        Ok(Self::new(
            store,
            config,
            Collaborators {
                invoker,
                integrator,
                clock: Arc::new(SystemClock),
            },
            Arc::new(ControlState::default()),
        ))
    }

    /// Cron jobs for the tick and the zombie sweep. `None` when scheduling is
    /// switched off.
    pub async fn maybe_build_cron(&self, runtime: &RuntimeConfig) -> Result<Option<JobScheduler>> {
        if !runtime.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let scheduler = self.scheduler.clone();
        let tick = Job::new_async(runtime.tick_cron.as_str(), move |_uuid, _l| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                if let Err(err) = scheduler.tick().await {
                    warn!(error = %err, "scheduled tick failed");
                }
            })
        })
        .with_context(|| format!("creating tick job for cron {}", runtime.tick_cron))?;
        sched.add(tick).await.context("adding tick job")?;

        let reclaimer = self.reclaimer.clone();
        let sweep = Job::new_async(runtime.reclaim_cron.as_str(), move |_uuid, _l| {
            let reclaimer = reclaimer.clone();
            Box::pin(async move {
                reclaimer.reclaim().await;
            })
        })
        .with_context(|| format!("creating reclaim job for cron {}", runtime.reclaim_cron))?;
        sched.add(sweep).await.context("adding reclaim job")?;

        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSpec;
    use crate::queue::EnqueueRequest;
    use async_trait::async_trait;
    use dealflow_core::Priority;
    use dealflow_engines::{CollaboratorError, EngineContext, EngineResponse};
    use dealflow_storage::RunStore;
    use std::time::Duration;

    struct AlwaysComplete;

    #[async_trait]
    impl EngineInvoker for AlwaysComplete {
        async fn invoke(
            &self,
            _engine_name: &str,
            _subject_id: &str,
            _context: &EngineContext,
        ) -> Result<EngineResponse, CollaboratorError> {
            Ok(EngineResponse::ok(serde_json::json!({"confidence": 95})))
        }
    }

    fn runtime(enabled: bool) -> RuntimeConfig {
        RuntimeConfig {
            database_url: None,
            config_path: "missing.yaml".into(),
            scheduler_enabled: enabled,
            tick_cron: "0 */2 * * * *".into(),
            reclaim_cron: "0 */10 * * * *".into(),
            web_port: 0,
            integration_url: None,
        }
    }

    #[tokio::test]
    async fn enqueue_then_tick_completes_the_waterfall() {
        let config = AnalysisConfig {
            engines: vec![EngineSpec::new("crunchbase", 0.6), EngineSpec::new("linkedin", 0.4)],
            ..AnalysisConfig::default()
        };
        let services = AnalysisServices::in_memory(config, Arc::new(AlwaysComplete));
        services
            .queue
            .enqueue_waterfall("acme", "fund-a", Priority::Normal)
            .await
            .unwrap();

        let summary = services.scheduler.tick().await.unwrap();
        assert_eq!(summary.successful, 2);

        let status = services.tracker.evaluate("acme").await.unwrap();
        assert_eq!(status.completeness_score, 100.0);
        assert!(status.completion_status.is_terminal());
        assert!(services.conflict.check_safety("fund-a").await.unwrap().can_safely_update);
    }

    #[tokio::test]
    async fn delayed_job_waits_for_a_later_tick() {
        let services = AnalysisServices::in_memory(AnalysisConfig::default(), Arc::new(AlwaysComplete));
        services
            .queue
            .enqueue(EnqueueRequest {
                subject_id: "acme".into(),
                tenant_id: "fund-a".into(),
                engine_name: "crunchbase".into(),
                priority: Priority::High,
                delay: Duration::from_secs(3600),
            })
            .await
            .unwrap();

        let summary = services.scheduler.tick().await.unwrap();
        assert_eq!(summary.total_items, 0);
    }

    #[tokio::test]
    async fn cron_is_only_built_when_enabled() {
        let services = AnalysisServices::in_memory(AnalysisConfig::default(), Arc::new(AlwaysComplete));
        assert!(services.maybe_build_cron(&runtime(false)).await.unwrap().is_none());
        assert!(services.maybe_build_cron(&runtime(true)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn from_env_falls_back_to_memory_and_defaults() {
        let services = AnalysisServices::from_env(&runtime(false)).await.unwrap();
        assert_eq!(services.config.completeness_threshold, 70.0);
        assert!(services.kill_switch.is_enabled());
        assert!(services.store.open_runs().await.unwrap().is_empty());
    }
}
