use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use dealflow_analysis::{AnalysisServices, EnqueueRequest, RuntimeConfig};
use dealflow_core::{BlockScope, Priority};
use dealflow_storage::PgStore;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "dealflow-cli")]
#[command(about = "Deal-flow analysis scheduler command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scheduler tick.
    Tick,
    /// Sweep jobs stuck in processing.
    Reclaim,
    /// Completion and block state for a subject.
    Status { subject_id: String },
    /// Queue one engine, or every configured engine when `--engine` is omitted.
    Enqueue {
        subject_id: String,
        tenant_id: String,
        #[arg(long)]
        engine: Option<String>,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        #[arg(long, default_value_t = 0)]
        delay_secs: u64,
    },
    /// Add a kill-switch entry. Without `--subject` the block is global.
    Block {
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        minutes: Option<i64>,
    },
    Unblock { id: Uuid },
    /// Suspend a subject through its own configuration row.
    Suspend {
        subject_id: String,
        #[arg(long)]
        minutes: Option<i64>,
        #[arg(long)]
        reason: Option<String>,
    },
    Migrate,
    /// Serve the HTTP API without the cron scheduler.
    Serve,
    /// Serve the HTTP API and run the cron scheduler.
    Run,
}

fn minutes_from(now: DateTime<Utc>, minutes: i64) -> Result<DateTime<Utc>> {
    TimeDelta::try_minutes(minutes)
        .and_then(|delta| now.checked_add_signed(delta))
        .with_context(|| format!("--minutes {minutes} is out of range"))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let runtime = RuntimeConfig::from_env();

    match cli.command.unwrap_or(Commands::Tick) {
        Commands::Migrate => {
            let Some(url) = runtime.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let services = Arc::new(AnalysisServices::from_env(&runtime).await?);
            dealflow_web::serve(services, runtime.web_port).await?;
        }
        Commands::Run => {
            let services = Arc::new(AnalysisServices::from_env(&runtime).await?);
            let cron = services.maybe_build_cron(&runtime).await?;
            if let Some(cron) = &cron {
                cron.start().await.context("starting cron scheduler")?;
                info!(tick = %runtime.tick_cron, reclaim = %runtime.reclaim_cron, "cron scheduler started");
            }
            tokio::select! {
                served = dealflow_web::serve(services, runtime.web_port) => served?,
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
            }
            if let Some(mut cron) = cron {
                cron.shutdown().await.context("stopping cron scheduler")?;
            }
        }
        command => {
            let services = AnalysisServices::from_env(&runtime).await?;
            run_once(&services, command).await?;
        }
    }

    Ok(())
}

async fn run_once(services: &AnalysisServices, command: Commands) -> Result<()> {
    match command {
        Commands::Tick => {
            let summary = services.scheduler.tick().await?;
            println!(
                "tick complete: processed={} successful={} failed={} skipped={} disabled={}",
                summary.processed,
                summary.successful,
                summary.failed,
                summary.skipped,
                summary.system_disabled
            );
        }
        Commands::Reclaim => {
            let summary = services.reclaimer.reclaim().await;
            println!(
                "reclaim complete: requeued={} failed={}",
                summary.reclaimed, summary.failed
            );
        }
        Commands::Status { subject_id } => {
            let completion = services.tracker.evaluate(&subject_id).await?;
            let block = services.kill_switch.is_blocked(&subject_id).await?;
            print_json(&serde_json::json!({ "completion": completion, "block": block }))?;
        }
        Commands::Enqueue {
            subject_id,
            tenant_id,
            engine,
            priority,
            delay_secs,
        } => match engine {
            Some(engine_name) => {
                let outcome = services
                    .queue
                    .enqueue(EnqueueRequest {
                        subject_id,
                        tenant_id,
                        engine_name: engine_name.clone(),
                        priority,
                        delay: Duration::from_secs(delay_secs),
                    })
                    .await?;
                println!("{engine_name}: {:?}", outcome);
            }
            None => {
                for (engine_name, result) in services
                    .queue
                    .enqueue_waterfall(&subject_id, &tenant_id, priority)
                    .await?
                {
                    match result {
                        Ok(outcome) => println!("{engine_name}: {:?}", outcome),
                        Err(err) => println!("{engine_name}: {err}"),
                    }
                }
            }
        },
        Commands::Block {
            subject,
            reason,
            minutes,
        } => {
            let scope = subject.map_or(BlockScope::Global, BlockScope::Subject);
            let until = minutes.map(|m| minutes_from(Utc::now(), m)).transpose()?;
            let entry = services.kill_switch.block(scope, reason, until).await?;
            print_json(&entry)?;
        }
        Commands::Unblock { id } => {
            if services.kill_switch.unblock(id).await? {
                println!("removed block {id}");
            } else {
                bail!("no block with id {id}");
            }
        }
        Commands::Suspend {
            subject_id,
            minutes,
            reason,
        } => {
            let until = minutes.map(|m| minutes_from(Utc::now(), m)).transpose()?;
            services
                .kill_switch
                .suspend_subject(&subject_id, until, reason.as_deref())
                .await?;
            match until {
                Some(until) => println!("suspended {subject_id} until {until}"),
                None => println!("cleared suspension for {subject_id}"),
            }
        }
        Commands::Migrate | Commands::Serve | Commands::Run => {}
    }
    Ok(())
}
