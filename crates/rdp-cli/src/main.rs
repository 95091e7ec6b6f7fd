// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rdp_audit::AuditTrail;
use rdp_blob::{MemoryBlobStore, S3BlobStore};
use rdp_bus::{MemoryBus, NatsBus};
use rdp_config::PipelineConfig;
use rdp_core::SubscriptionStatus;
use rdp_core::model::NewSubscription;
use rdp_daemon::{AppState, PipelineComponents, PipelineRuntime, build_app};
use rdp_sched::service::{SchedulingDeps, SchedulingService};
use rdp_store::{MemoryStore, PgStore, pg};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rdp", version, about = "Regulatory-document pipeline control")]
struct Cli {
    /// Path to a TOML configuration file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline daemon: worker loops plus the HTTP control surface.
    Serve {
        /// Run everything against in-memory adapters (no Postgres/NATS/S3).
        /// State is lost on exit; intended for local development.
        #[arg(long)]
        ephemeral: bool,

        /// Apply the development schema to the database before starting.
        #[arg(long)]
        init_schema: bool,

        /// Override the HTTP bind address from the config.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Claim due subscriptions and enqueue their runs.
    Tick {
        /// Max subscriptions to claim.
        #[arg(long, default_value_t = 100)]
        batch_size: i64,
    },
    /// Fill `next_run_at` for subscriptions missing one.
    ComputeNext {
        /// Max subscriptions to fill.
        #[arg(long, default_value_t = 500)]
        batch_size: i64,
    },
    /// Drain pending outbox rows to the bus.
    Dispatch {
        /// Max rows to drain.
        #[arg(long, default_value_t = 200)]
        batch_size: i64,
    },
    /// Subscription actions.
    #[command(subcommand)]
    Subscription(SubscriptionCommand),
    /// Recent runs.
    Runs {
        /// Max rows to list.
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Recent outbox rows.
    Outbox {
        /// Max rows to list.
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Audit trail for a document or a single version.
    Audit {
        /// Document id.
        document_id: i64,
        /// Restrict to one version.
        #[arg(long)]
        version_id: Option<i64>,
    },
}

#[derive(Subcommand, Debug)]
enum SubscriptionCommand {
    /// Register a subscription against a source.
    Create {
        /// Source to crawl.
        #[arg(long)]
        source_id: i64,
        /// Jurisdiction tag.
        #[arg(long)]
        jurisdiction: String,
        /// Cron expression (standard 5-field).
        #[arg(long)]
        schedule: String,
        /// Content-selection rules as JSON.
        #[arg(long, default_value = "{}")]
        selectors: String,
    },
    /// Show one subscription.
    Show {
        /// Subscription id.
        id: i64,
    },
    /// Make a subscription eligible for scheduling again.
    Enable {
        /// Subscription id.
        id: i64,
    },
    /// Take a subscription out of scheduling.
    Disable {
        /// Subscription id.
        id: i64,
    },
    /// Schedule a subscription immediately, bypassing its cron.
    RunNow {
        /// Subscription id.
        id: i64,
    },
    /// List subscriptions.
    List {
        /// Filter by status (ACTIVE, PAUSED, DISABLED, ERROR).
        #[arg(long)]
        status: Option<String>,
        /// Max rows to list.
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_path(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides();

    match cli.command {
        Command::Serve {
            ephemeral,
            init_schema,
            bind,
        } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            serve(&config, ephemeral, init_schema).await
        }
        command => run_control_command(&config, command).await,
    }
}

/// One-shot control actions against the deployed database and bus.
async fn run_control_command(config: &PipelineConfig, command: Command) -> Result<()> {
    let pool = pg::connect(
        &config.database.url,
        config.database.max_connections,
        Duration::from_secs(config.database.statement_timeout_secs),
    )
    .await
    .context("connect database")?;
    let store = PgStore::new(pool);
    let bus = NatsBus::connect(
        &config.bus.url,
        &config.bus.stream_prefix,
        &config.bus.consumer_prefix,
    )
    .await
    .context("connect bus")?;

    let service = SchedulingService::new(SchedulingDeps {
        scheduler: Arc::new(store.clone()),
        subscriptions: Arc::new(store.clone()),
        runs: Arc::new(store.clone()),
        outbox: Arc::new(store.clone()),
        bus: Arc::new(bus),
        max_outbox_attempts: config.scheduler.max_outbox_attempts,
    });

    match command {
        Command::Serve { .. } => unreachable!("dispatched before connecting"),
        Command::Tick { batch_size } => {
            let processed = service.tick(batch_size).await?;
            println!("processed: {processed}");
        }
        Command::ComputeNext { batch_size } => {
            let updated = service.compute_next(batch_size).await?;
            println!("updated: {updated}");
        }
        Command::Dispatch { batch_size } => {
            let published = service.dispatch_outbox(batch_size).await?;
            println!("published: {published}");
        }
        Command::Subscription(command) => run_subscription_command(&service, command).await?,
        Command::Runs { limit } => {
            print_json(&service.list_runs(limit).await?)?;
        }
        Command::Outbox { limit } => {
            print_json(&service.list_outbox(limit).await?)?;
        }
        Command::Audit {
            document_id,
            version_id,
        } => {
            let audit = AuditTrail::new(
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                Arc::new(store),
            );
            let events = match version_id {
                Some(version_id) => audit.version_trail(document_id, version_id).await?,
                None => audit.document_trail(document_id).await?,
            };
            print_json(&events)?;
        }
    }
    Ok(())
}

/// Run the worker loops and the HTTP control surface until a shutdown signal.
async fn serve(config: &PipelineConfig, ephemeral: bool, init_schema: bool) -> Result<()> {
    let warnings = config.validate().context("validate config")?;
    for warning in warnings {
        tracing::warn!(target: "rdp.cli", %warning, "config warning");
    }

    let components = if ephemeral {
        info!(target: "rdp.cli", "running with in-memory adapters");
        memory_components()
    } else {
        connected_components(config, init_schema).await?
    };

    let state = Arc::new(AppState {
        service: components.scheduling_service(&config.scheduler),
        audit: AuditTrail::new(
            Arc::clone(&components.documents),
            Arc::clone(&components.runs),
            Arc::clone(&components.outbox),
        ),
    });

    let runtime = PipelineRuntime::start(components, &config.scheduler, &config.crawler)
        .map_err(|err| anyhow::anyhow!(err))?;

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    info!(target: "rdp.cli", bind = %config.bind, "control surface listening");

    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    runtime.shutdown().await;
    Ok(())
}

fn memory_components() -> PipelineComponents {
    let store = MemoryStore::new();
    PipelineComponents {
        scheduler: Arc::new(store.clone()),
        subscriptions: Arc::new(store.clone()),
        sources: Arc::new(store.clone()),
        runs: Arc::new(store.clone()),
        outbox: Arc::new(store.clone()),
        documents: Arc::new(store),
        blobs: Arc::new(MemoryBlobStore::new()),
        bus: Arc::new(MemoryBus::new()),
    }
}

async fn connected_components(
    config: &PipelineConfig,
    init_schema: bool,
) -> Result<PipelineComponents> {
    let pool = pg::connect(
        &config.database.url,
        config.database.max_connections,
        Duration::from_secs(config.database.statement_timeout_secs),
    )
    .await
    .context("connect database")?;
    if init_schema {
        pg::apply_schema(&pool).await.context("apply schema")?;
    }
    let store = PgStore::new(pool);

    let bus = NatsBus::connect(
        &config.bus.url,
        &config.bus.stream_prefix,
        &config.bus.consumer_prefix,
    )
    .await
    .context("connect bus")?;

    let blobs = S3BlobStore::connect(
        &config.object_store.endpoint,
        &config.object_store.region,
        &config.object_store.bucket,
    )
    .await;
    blobs.ensure_bucket().await.context("ensure bucket")?;

    Ok(PipelineComponents {
        scheduler: Arc::new(store.clone()),
        subscriptions: Arc::new(store.clone()),
        sources: Arc::new(store.clone()),
        runs: Arc::new(store.clone()),
        outbox: Arc::new(store.clone()),
        documents: Arc::new(store),
        blobs: Arc::new(blobs),
        bus: Arc::new(bus),
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!(target: "rdp.cli", "shutdown signal received");
}

async fn run_subscription_command(
    service: &SchedulingService,
    command: SubscriptionCommand,
) -> Result<()> {
    match command {
        SubscriptionCommand::Create {
            source_id,
            jurisdiction,
            schedule,
            selectors,
        } => {
            let selectors: serde_json::Value =
                serde_json::from_str(&selectors).context("parse --selectors as JSON")?;
            let created = service
                .create_subscription(NewSubscription {
                    source_id,
                    jurisdiction,
                    selectors,
                    schedule,
                    status: SubscriptionStatus::Active,
                })
                .await?;
            print_json(&created)?;
        }
        SubscriptionCommand::Show { id } => match service.subscription(id).await? {
            Some(subscription) => print_json(&subscription)?,
            None => anyhow::bail!("subscription {id} not found"),
        },
        SubscriptionCommand::Enable { id } => match service.enable_subscription(id).await? {
            Some(subscription) => print_json(&subscription)?,
            None => anyhow::bail!("subscription {id} not found"),
        },
        SubscriptionCommand::Disable { id } => match service.disable_subscription(id).await? {
            Some(subscription) => print_json(&subscription)?,
            None => anyhow::bail!("subscription {id} not found"),
        },
        SubscriptionCommand::RunNow { id } => {
            let claim = service.run_subscription_now(id).await?;
            println!(
                "run {} enqueued for subscription {} (outbox {})",
                claim.run_id, claim.subscription_id, claim.outbox_id
            );
        }
        SubscriptionCommand::List { status, limit } => {
            let status = status.as_deref().and_then(SubscriptionStatus::parse);
            print_json(&service.list_subscriptions(status, limit, 0).await?)?;
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
