// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use rdp_audit::AuditTrail;
use rdp_blob::{MemoryBlobStore, S3BlobStore};
use rdp_bus::{MemoryBus, NatsBus};
use rdp_config::PipelineConfig;
use rdp_daemon::{AppState, PipelineComponents, PipelineRuntime, build_app};
use rdp_store::{MemoryStore, PgStore, pg};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rdp-daemon", version, about = "Regulatory-document pipeline daemon")]
struct Args {
    /// Path to a TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

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
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_path(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides();
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    let filter = config
        .log_filter
        .clone()
        .map_or_else(|| EnvFilter::new("rdp=info"), EnvFilter::new);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let warnings = config.validate().context("validate config")?;
    for warning in warnings {
        tracing::warn!(target: "rdp.daemon", %warning, "config warning");
    }

    let components = if args.ephemeral {
        info!(target: "rdp.daemon", "running with in-memory adapters");
        memory_components()
    } else {
        connected_components(&config, args.init_schema).await?
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
    info!(target: "rdp.daemon", bind = %config.bind, "control surface listening");

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
    info!(target: "rdp.daemon", "shutdown signal received");
}
