// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared harness for the end-to-end tests: in-memory store/bus/blob
//! components with the real stage consumers running, driven by manual tick
//! and dispatch calls so each scenario controls its own pacing.

use rdp_blob::MemoryBlobStore;
use rdp_bus::MemoryBus;
use rdp_core::RunStatus;
use rdp_core::event::topics;
use rdp_core::model::{NewSource, NewSubscription};
use rdp_core::{RobotsMode, SourceKind, SubscriptionStatus};
use rdp_daemon::PipelineComponents;
use rdp_sched::SchedulingService;
use rdp_stages::run_consumer;
use rdp_store::{MemoryStore, RunStore, SourceStore, SubscriptionStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct Harness {
    pub store: MemoryStore,
    pub blobs: MemoryBlobStore,
    pub bus: MemoryBus,
    pub service: SchedulingService,
    shutdown: watch::Sender<bool>,
}

impl Harness {
    /// Spawn the stage consumers over fresh in-memory components.
    pub async fn start() -> Self {
        let store = MemoryStore::new();
        let blobs = MemoryBlobStore::new();
        let bus = MemoryBus::new();
        let components = PipelineComponents {
            scheduler: Arc::new(store.clone()),
            subscriptions: Arc::new(store.clone()),
            sources: Arc::new(store.clone()),
            runs: Arc::new(store.clone()),
            outbox: Arc::new(store.clone()),
            documents: Arc::new(store.clone()),
            blobs: Arc::new(blobs.clone()),
            bus: Arc::new(bus.clone()),
        };
        let scheduler_config = rdp_config::SchedulerConfig::default();
        let crawler_config = rdp_config::CrawlerConfig::default();
        let service = components.scheduling_service(&scheduler_config);
        let registry = Arc::new(components.handler_registry(&crawler_config).unwrap());

        let (shutdown, _) = watch::channel(false);
        for topic in [
            topics::SUBS_SCHEDULE,
            topics::CRAWL_REQUEST,
            topics::CRAWL_RESULT,
            topics::PARSE_RESULT,
            topics::VERSIONING_RESULT,
            topics::RUN_STATUS,
            topics::DELIVERY_RESULT,
        ] {
            let bus = Arc::clone(&components.bus);
            let registry = Arc::clone(&registry);
            let shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                let _ = run_consumer(bus, registry, topic, "e2e", shutdown_rx).await;
            });
        }
        // Let every consumer subscribe before anything is published.
        tokio::time::sleep(Duration::from_millis(30)).await;

        Self {
            store,
            blobs,
            bus,
            service,
            shutdown,
        }
    }

    /// Register a source pointing at the given URL.
    pub async fn create_source(&self, base_url: &str) -> i64 {
        self.store
            .create_source(
                NewSource {
                    name: "regulator".into(),
                    kind: SourceKind::Html,
                    base_url: base_url.to_string(),
                    auth_ref: None,
                    robots_mode: RobotsMode::Allow,
                    rate_limit: 600,
                },
                chrono::Utc::now() - chrono::Duration::seconds(5),
            )
            .await
            .unwrap()
            .id
    }

    /// Register an ACTIVE subscription with no `next_run_at`, ready to claim.
    pub async fn create_due_subscription(&self, source_id: i64) -> i64 {
        self.store
            .create_subscription(
                NewSubscription {
                    source_id,
                    jurisdiction: "eu".into(),
                    selectors: serde_json::json!({}),
                    schedule: "*/5 * * * *".into(),
                    status: SubscriptionStatus::Active,
                },
                chrono::Utc::now() - chrono::Duration::seconds(5),
            )
            .await
            .unwrap()
            .id
    }

    /// Tick then dispatch, returning the single run id the tick created.
    pub async fn tick_and_dispatch_one(&self) -> i64 {
        assert_eq!(self.service.tick(100).await.unwrap(), 1, "expected one claim");
        let run = self.store.list_recent_runs(1).await.unwrap().remove(0);
        assert_eq!(self.service.dispatch_outbox(100).await.unwrap(), 1);
        run.id
    }

    /// Poll until the run reaches the wanted status.
    pub async fn wait_for_run(&self, run_id: i64, status: RunStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let run = self.store.run(run_id).await.unwrap();
            if run.as_ref().is_some_and(|r| r.status == status) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "run {run_id} never reached {status}; currently {run:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Two-section regulation page used across scenarios.
pub const PAGE_V1: &str = "<html lang=\"en\"><body>\
    <h1>Scope</h1><p>Applies to all operators.</p>\
    <h2>Definitions</h2><p>Operator means anyone.</p>\
    </body></html>";

/// Same page with one section's body changed.
pub const PAGE_V2: &str = "<html lang=\"en\"><body>\
    <h1>Scope</h1><p>Applies to all operators.</p>\
    <h2>Definitions</h2><p>Operator means any registered entity.</p>\
    </body></html>";
