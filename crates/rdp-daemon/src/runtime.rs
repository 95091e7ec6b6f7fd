// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker-loop supervision.
//!
//! One process hosts a few cooperative loops: the periodic tick, next-fire,
//! and dispatch tasks, plus one consumer loop per pipeline topic. Replicas of
//! the whole process may run concurrently; safety comes from the store's row
//! locks, not from anything in here.

use rand::Rng;
use rdp_blob::BlobStore;
use rdp_bus::EventBus;
use rdp_config::{CrawlerConfig, SchedulerConfig};
use rdp_core::event::topics;
use rdp_sched::{SchedulingService, service::SchedulingDeps};
use rdp_stages::{
    CrawlHandler, DeliverHandler, DeliveryResultStatusHandler, HandlerRegistry, ParseHandler,
    RunLifecycleEmitter, RunStatusHandler, ScheduleHandler, VersionHandler, run_consumer,
};
use rdp_store::{
    DocumentStore, OutboxStore, RunStore, SchedulerStore, SourceStore, SubscriptionStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Consumer group shared by all worker replicas of this deployment.
const CONSUMER_GROUP: &str = "pipeline";

/// The stores and gateways one pipeline process operates over.
#[derive(Clone)]
pub struct PipelineComponents {
    /// Atomic tick claims.
    pub scheduler: Arc<dyn SchedulerStore>,
    /// Subscription state.
    pub subscriptions: Arc<dyn SubscriptionStore>,
    /// Source registry.
    pub sources: Arc<dyn SourceStore>,
    /// Run state.
    pub runs: Arc<dyn RunStore>,
    /// Outbox rows.
    pub outbox: Arc<dyn OutboxStore>,
    /// Artifacts, documents, versions, deliveries.
    pub documents: Arc<dyn DocumentStore>,
    /// Object store.
    pub blobs: Arc<dyn BlobStore>,
    /// Message bus.
    pub bus: Arc<dyn EventBus>,
}

impl PipelineComponents {
    /// Build the scheduling facade over these components.
    #[must_use]
    pub fn scheduling_service(&self, scheduler: &SchedulerConfig) -> SchedulingService {
        SchedulingService::new(SchedulingDeps {
            scheduler: Arc::clone(&self.scheduler),
            subscriptions: Arc::clone(&self.subscriptions),
            runs: Arc::clone(&self.runs),
            outbox: Arc::clone(&self.outbox),
            bus: Arc::clone(&self.bus),
            max_outbox_attempts: scheduler.max_outbox_attempts,
        })
    }

    /// Build and populate the stage handler registry.
    ///
    /// # Errors
    ///
    /// Fails when the crawler's HTTP client cannot be constructed.
    pub fn handler_registry(
        &self,
        crawler: &CrawlerConfig,
    ) -> Result<HandlerRegistry, rdp_error::PipelineError> {
        let lifecycle = RunLifecycleEmitter::new(Arc::clone(&self.bus));
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(ScheduleHandler::new(
            Arc::clone(&self.subscriptions),
            Arc::clone(&self.sources),
            Arc::clone(&self.runs),
            Arc::clone(&self.bus),
            lifecycle.clone(),
        )));
        registry.register(Arc::new(CrawlHandler::new(
            Arc::clone(&self.sources),
            Arc::clone(&self.documents),
            Arc::clone(&self.blobs),
            Arc::clone(&self.bus),
            lifecycle.clone(),
            Duration::from_secs(crawler.http_timeout_secs),
        )?));
        registry.register(Arc::new(ParseHandler::new(
            Arc::clone(&self.documents),
            Arc::clone(&self.blobs),
            Arc::clone(&self.bus),
            lifecycle.clone(),
        )));
        registry.register(Arc::new(VersionHandler::new(
            Arc::clone(&self.documents),
            Arc::clone(&self.blobs),
            Arc::clone(&self.bus),
            lifecycle.clone(),
        )));
        registry.register(Arc::new(DeliverHandler::new(
            Arc::clone(&self.documents),
            Arc::clone(&self.blobs),
            Arc::clone(&self.bus),
            lifecycle,
        )));
        registry.register(Arc::new(RunStatusHandler::new(Arc::clone(&self.runs))));
        registry.register(Arc::new(DeliveryResultStatusHandler::new(Arc::clone(
            &self.runs,
        ))));
        Ok(registry)
    }
}

/// A running set of pipeline loops, stoppable as a unit.
pub struct PipelineRuntime {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    bus: Arc<dyn EventBus>,
}

impl PipelineRuntime {
    /// Spawn the periodic loops and one consumer per pipeline topic.
    ///
    /// # Errors
    ///
    /// Fails when the handler registry cannot be built.
    pub fn start(
        components: PipelineComponents,
        scheduler: &SchedulerConfig,
        crawler: &CrawlerConfig,
    ) -> Result<Self, rdp_error::PipelineError> {
        let registry = Arc::new(components.handler_registry(crawler)?);
        let service = Arc::new(components.scheduling_service(scheduler));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        // Consumers first so that nothing dispatched is lost.
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
            let shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                if let Err(err) = run_consumer(bus, registry, topic, CONSUMER_GROUP, shutdown).await
                {
                    warn!(target: "rdp.daemon", topic, error = %err, "consumer stopped");
                }
            }));
        }

        handles.push(spawn_periodic(
            "tick",
            Duration::from_secs(scheduler.tick_period_secs.max(1)),
            shutdown_rx.clone(),
            {
                let service = Arc::clone(&service);
                let batch = scheduler.tick_batch_size;
                move || {
                    let service = Arc::clone(&service);
                    async move { service.tick(batch).await.map(|n| n as u64) }
                }
            },
        ));
        handles.push(spawn_periodic(
            "next-fire",
            Duration::from_secs(scheduler.next_fire_period_secs.max(1)),
            shutdown_rx.clone(),
            {
                let service = Arc::clone(&service);
                let batch = scheduler.next_fire_batch_size;
                move || {
                    let service = Arc::clone(&service);
                    async move { service.compute_next(batch).await }
                }
            },
        ));
        handles.push(spawn_periodic(
            "dispatch",
            Duration::from_secs(scheduler.dispatch_period_secs.max(1)),
            shutdown_rx.clone(),
            {
                let service = Arc::clone(&service);
                let batch = scheduler.dispatch_batch_size;
                move || {
                    let service = Arc::clone(&service);
                    async move { service.dispatch_outbox(batch).await.map(|n| n as u64) }
                }
            },
        ));

        info!(target: "rdp.daemon", loops = handles.len(), "pipeline runtime started");
        Ok(Self {
            shutdown: shutdown_tx,
            handles,
            bus: components.bus,
        })
    }

    /// Stop every loop: consumers drain their in-flight message, the bus is
    /// flushed, and all tasks are awaited.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        if let Err(err) = self.bus.flush().await {
            warn!(target: "rdp.daemon", error = %err, "bus flush on shutdown failed");
        }
        info!(target: "rdp.daemon", "pipeline runtime stopped");
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<u64, rdp_sched::SchedError>> + Send,
{
    tokio::spawn(async move {
        // Startup jitter to spread replicas of the same loop apart.
        let jitter = rand::thread_rng().gen_range(0..2000u64);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(target: "rdp.daemon", loop_name = name, "periodic loop stopping");
                        return;
                    }
                }
                _ = interval.tick() => {
                    match task().await {
                        Ok(0) => {}
                        Ok(n) => {
                            info!(target: "rdp.daemon", loop_name = name, processed = n, "periodic pass");
                        }
                        Err(err) => {
                            // Transient by construction; the next tick retries.
                            warn!(target: "rdp.daemon", loop_name = name, error = %err, "periodic pass failed");
                        }
                    }
                }
            }
        }
    })
}
