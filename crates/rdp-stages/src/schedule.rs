// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subscription-scheduled handler (J₀): the pipeline entry.
//!
//! Resolves the subscription to its source and asks the crawler to fetch the
//! source's base URL. The trace id for the whole run is minted here when the
//! scheduler did not supply one.

use crate::handler::{StageHandler, decode_payload};
use crate::lifecycle::RunLifecycleEmitter;
use async_trait::async_trait;
use rdp_bus::EventBus;
use rdp_core::Envelope;
use rdp_core::event::{CrawlRequest, SubscriptionScheduled, topics};
use rdp_error::PipelineError;
use rdp_store::{RunStore, SourceStore, SubscriptionStore};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Consumes `subs.schedule`, emits `crawl.request`.
pub struct ScheduleHandler {
    subscriptions: Arc<dyn SubscriptionStore>,
    sources: Arc<dyn SourceStore>,
    runs: Arc<dyn RunStore>,
    bus: Arc<dyn EventBus>,
    lifecycle: RunLifecycleEmitter,
}

impl ScheduleHandler {
    /// Build the handler.
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        sources: Arc<dyn SourceStore>,
        runs: Arc<dyn RunStore>,
        bus: Arc<dyn EventBus>,
        lifecycle: RunLifecycleEmitter,
    ) -> Self {
        Self {
            subscriptions,
            sources,
            runs,
            bus,
            lifecycle,
        }
    }

    async fn execute(
        &self,
        payload: &SubscriptionScheduled,
        trace_id: &str,
    ) -> Result<(), PipelineError> {
        let subscription = self
            .subscriptions
            .subscription(payload.subscription_id)
            .await
            .map_err(|err| PipelineError::transient("subscription lookup failed").with_cause(err))?
            .ok_or_else(|| {
                PipelineError::data(format!(
                    "subscription {} not found",
                    payload.subscription_id
                ))
            })?;

        let source = self
            .sources
            .source(subscription.source_id)
            .await
            .map_err(|err| PipelineError::transient("source lookup failed").with_cause(err))?
            .ok_or_else(|| {
                PipelineError::data(format!("source {} not found", subscription.source_id))
            })?;

        if self
            .runs
            .run(payload.run_id)
            .await
            .map_err(|err| PipelineError::transient("run lookup failed").with_cause(err))?
            .is_none()
        {
            return Err(PipelineError::data(format!(
                "run {} not found",
                payload.run_id
            )));
        }

        let request = CrawlRequest {
            url: source.base_url.clone(),
            source_id: source.id,
            run_id: payload.run_id,
            crawl_request_id: Uuid::new_v4().to_string(),
            trace_id: trace_id.to_string(),
            subscription_id: payload.subscription_id,
        };
        let envelope = Envelope::new(topics::CRAWL_REQUEST, &request)
            .map_err(|err| PipelineError::internal("encode crawl.request").with_cause(err))?;
        self.bus
            .publish(topics::CRAWL_REQUEST, &envelope)
            .await
            .map_err(|err| PipelineError::transient("publish crawl.request").with_cause(err))?;

        info!(
            target: "rdp.stages",
            run_id = payload.run_id,
            subscription_id = payload.subscription_id,
            url = %request.url,
            crawl_request_id = %request.crawl_request_id,
            "crawl requested"
        );
        Ok(())
    }
}

#[async_trait]
impl StageHandler for ScheduleHandler {
    fn topic(&self) -> &'static str {
        topics::SUBS_SCHEDULE
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), PipelineError> {
        let payload: SubscriptionScheduled = decode_payload(envelope)?;
        let trace_id = payload
            .trace_id
            .clone()
            .unwrap_or_else(rdp_core::new_trace_id);

        self.lifecycle.started(payload.run_id, &trace_id).await;

        match self.execute(&payload, &trace_id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.lifecycle
                    .failed(payload.run_id, &trace_id, &err.chain_message(), None)
                    .await;
                Err(err)
            }
        }
    }
}
