// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deliverer (J₄): the final stage.
//!
//! Hands the parsed payload to downstream subscribers on `delivery.request`,
//! records the hand-off as a DeliveryEvent, emits `delivery.result`, and
//! announces `run.completed`. Downstream subscribers dedupe by content hash;
//! this stage only guarantees at-least-once.

use crate::handler::{StageHandler, decode_payload};
use crate::lifecycle::RunLifecycleEmitter;
use async_trait::async_trait;
use rdp_blob::{BlobError, BlobStore};
use rdp_bus::EventBus;
use rdp_core::event::{DeliveryOutcome, DeliveryRequest, DeliveryResult, VersioningResult, topics};
use rdp_core::{DeliveryStatus, Envelope};
use rdp_error::PipelineError;
use rdp_store::DocumentStore;
use std::sync::Arc;
use tracing::{debug, info};

/// What the delivery stage hands to downstream consumers.
const ARTIFACT_TYPE: &str = "parsed_document";

/// Consumes `versioning.result`, emits `delivery.request` and
/// `delivery.result`.
pub struct DeliverHandler {
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    bus: Arc<dyn EventBus>,
    lifecycle: RunLifecycleEmitter,
}

impl DeliverHandler {
    /// Build the handler.
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        bus: Arc<dyn EventBus>,
        lifecycle: RunLifecycleEmitter,
    ) -> Self {
        Self {
            documents,
            blobs,
            bus,
            lifecycle,
        }
    }

    async fn publish(
        &self,
        topic: &'static str,
        payload: &impl serde::Serialize,
    ) -> Result<(), PipelineError> {
        let envelope = Envelope::new(topic, payload)
            .map_err(|err| PipelineError::internal("encode delivery event").with_cause(err))?;
        self.bus
            .publish(topic, &envelope)
            .await
            .map_err(|err| PipelineError::transient(format!("publish {topic}")).with_cause(err))
    }

    async fn execute(&self, payload: &VersioningResult) -> Result<(), PipelineError> {
        let version = self
            .documents
            .version(payload.version_id)
            .await
            .map_err(|err| PipelineError::transient("version lookup failed").with_cause(err))?
            .ok_or_else(|| {
                PipelineError::data(format!("document version {} not found", payload.version_id))
            })?;

        let parsed_bytes = self
            .blobs
            .get(&version.parsed_uri)
            .await
            .map_err(|err| match err {
                BlobError::NotFound { .. } | BlobError::InvalidUri(_) => {
                    PipelineError::data("parsed snapshot missing").with_cause(err)
                }
                BlobError::Backend { .. } => {
                    PipelineError::transient("download parsed snapshot").with_cause(err)
                }
            })?;
        let parsed_document: serde_json::Value = serde_json::from_slice(&parsed_bytes)
            .map_err(|err| PipelineError::data("parsed snapshot is not JSON").with_cause(err))?;
        let sections_delivered = parsed_document["sections"]
            .as_array()
            .map_or(0, Vec::len);

        // Redelivery dedupe keyed on the version: resume a PENDING hand-off,
        // reuse a COMPLETED one.
        let existing = self
            .documents
            .deliveries_for_version(payload.version_id)
            .await
            .map_err(|err| PipelineError::transient("delivery lookup failed").with_cause(err))?;
        let completed = existing
            .iter()
            .find(|d| d.status == DeliveryStatus::Completed)
            .cloned();
        let delivery = match completed {
            Some(done) => {
                debug!(
                    target: "rdp.stages",
                    delivery_event_id = done.id,
                    "delivery already completed, re-emitting result"
                );
                done
            }
            None => {
                let delivery = match existing
                    .into_iter()
                    .find(|d| d.status == DeliveryStatus::Pending)
                {
                    Some(pending) => pending,
                    None => self
                        .documents
                        .insert_delivery(payload.version_id, ARTIFACT_TYPE, chrono::Utc::now())
                        .await
                        .map_err(|err| {
                            PipelineError::transient("record delivery").with_cause(err)
                        })?,
                };

                let request = DeliveryRequest {
                    doc_id: payload.doc_id,
                    version_id: payload.version_id,
                    parsed_document,
                    run_id: payload.run_id,
                    trace_id: payload.trace_id.clone(),
                };
                if let Err(err) = self.publish(topics::DELIVERY_REQUEST, &request).await {
                    self.documents
                        .fail_delivery(delivery.id, &err.chain_message(), chrono::Utc::now())
                        .await
                        .map_err(|store_err| {
                            PipelineError::transient("record delivery failure")
                                .with_cause(store_err)
                        })?;
                    return Err(err);
                }

                self.documents
                    .complete_delivery(delivery.id, &version.parsed_uri, chrono::Utc::now())
                    .await
                    .map_err(|err| {
                        PipelineError::transient("record delivery completion").with_cause(err)
                    })?;
                delivery
            }
        };

        let outcome = DeliveryOutcome {
            delivery_event_id: delivery.id,
            sections_delivered,
        };
        let result = DeliveryResult {
            doc_id: payload.doc_id,
            version_id: payload.version_id,
            status: DeliveryStatus::Completed,
            result: outcome,
            run_id: payload.run_id,
            trace_id: payload.trace_id.clone(),
        };
        self.publish(topics::DELIVERY_RESULT, &result).await?;

        info!(
            target: "rdp.stages",
            run_id = payload.run_id,
            doc_id = payload.doc_id,
            version_id = payload.version_id,
            delivery_event_id = delivery.id,
            sections_delivered,
            "delivery completed"
        );

        self.lifecycle
            .completed(
                payload.run_id,
                &payload.trace_id,
                serde_json::to_value(&result.result).ok(),
            )
            .await;
        Ok(())
    }
}

#[async_trait]
impl StageHandler for DeliverHandler {
    fn topic(&self) -> &'static str {
        topics::VERSIONING_RESULT
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), PipelineError> {
        let payload: VersioningResult = decode_payload(envelope)?;
        self.lifecycle
            .started(payload.run_id, &payload.trace_id)
            .await;

        match self.execute(&payload).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() => Err(err),
            Err(err) => {
                self.lifecycle
                    .failed(payload.run_id, &payload.trace_id, &err.chain_message(), None)
                    .await;
                Err(err)
            }
        }
    }
}
