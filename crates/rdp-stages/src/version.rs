// SPDX-License-Identifier: MIT OR Apache-2.0
//! Versioner (J₃).
//!
//! Loads the previous version of the document, computes the RFC 6902 patch
//! from old to new, uploads it, and stamps `diff_uri` on the current version.
//! The first version of a document keeps `diff_uri` null; an unchanged
//! document gets a patch with an empty operations list.

use crate::handler::{StageHandler, decode_payload};
use crate::lifecycle::RunLifecycleEmitter;
use async_trait::async_trait;
use rdp_blob::{BlobError, BlobStore};
use rdp_bus::EventBus;
use rdp_core::event::{ParseResult, VersioningResult, topics};
use rdp_core::{Envelope, keys};
use rdp_error::PipelineError;
use rdp_store::DocumentStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Consumes `parse.result`, emits `versioning.result`.
pub struct VersionHandler {
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    bus: Arc<dyn EventBus>,
    lifecycle: RunLifecycleEmitter,
}

impl VersionHandler {
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

    async fn emit_result(
        &self,
        payload: &ParseResult,
        diff_uri: Option<String>,
    ) -> Result<(), PipelineError> {
        let result = VersioningResult {
            doc_id: payload.doc_id,
            version_id: payload.version_id,
            diff_uri,
            run_id: payload.run_id,
            trace_id: payload.trace_id.clone(),
        };
        let envelope = Envelope::new(topics::VERSIONING_RESULT, &result)
            .map_err(|err| PipelineError::internal("encode versioning.result").with_cause(err))?;
        self.bus
            .publish(topics::VERSIONING_RESULT, &envelope)
            .await
            .map_err(|err| PipelineError::transient("publish versioning.result").with_cause(err))?;
        Ok(())
    }

    async fn fetch_json(&self, uri: &str) -> Result<serde_json::Value, PipelineError> {
        let bytes = self.blobs.get(uri).await.map_err(|err| match err {
            BlobError::NotFound { .. } | BlobError::InvalidUri(_) => {
                PipelineError::data("parsed snapshot missing").with_cause(err)
            }
            BlobError::Backend { .. } => {
                PipelineError::transient("download parsed snapshot").with_cause(err)
            }
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|err| PipelineError::data("parsed snapshot is not JSON").with_cause(err))
    }

    async fn execute(&self, payload: &ParseResult) -> Result<(), PipelineError> {
        let current = self
            .documents
            .version(payload.version_id)
            .await
            .map_err(|err| PipelineError::transient("version lookup failed").with_cause(err))?
            .ok_or_else(|| {
                PipelineError::data(format!("document version {} not found", payload.version_id))
            })?;

        // Redelivery dedupe: the diff was already computed and stamped.
        if let Some(diff_uri) = current.diff_uri.clone() {
            debug!(
                target: "rdp.stages",
                version_id = current.id,
                "diff already recorded, re-emitting result"
            );
            return self.emit_result(payload, Some(diff_uri)).await;
        }

        let previous = self
            .documents
            .previous_version(payload.doc_id, payload.version_id)
            .await
            .map_err(|err| PipelineError::transient("previous version lookup").with_cause(err))?;

        let Some(previous) = previous else {
            debug!(
                target: "rdp.stages",
                version_id = payload.version_id,
                "first version of document, no diff"
            );
            return self.emit_result(payload, None).await;
        };
        if previous.parsed_uri.is_empty() {
            // The previous run died before uploading its snapshot; nothing to
            // diff against.
            warn!(
                target: "rdp.stages",
                previous_version_id = previous.id,
                "previous version has no snapshot, skipping diff"
            );
            return self.emit_result(payload, None).await;
        }

        let old = self.fetch_json(&previous.parsed_uri).await?;
        let new = self.fetch_json(&payload.parsed_uri).await?;
        let patch = json_patch::diff(&old, &new);

        let patch_bytes = serde_json::to_vec_pretty(&patch)
            .map_err(|err| PipelineError::internal("serialize patch").with_cause(err))?;
        let diff_uri = self
            .blobs
            .put(
                &keys::diff_key(payload.doc_id, payload.version_id),
                patch_bytes,
                "application/json",
            )
            .await
            .map_err(|err| PipelineError::transient("upload diff").with_cause(err))?;
        self.documents
            .set_diff_uri(payload.version_id, &diff_uri.to_string())
            .await
            .map_err(|err| PipelineError::transient("record diff uri").with_cause(err))?;

        info!(
            target: "rdp.stages",
            doc_id = payload.doc_id,
            version_id = payload.version_id,
            previous_version_id = previous.id,
            operations = patch.0.len(),
            "diff recorded"
        );
        self.emit_result(payload, Some(diff_uri.to_string())).await
    }
}

#[async_trait]
impl StageHandler for VersionHandler {
    fn topic(&self) -> &'static str {
        topics::PARSE_RESULT
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), PipelineError> {
        let payload: ParseResult = decode_payload(envelope)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use rdp_blob::MemoryBlobStore;
    use rdp_bus::MemoryBus;
    use rdp_core::DocumentVersion;
    use serde_json::json;

    async fn setup() -> (
        rdp_store::MemoryStore,
        MemoryBlobStore,
        MemoryBus,
        VersionHandler,
    ) {
        let store = rdp_store::MemoryStore::new();
        let blobs = MemoryBlobStore::new();
        let bus = MemoryBus::new();
        let handler = VersionHandler::new(
            Arc::new(store.clone()),
            Arc::new(blobs.clone()),
            Arc::new(bus.clone()),
            RunLifecycleEmitter::new(Arc::new(bus.clone())),
        );
        (store, blobs, bus, handler)
    }

    async fn stage_version(
        store: &rdp_store::MemoryStore,
        blobs: &MemoryBlobStore,
        doc_id: i64,
        run_id: i64,
        parsed: &serde_json::Value,
    ) -> DocumentVersion {
        let hash = rdp_core::canonical::content_hash(parsed);
        let version = store
            .insert_version(doc_id, &hash, run_id, chrono::Utc::now())
            .await
            .unwrap();
        let uri = blobs
            .put(
                &keys::parsed_key(doc_id, version.id),
                serde_json::to_vec(parsed).unwrap(),
                "application/json",
            )
            .await
            .unwrap();
        store.set_parsed_uri(version.id, &uri.to_string()).await.unwrap();
        store.version(version.id).await.unwrap().unwrap()
    }

    fn parse_result(doc_id: i64, version: &DocumentVersion, run_id: i64) -> Envelope {
        Envelope::new(
            topics::PARSE_RESULT,
            &ParseResult {
                doc_id,
                version_id: version.id,
                parsed_uri: version.parsed_uri.clone(),
                section_count: 1,
                source_url: "https://example.test/reg".into(),
                run_id,
                trace_id: "trace".into(),
            },
        )
        .unwrap()
    }

    async fn seed_document(store: &rdp_store::MemoryStore) -> i64 {
        store
            .upsert_document(1, "https://example.test/reg", None, "en", chrono::Utc::now())
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn first_version_has_no_diff() {
        let (store, blobs, bus, handler) = setup().await;
        let doc_id = seed_document(&store).await;
        let parsed = json!({"sections": [{"id": 1, "text": "a"}]});
        let version = stage_version(&store, &blobs, doc_id, 61, &parsed).await;
        let mut results = bus.subscribe(topics::VERSIONING_RESULT, "t").await.unwrap();

        handler
            .handle(&parse_result(doc_id, &version, 61))
            .await
            .unwrap();

        let result: VersioningResult =
            results.next().await.unwrap().unwrap().envelope.decode().unwrap();
        assert_eq!(result.diff_uri, None);
        let stored = store.version(version.id).await.unwrap().unwrap();
        assert!(stored.diff_uri.is_none());
    }

    #[tokio::test]
    async fn changed_content_produces_an_applicable_patch() {
        let (store, blobs, bus, handler) = setup().await;
        let doc_id = seed_document(&store).await;
        let old = json!({"sections": [{"id": 1, "text": "old body"}]});
        let new = json!({"sections": [{"id": 1, "text": "new body"}]});
        let _v1 = stage_version(&store, &blobs, doc_id, 71, &old).await;
        // Later creation instant so ordering by created_at is unambiguous.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let v2 = stage_version(&store, &blobs, doc_id, 72, &new).await;
        let mut results = bus.subscribe(topics::VERSIONING_RESULT, "t").await.unwrap();

        handler.handle(&parse_result(doc_id, &v2, 72)).await.unwrap();

        let result: VersioningResult =
            results.next().await.unwrap().unwrap().envelope.decode().unwrap();
        let diff_uri = result.diff_uri.unwrap();
        let patch_bytes = blobs.get(&diff_uri).await.unwrap();
        let patch: json_patch::Patch = serde_json::from_slice(&patch_bytes).unwrap();
        assert!(!patch.0.is_empty());

        // Diff law: applying the patch to the old snapshot yields the new one.
        let mut patched = old.clone();
        json_patch::patch(&mut patched, &patch).unwrap();
        assert_eq!(patched, new);
    }

    #[tokio::test]
    async fn unchanged_content_produces_an_empty_patch() {
        let (store, blobs, bus, handler) = setup().await;
        let doc_id = seed_document(&store).await;
        let parsed = json!({"sections": [{"id": 1, "text": "same"}]});
        let _v1 = stage_version(&store, &blobs, doc_id, 81, &parsed).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let v2 = stage_version(&store, &blobs, doc_id, 82, &parsed).await;
        let mut results = bus.subscribe(topics::VERSIONING_RESULT, "t").await.unwrap();

        handler.handle(&parse_result(doc_id, &v2, 82)).await.unwrap();

        let result: VersioningResult =
            results.next().await.unwrap().unwrap().envelope.decode().unwrap();
        let diff_uri = result.diff_uri.expect("unchanged content still records a diff");
        let patch: serde_json::Value =
            serde_json::from_slice(&blobs.get(&diff_uri).await.unwrap()).unwrap();
        assert_eq!(patch, json!([]));
    }

    #[tokio::test]
    async fn redelivery_reuses_the_recorded_diff() {
        let (store, blobs, bus, handler) = setup().await;
        let doc_id = seed_document(&store).await;
        let old = json!({"sections": []});
        let new = json!({"sections": [{"id": 1}]});
        let _v1 = stage_version(&store, &blobs, doc_id, 91, &old).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let v2 = stage_version(&store, &blobs, doc_id, 92, &new).await;
        let mut results = bus.subscribe(topics::VERSIONING_RESULT, "t").await.unwrap();

        let envelope = parse_result(doc_id, &v2, 92);
        handler.handle(&envelope).await.unwrap();
        handler.handle(&envelope).await.unwrap();

        let first: VersioningResult =
            results.next().await.unwrap().unwrap().envelope.decode().unwrap();
        let second: VersioningResult =
            results.next().await.unwrap().unwrap().envelope.decode().unwrap();
        assert_eq!(first.diff_uri, second.diff_uri);
    }
}
