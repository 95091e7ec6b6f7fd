// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parser (J₂).
//!
//! Downloads the raw bytes, decodes and extracts sections, upserts the
//! Document keyed by `source_url`, records a DocumentVersion with the content
//! hash, and uploads the parsed JSON plus a raw-fetch metadata sidecar before
//! emitting `parse.result`. A redelivered `crawl.result` for a run that
//! already produced a version re-emits the result instead of parsing twice.

use crate::handler::{StageHandler, decode_payload};
use crate::lifecycle::RunLifecycleEmitter;
use async_trait::async_trait;
use rdp_blob::{BlobError, BlobStore};
use rdp_bus::EventBus;
use rdp_core::event::{CrawlResult, ParseResult, topics};
use rdp_core::{DocumentVersion, Envelope, keys};
use rdp_error::PipelineError;
use rdp_store::DocumentStore;
use std::sync::Arc;
use tracing::{debug, info};

/// Consumes `crawl.result`, emits `parse.result`.
pub struct ParseHandler {
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    bus: Arc<dyn EventBus>,
    lifecycle: RunLifecycleEmitter,
}

impl ParseHandler {
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
        payload: &CrawlResult,
        version: &DocumentVersion,
        section_count: usize,
    ) -> Result<(), PipelineError> {
        let result = ParseResult {
            doc_id: version.document_id,
            version_id: version.id,
            parsed_uri: version.parsed_uri.clone(),
            section_count,
            source_url: payload.source_url.clone(),
            run_id: payload.run_id,
            trace_id: payload.trace_id.clone(),
        };
        let envelope = Envelope::new(topics::PARSE_RESULT, &result)
            .map_err(|err| PipelineError::internal("encode parse.result").with_cause(err))?;
        self.bus
            .publish(topics::PARSE_RESULT, &envelope)
            .await
            .map_err(|err| PipelineError::transient("publish parse.result").with_cause(err))?;
        Ok(())
    }

    fn blob_failure(context: &'static str) -> impl Fn(BlobError) -> PipelineError {
        move |err| match err {
            BlobError::NotFound { .. } | BlobError::InvalidUri(_) => {
                PipelineError::data(context).with_cause(err)
            }
            BlobError::Backend { .. } => PipelineError::transient(context).with_cause(err),
        }
    }

    async fn execute(&self, payload: &CrawlResult) -> Result<(), PipelineError> {
        // Redelivery dedupe: one DocumentVersion per run.
        let resumed = self
            .documents
            .version_by_run(payload.run_id)
            .await
            .map_err(|err| PipelineError::transient("version lookup failed").with_cause(err))?;
        if let Some(existing) = &resumed {
            if !existing.parsed_uri.is_empty() {
                debug!(
                    target: "rdp.stages",
                    run_id = payload.run_id,
                    version_id = existing.id,
                    "version already recorded for run, re-emitting result"
                );
                let parsed = self
                    .blobs
                    .get(&existing.parsed_uri)
                    .await
                    .map_err(Self::blob_failure("download parsed snapshot"))?;
                let section_count = serde_json::from_slice::<serde_json::Value>(&parsed)
                    .ok()
                    .and_then(|v| v["sections"].as_array().map(Vec::len))
                    .unwrap_or(0);
                return self.emit_result(payload, existing, section_count).await;
            }
        }

        let bytes = self
            .blobs
            .get(&payload.blob_uri)
            .await
            .map_err(Self::blob_failure("download raw artifact"))?;

        let (parsed_doc, encoding) = rdp_parse::parse_document(
            &bytes,
            Some(payload.content_type.as_str()),
            &payload.source_url,
        )
        .map_err(|err| PipelineError::source_failure(err.to_string()))?;

        let parsed_value = parsed_doc.to_value();
        let content_hash = parsed_doc.content_hash();
        let now = chrono::Utc::now();

        // A run that crashed between the version insert and the snapshot
        // upload resumes with its existing row instead of creating a second.
        let version = match resumed {
            Some(existing) => existing,
            None => {
                let document = self
                    .documents
                    .upsert_document(
                        payload.source_id,
                        &payload.source_url,
                        parsed_doc.published_date.clone(),
                        &parsed_doc.language,
                        now,
                    )
                    .await
                    .map_err(|err| PipelineError::transient("upsert document").with_cause(err))?;
                self.documents
                    .insert_version(document.id, &content_hash, payload.run_id, now)
                    .await
                    .map_err(|err| PipelineError::transient("record version").with_cause(err))?
            }
        };

        let parsed_bytes = serde_json::to_vec_pretty(&parsed_value)
            .map_err(|err| PipelineError::internal("serialize parsed document").with_cause(err))?;
        let parsed_uri = self
            .blobs
            .put(
                &keys::parsed_key(version.document_id, version.id),
                parsed_bytes,
                "application/json",
            )
            .await
            .map_err(|err| PipelineError::transient("upload parsed snapshot").with_cause(err))?;
        self.documents
            .set_parsed_uri(version.id, &parsed_uri.to_string())
            .await
            .map_err(|err| PipelineError::transient("record parsed uri").with_cause(err))?;

        // Fetch metadata sidecar, keyed by the raw fetch hash.
        if let Some(artifact) = self
            .documents
            .artifact_by_run(payload.run_id)
            .await
            .map_err(|err| PipelineError::transient("artifact lookup failed").with_cause(err))?
        {
            let metadata = serde_json::json!({
                "artifact_id": artifact.id,
                "source_url": payload.source_url,
                "fetched_at": artifact.fetched_at.to_rfc3339(),
                "encoding": encoding.name,
                "encoding_method": encoding.method.as_str(),
                "encoding_confidence": encoding.confidence,
                "content_length": bytes.len(),
            });
            let metadata_bytes = serde_json::to_vec_pretty(&metadata)
                .map_err(|err| PipelineError::internal("serialize fetch metadata").with_cause(err))?;
            self.blobs
                .put(
                    &keys::raw_meta_key(&artifact.fetch_hash),
                    metadata_bytes,
                    "application/json",
                )
                .await
                .map_err(|err| PipelineError::transient("upload fetch metadata").with_cause(err))?;
        }

        info!(
            target: "rdp.stages",
            run_id = payload.run_id,
            doc_id = version.document_id,
            version_id = version.id,
            content_hash = %content_hash,
            sections = parsed_doc.sections.len(),
            "parse recorded"
        );

        let version = DocumentVersion {
            parsed_uri: parsed_uri.to_string(),
            ..version
        };
        self.emit_result(payload, &version, parsed_doc.sections.len())
            .await
    }
}

#[async_trait]
impl StageHandler for ParseHandler {
    fn topic(&self) -> &'static str {
        topics::CRAWL_RESULT
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), PipelineError> {
        let payload: CrawlResult = decode_payload(envelope)?;
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
    use rdp_core::canonical;
    use rdp_store::{MemoryStore, NewArtifact};
    use std::collections::BTreeMap;

    const PAGE: &str = "<html lang=\"en\"><body><h1>Scope</h1><p>All operators.</p>\
                        <h2>Definitions</h2><p>Operator means anyone.</p></body></html>";

    async fn setup() -> (MemoryStore, MemoryBlobStore, MemoryBus, ParseHandler) {
        let store = MemoryStore::new();
        let blobs = MemoryBlobStore::new();
        let bus = MemoryBus::new();
        let handler = ParseHandler::new(
            Arc::new(store.clone()),
            Arc::new(blobs.clone()),
            Arc::new(bus.clone()),
            RunLifecycleEmitter::new(Arc::new(bus.clone())),
        );
        (store, blobs, bus, handler)
    }

    async fn stage_artifact(
        store: &MemoryStore,
        blobs: &MemoryBlobStore,
        run_id: i64,
        body: &str,
    ) -> CrawlResult {
        let hash = canonical::sha256_hex(body.as_bytes());
        let key = keys::raw_key(1, chrono::Utc::now(), &hash);
        let uri = blobs
            .put(&key, body.as_bytes().to_vec(), "text/html")
            .await
            .unwrap();
        let artifact = store
            .insert_artifact(
                NewArtifact {
                    source_url: "https://example.test/reg".into(),
                    content_type: "text/html".into(),
                    blob_uri: uri.to_string(),
                    fetch_hash: hash,
                    run_id,
                },
                chrono::Utc::now(),
            )
            .await
            .unwrap();
        CrawlResult {
            artifact_id: artifact.id,
            blob_uri: artifact.blob_uri,
            content_type: "text/html".into(),
            status_code: 200,
            headers: BTreeMap::new(),
            source_url: "https://example.test/reg".into(),
            source_id: 1,
            run_id,
            trace_id: "trace".into(),
        }
    }

    #[tokio::test]
    async fn parses_and_records_document_version() {
        let (store, blobs, bus, handler) = setup().await;
        let payload = stage_artifact(&store, &blobs, 21, PAGE).await;
        let mut results = bus.subscribe(topics::PARSE_RESULT, "t").await.unwrap();

        let envelope = Envelope::new(topics::CRAWL_RESULT, &payload).unwrap();
        handler.handle(&envelope).await.unwrap();

        let result: ParseResult = results.next().await.unwrap().unwrap().envelope.decode().unwrap();
        assert_eq!(result.section_count, 2);
        assert_eq!(result.run_id, 21);

        let version = store.version(result.version_id).await.unwrap().unwrap();
        assert_eq!(version.parsed_uri, result.parsed_uri);
        assert!(version.diff_uri.is_none());

        // Invariant: hash of the canonicalized downloaded snapshot equals the
        // stored content hash.
        let downloaded = blobs.get(&version.parsed_uri).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&downloaded).unwrap();
        assert_eq!(canonical::content_hash(&value), version.content_hash);

        // Fetch metadata sidecar landed under the raw hash.
        let artifact = store.artifact_by_run(21).await.unwrap().unwrap();
        let meta = blobs
            .get(&format!("s3://artifacts/{}", keys::raw_meta_key(&artifact.fetch_hash)))
            .await
            .unwrap();
        let meta: serde_json::Value = serde_json::from_slice(&meta).unwrap();
        assert_eq!(meta["encoding_method"].as_str(), Some("content-type"));
    }

    #[tokio::test]
    async fn reparsing_identical_bytes_yields_the_same_hash() {
        let (store, blobs, _bus, handler) = setup().await;
        let first = stage_artifact(&store, &blobs, 31, PAGE).await;
        let second = stage_artifact(&store, &blobs, 32, PAGE).await;

        handler
            .handle(&Envelope::new(topics::CRAWL_RESULT, &first).unwrap())
            .await
            .unwrap();
        handler
            .handle(&Envelope::new(topics::CRAWL_RESULT, &second).unwrap())
            .await
            .unwrap();

        let v1 = store.version_by_run(31).await.unwrap().unwrap();
        let v2 = store.version_by_run(32).await.unwrap().unwrap();
        assert_ne!(v1.id, v2.id);
        assert_eq!(v1.content_hash, v2.content_hash);
        assert_eq!(v1.document_id, v2.document_id);
    }

    #[tokio::test]
    async fn redelivered_crawl_result_reuses_the_version() {
        let (store, blobs, bus, handler) = setup().await;
        let payload = stage_artifact(&store, &blobs, 41, PAGE).await;
        let mut results = bus.subscribe(topics::PARSE_RESULT, "t").await.unwrap();

        let envelope = Envelope::new(topics::CRAWL_RESULT, &payload).unwrap();
        handler.handle(&envelope).await.unwrap();
        handler.handle(&envelope).await.unwrap();

        let first: ParseResult = results.next().await.unwrap().unwrap().envelope.decode().unwrap();
        let second: ParseResult = results.next().await.unwrap().unwrap().envelope.decode().unwrap();
        assert_eq!(first.version_id, second.version_id);
        assert_eq!(second.section_count, 2);
        assert_eq!(store.versions_of(first.doc_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_extraction_fails_the_run() {
        let (store, blobs, bus, handler) = setup().await;
        let payload = stage_artifact(
            &store,
            &blobs,
            51,
            "<html><head><script>x()</script></head><body></body></html>",
        )
        .await;
        let mut status = bus.subscribe(topics::RUN_STATUS, "t").await.unwrap();

        let err = handler
            .handle(&Envelope::new(topics::CRAWL_RESULT, &payload).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.class, rdp_error::ErrorClass::Source);

        assert_eq!(status.next().await.unwrap().unwrap().envelope.event, "run.started");
        assert_eq!(status.next().await.unwrap().unwrap().envelope.event, "run.failed");
        assert!(store.version_by_run(51).await.unwrap().is_none());
    }
}
