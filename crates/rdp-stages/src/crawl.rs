// SPDX-License-Identifier: MIT OR Apache-2.0
//! Crawler (J₁).
//!
//! Fetches the requested URL, stores the raw bytes under their sha256, and
//! records an Artifact row before emitting `crawl.result`. A redelivered
//! `crawl.request` for a run that already has an Artifact re-emits the result
//! instead of fetching twice.

use crate::handler::{StageHandler, decode_payload};
use crate::lifecycle::RunLifecycleEmitter;
use async_trait::async_trait;
use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rdp_blob::BlobStore;
use rdp_bus::EventBus;
use rdp_core::event::{CrawlRequest, CrawlResult, topics};
use rdp_core::{Artifact, Envelope, canonical, keys};
use rdp_error::PipelineError;
use rdp_store::{DocumentStore, NewArtifact, SourceStore};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Per-source token bucket honoring each source's requests-per-minute limit.
pub struct RateGate {
    limiters: Mutex<HashMap<i64, Arc<DefaultDirectRateLimiter>>>,
}

impl RateGate {
    /// Create an empty gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until the source's bucket has a token.
    pub async fn acquire(&self, source_id: i64, per_minute: u32) {
        let limiter = {
            let mut limiters = self.limiters.lock().await;
            Arc::clone(limiters.entry(source_id).or_insert_with(|| {
                let quota = Quota::per_minute(
                    NonZeroU32::new(per_minute.max(1)).unwrap_or(NonZeroU32::MIN),
                );
                Arc::new(RateLimiter::direct(quota))
            }))
        };
        limiter.until_ready().await;
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumes `crawl.request`, emits `crawl.result`.
pub struct CrawlHandler {
    sources: Arc<dyn SourceStore>,
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    bus: Arc<dyn EventBus>,
    lifecycle: RunLifecycleEmitter,
    client: reqwest::Client,
    rate_gate: RateGate,
}

impl CrawlHandler {
    /// Build the handler with the given HTTP timeout.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] when the HTTP client cannot be built.
    pub fn new(
        sources: Arc<dyn SourceStore>,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        bus: Arc<dyn EventBus>,
        lifecycle: RunLifecycleEmitter,
        http_timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|err| PipelineError::internal("build http client").with_cause(err))?;
        Ok(Self {
            sources,
            documents,
            blobs,
            bus,
            lifecycle,
            client,
            rate_gate: RateGate::new(),
        })
    }

    async fn emit_result(
        &self,
        payload: &CrawlRequest,
        artifact: &Artifact,
        status_code: u16,
        headers: BTreeMap<String, String>,
    ) -> Result<(), PipelineError> {
        let result = CrawlResult {
            artifact_id: artifact.id,
            blob_uri: artifact.blob_uri.clone(),
            content_type: artifact.content_type.clone(),
            status_code,
            headers,
            source_url: payload.url.clone(),
            source_id: payload.source_id,
            run_id: payload.run_id,
            trace_id: payload.trace_id.clone(),
        };
        let envelope = Envelope::new(topics::CRAWL_RESULT, &result)
            .map_err(|err| PipelineError::internal("encode crawl.result").with_cause(err))?;
        self.bus
            .publish(topics::CRAWL_RESULT, &envelope)
            .await
            .map_err(|err| PipelineError::transient("publish crawl.result").with_cause(err))?;
        Ok(())
    }

    async fn execute(&self, payload: &CrawlRequest) -> Result<(), PipelineError> {
        // Redelivery dedupe: one Artifact per run.
        if let Some(existing) = self
            .documents
            .artifact_by_run(payload.run_id)
            .await
            .map_err(|err| PipelineError::transient("artifact lookup failed").with_cause(err))?
        {
            debug!(
                target: "rdp.stages",
                run_id = payload.run_id,
                artifact_id = existing.id,
                "artifact already recorded for run, re-emitting result"
            );
            return self
                .emit_result(payload, &existing, 200, BTreeMap::new())
                .await;
        }

        let source = self
            .sources
            .source(payload.source_id)
            .await
            .map_err(|err| PipelineError::transient("source lookup failed").with_cause(err))?
            .ok_or_else(|| PipelineError::data(format!("source {} not found", payload.source_id)))?;

        self.rate_gate.acquire(source.id, source.rate_limit).await;

        let response = self
            .client
            .get(&payload.url)
            .send()
            .await
            .map_err(|err| {
                PipelineError::transient(format!("fetch {} failed", payload.url)).with_cause(err)
            })?;

        let status_code = response.status().as_u16();
        if !response.status().is_success() {
            return Err(PipelineError::source_failure(format!(
                "fetch {} returned HTTP {status_code}",
                payload.url
            )));
        }

        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.to_string(), value.to_string());
            }
        }
        let content_type = headers
            .get("content-type")
            .cloned()
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let body = response
            .bytes()
            .await
            .map_err(|err| PipelineError::transient("read response body").with_cause(err))?;
        let fetch_hash = canonical::sha256_hex(&body);
        let fetched_at = Utc::now();

        let key = keys::raw_key(payload.source_id, fetched_at, &fetch_hash);
        let blob_uri = self
            .blobs
            .put(&key, body.to_vec(), &content_type)
            .await
            .map_err(|err| PipelineError::transient("store raw bytes").with_cause(err))?;

        let artifact = self
            .documents
            .insert_artifact(
                NewArtifact {
                    source_url: payload.url.clone(),
                    content_type: content_type.clone(),
                    blob_uri: blob_uri.to_string(),
                    fetch_hash: fetch_hash.clone(),
                    run_id: payload.run_id,
                },
                fetched_at,
            )
            .await
            .map_err(|err| PipelineError::transient("record artifact").with_cause(err))?;

        info!(
            target: "rdp.stages",
            run_id = payload.run_id,
            artifact_id = artifact.id,
            fetch_hash = %fetch_hash,
            blob_uri = %blob_uri,
            "crawl stored"
        );

        self.emit_result(payload, &artifact, status_code, headers).await
    }
}

#[async_trait]
impl StageHandler for CrawlHandler {
    fn topic(&self) -> &'static str {
        topics::CRAWL_REQUEST
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), PipelineError> {
        let payload: CrawlRequest = decode_payload(envelope)?;
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
    use rdp_core::model::NewSource;
    use rdp_core::{RobotsMode, SourceKind};
    use rdp_store::MemoryStore;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(base_url: &str) -> (MemoryStore, MemoryBlobStore, MemoryBus, CrawlHandler, i64) {
        let store = MemoryStore::new();
        let blobs = MemoryBlobStore::new();
        let bus = MemoryBus::new();
        let source = store
            .create_source(
                NewSource {
                    name: "s".into(),
                    kind: SourceKind::Html,
                    base_url: base_url.to_string(),
                    auth_ref: None,
                    robots_mode: RobotsMode::Allow,
                    rate_limit: 600,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let handler = CrawlHandler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(blobs.clone()),
            Arc::new(bus.clone()),
            RunLifecycleEmitter::new(Arc::new(bus.clone())),
            Duration::from_secs(30),
        )
        .unwrap();
        (store, blobs, bus, handler, source.id)
    }

    fn request(url: &str, source_id: i64, run_id: i64) -> Envelope {
        Envelope::new(
            topics::CRAWL_REQUEST,
            &CrawlRequest {
                url: url.to_string(),
                source_id,
                run_id,
                crawl_request_id: "req-1".into(),
                trace_id: "trace".into(),
                subscription_id: 1,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn stores_bytes_and_emits_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<html><body><h1>T</h1></body></html>", "text/html"),
            )
            .mount(&server)
            .await;

        let (store, blobs, bus, handler, source_id) = setup(&server.uri()).await;
        let mut results = bus.subscribe(topics::CRAWL_RESULT, "t").await.unwrap();

        handler
            .handle(&request(&server.uri(), source_id, 11))
            .await
            .unwrap();

        let result: CrawlResult = results
            .next()
            .await
            .unwrap()
            .unwrap()
            .envelope
            .decode()
            .unwrap();
        assert_eq!(result.run_id, 11);
        assert_eq!(result.status_code, 200);
        assert!(result.content_type.starts_with("text/html"));

        let artifact = store.artifact_by_run(11).await.unwrap().unwrap();
        assert_eq!(artifact.blob_uri, result.blob_uri);
        assert_eq!(
            artifact.fetch_hash,
            canonical::sha256_hex(b"<html><body><h1>T</h1></body></html>")
        );
        // Raw bytes round-trip from the blob store.
        let stored = blobs.get(&artifact.blob_uri).await.unwrap();
        assert_eq!(stored, b"<html><body><h1>T</h1></body></html>");
        let key = artifact.blob_uri.strip_prefix("s3://artifacts/").unwrap();
        assert!(key.starts_with(&format!("raw/{source_id}/")));
        assert!(key.ends_with(&format!("{}.bin", artifact.fetch_hash)));
    }

    #[tokio::test]
    async fn http_error_fails_the_run_without_a_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (store, _blobs, bus, handler, source_id) = setup(&server.uri()).await;
        let mut results = bus.subscribe(topics::CRAWL_RESULT, "t").await.unwrap();
        let mut status = bus.subscribe(topics::RUN_STATUS, "t").await.unwrap();

        let err = handler
            .handle(&request(&server.uri(), source_id, 12))
            .await
            .unwrap_err();
        assert_eq!(err.class, rdp_error::ErrorClass::Source);
        assert!(err.to_string().contains("HTTP 500"));

        assert!(store.artifact_by_run(12).await.unwrap().is_none());
        assert_eq!(status.next().await.unwrap().unwrap().envelope.event, "run.started");
        assert_eq!(status.next().await.unwrap().unwrap().envelope.event, "run.failed");
        let pending = tokio::time::timeout(Duration::from_millis(20), results.next()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn redelivered_request_reuses_the_artifact() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<p>x</p>", "text/html"))
            .expect(1)
            .mount(&server)
            .await;

        let (store, _blobs, bus, handler, source_id) = setup(&server.uri()).await;
        let mut results = bus.subscribe(topics::CRAWL_RESULT, "t").await.unwrap();

        let envelope = request(&server.uri(), source_id, 13);
        handler.handle(&envelope).await.unwrap();
        handler.handle(&envelope).await.unwrap();

        // Two results, one artifact, one upstream fetch (mock expects 1).
        let first: CrawlResult = results.next().await.unwrap().unwrap().envelope.decode().unwrap();
        let second: CrawlResult = results.next().await.unwrap().unwrap().envelope.decode().unwrap();
        assert_eq!(first.artifact_id, second.artifact_id);
        let artifact = store.artifact_by_run(13).await.unwrap().unwrap();
        assert_eq!(artifact.id, first.artifact_id);
    }
}
