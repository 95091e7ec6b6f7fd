// SPDX-License-Identifier: MIT OR Apache-2.0
//! Object store gateway.
//!
//! Raw bytes, parsed snapshots, and diffs all live under deterministic keys
//! in a single bucket (see [`rdp_core::keys`]). The [`BlobStore`] trait keeps
//! stage workers oblivious to the backing store; [`S3BlobStore`] talks to any
//! S3-compatible endpoint, [`MemoryBlobStore`] backs the hermetic tests.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use rdp_core::keys::{BlobUri, InvalidBlobUri};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Errors surfaced by blob store adapters.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The requested object does not exist.
    #[error("blob not found: {uri}")]
    NotFound {
        /// Pointer that was requested.
        uri: String,
    },

    /// The pointer was not a valid `s3://bucket/key` URI.
    #[error(transparent)]
    InvalidUri(#[from] InvalidBlobUri),

    /// The backing store rejected the operation.
    #[error("object store error: {message}")]
    Backend {
        /// Backend detail.
        message: String,
    },
}

/// Put/get of immutable blobs under deterministic keys.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under a key in the pipeline bucket, returning the blob URI.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<BlobUri, BlobError>;

    /// Fetch the bytes behind a blob URI.
    async fn get(&self, uri: &str) -> Result<Vec<u8>, BlobError>;
}

/// S3-compatible adapter (AWS S3, MinIO, and friends).
#[derive(Clone)]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    /// Build a client against an S3-compatible endpoint.
    ///
    /// Path-style addressing is forced so that MinIO-style deployments work
    /// without wildcard DNS.
    pub async fn connect(endpoint: &str, region: &str, bucket: &str) -> Self {
        let base = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(endpoint)
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        let config = aws_sdk_s3::config::Builder::from(&base)
            .force_path_style(true)
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(config),
            bucket: bucket.to_string(),
        }
    }

    /// Create the bucket when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::Backend`] for failures other than the bucket
    /// already existing.
    pub async fn ensure_bucket(&self) -> Result<(), BlobError> {
        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!(target: "rdp.blob", bucket = %self.bucket, "bucket created");
                Ok(())
            }
            Err(err) => {
                let service = err.as_service_error();
                let already_there = service.is_some_and(|e| {
                    e.is_bucket_already_exists() || e.is_bucket_already_owned_by_you()
                });
                if already_there {
                    Ok(())
                } else {
                    Err(BlobError::Backend {
                        message: err.to_string(),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<BlobUri, BlobError> {
        let len = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(aws_sdk_s3::primitives::ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| BlobError::Backend {
                message: err.to_string(),
            })?;
        debug!(target: "rdp.blob", bucket = %self.bucket, key, len, "blob stored");
        Ok(BlobUri {
            bucket: self.bucket.clone(),
            key: key.to_string(),
        })
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, BlobError> {
        let parsed: BlobUri = uri.parse()?;
        let object = self
            .client
            .get_object()
            .bucket(&parsed.bucket)
            .key(&parsed.key)
            .send()
            .await
            .map_err(|err| {
                let missing = err
                    .as_service_error()
                    .is_some_and(aws_sdk_s3::operation::get_object::GetObjectError::is_no_such_key);
                if missing {
                    BlobError::NotFound {
                        uri: uri.to_string(),
                    }
                } else {
                    BlobError::Backend {
                        message: err.to_string(),
                    }
                }
            })?;
        let bytes = object
            .body
            .collect()
            .await
            .map_err(|err| BlobError::Backend {
                message: err.to_string(),
            })?;
        Ok(bytes.into_bytes().to_vec())
    }
}

/// In-memory adapter for tests and local runs.
#[derive(Clone)]
pub struct MemoryBlobStore {
    bucket: String,
    objects: Arc<Mutex<HashMap<String, (Vec<u8>, String)>>>,
}

impl MemoryBlobStore {
    /// Create an empty store over the standard artifacts bucket.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bucket: rdp_core::keys::ARTIFACTS_BUCKET.to_string(),
            objects: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Every stored key, sorted. Test helper.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let objects = self
            .objects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut keys: Vec<String> = objects.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<BlobUri, BlobError> {
        let mut objects = self
            .objects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        objects.insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(BlobUri {
            bucket: self.bucket.clone(),
            key: key.to_string(),
        })
    }

    async fn get(&self, uri: &str) -> Result<Vec<u8>, BlobError> {
        let parsed: BlobUri = uri.parse()?;
        let objects = self
            .objects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        objects
            .get(&parsed.key)
            .map(|(bytes, _)| bytes.clone())
            .ok_or(BlobError::NotFound {
                uri: uri.to_string(),
            })
    }
}
