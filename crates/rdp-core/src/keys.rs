// SPDX-License-Identifier: MIT OR Apache-2.0
//! Object-store key layout and blob URI handling.
//!
//! All pipeline blobs live in the `artifacts` bucket:
//! raw bytes under `raw/{source_id}/{yyyy}/{mm}/{dd}/{sha256}.bin`,
//! fetch metadata under `raw_meta/{sha256}.json`,
//! parsed snapshots under `parsed/{doc_id}/{version_id}.json`,
//! and diffs under `diffs/{doc_id}/{version_id}.json`.

use chrono::{DateTime, Datelike, Utc};
use std::fmt;
use std::str::FromStr;

/// Bucket holding every pipeline blob.
pub const ARTIFACTS_BUCKET: &str = "artifacts";

/// Key for raw fetched bytes.
#[must_use]
pub fn raw_key(source_id: i64, fetched_at: DateTime<Utc>, sha256: &str) -> String {
    format!(
        "raw/{source_id}/{:04}/{:02}/{:02}/{sha256}.bin",
        fetched_at.year(),
        fetched_at.month(),
        fetched_at.day()
    )
}

/// Key for fetch metadata (encoding, sizes, timestamps).
#[must_use]
pub fn raw_meta_key(sha256: &str) -> String {
    format!("raw_meta/{sha256}.json")
}

/// Key for a parsed document snapshot.
#[must_use]
pub fn parsed_key(doc_id: i64, version_id: i64) -> String {
    format!("parsed/{doc_id}/{version_id}.json")
}

/// Key for an RFC 6902 patch between consecutive versions.
#[must_use]
pub fn diff_key(doc_id: i64, version_id: i64) -> String {
    format!("diffs/{doc_id}/{version_id}.json")
}

/// A parsed `s3://bucket/key` pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUri {
    /// Bucket component.
    pub bucket: String,
    /// Object key component.
    pub key: String,
}

/// Error returned when a blob URI does not have the `s3://bucket/key` shape.
#[derive(Debug, thiserror::Error)]
#[error("invalid blob uri: {uri}")]
pub struct InvalidBlobUri {
    /// The offending input.
    pub uri: String,
}

impl BlobUri {
    /// Pointer into the [`ARTIFACTS_BUCKET`].
    #[must_use]
    pub fn artifacts(key: impl Into<String>) -> Self {
        Self {
            bucket: ARTIFACTS_BUCKET.to_string(),
            key: key.into(),
        }
    }
}

impl fmt::Display for BlobUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

impl FromStr for BlobUri {
    type Err = InvalidBlobUri;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("s3://").ok_or_else(|| InvalidBlobUri {
            uri: s.to_string(),
        })?;
        let (bucket, key) = rest.split_once('/').ok_or_else(|| InvalidBlobUri {
            uri: s.to_string(),
        })?;
        if bucket.is_empty() || key.is_empty() {
            return Err(InvalidBlobUri { uri: s.to_string() });
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}
