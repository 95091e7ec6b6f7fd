// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bus topics, the wire envelope, and typed event payloads.
//!
//! Every published message is wrapped as `{"event": "<topic>", "data": {…}}`.
//! Payload structs deliberately avoid `deny_unknown_fields` so that consumers
//! tolerate fields added by newer producers.

use crate::model::DeliveryStatus;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

/// Bus topic names. Stage workers subscribe by topic; the outbox dispatcher
/// publishes each row to the topic named by its `event_type`.
pub mod topics {
    /// Scheduler → J₀: a subscription is due.
    pub const SUBS_SCHEDULE: &str = "subs.schedule";
    /// J₀ → J₁: crawl this URL.
    pub const CRAWL_REQUEST: &str = "crawl.request";
    /// J₁ → J₂: raw bytes stored.
    pub const CRAWL_RESULT: &str = "crawl.result";
    /// J₂ → J₃: parsed snapshot stored.
    pub const PARSE_RESULT: &str = "parse.result";
    /// J₃ → J₄: diff computed.
    pub const VERSIONING_RESULT: &str = "versioning.result";
    /// J₄ → downstream subscribers: the parsed payload itself.
    pub const DELIVERY_REQUEST: &str = "delivery.request";
    /// J₄ → aggregator: hand-off recorded.
    pub const DELIVERY_RESULT: &str = "delivery.result";
    /// Run lifecycle events (`run.started`, `run.completed`, `run.failed`).
    pub const RUN_STATUS: &str = "run.status";

    /// Every pipeline topic, for stream provisioning.
    #[must_use]
    pub fn all() -> [&'static str; 8] {
        [
            SUBS_SCHEDULE,
            CRAWL_REQUEST,
            CRAWL_RESULT,
            PARSE_RESULT,
            VERSIONING_RESULT,
            DELIVERY_REQUEST,
            DELIVERY_RESULT,
            RUN_STATUS,
        ]
    }
}

/// Run lifecycle event names carried in the envelope on [`topics::RUN_STATUS`].
pub mod lifecycle {
    /// A stage executed for the run for the first time.
    pub const RUN_STARTED: &str = "run.started";
    /// The delivery stage finished.
    pub const RUN_COMPLETED: &str = "run.completed";
    /// A stage failed; the pipeline halts for this run.
    pub const RUN_FAILED: &str = "run.failed";
}

/// Envelope wrapping every message on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Event name; equals the topic except for run lifecycle events.
    pub event: String,
    /// Typed payload, kept opaque until a consumer decodes it.
    pub data: serde_json::Value,
}

impl Envelope {
    /// Wrap a payload under the given event name.
    ///
    /// # Errors
    ///
    /// Returns the underlying serialization error if the payload cannot be
    /// represented as JSON.
    pub fn new<T: Serialize>(event: &str, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event: event.to_string(),
            data: serde_json::to_value(data)?,
        })
    }

    /// Decode the payload into a typed event, tolerating unknown fields.
    ///
    /// # Errors
    ///
    /// Returns the underlying deserialization error when required fields are
    /// missing or of the wrong shape.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    /// Serialize the envelope to its wire bytes.
    ///
    /// # Errors
    ///
    /// Returns the underlying serialization error.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse an envelope from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns the underlying deserialization error for non-JSON input or a
    /// missing `event`/`data` pair.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Payload of [`topics::SUBS_SCHEDULE`], written by the scheduler tick into
/// the outbox. The trace id is minted by J₀ when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionScheduled {
    /// Subscription that came due.
    pub subscription_id: i64,
    /// Run created for this execution.
    pub run_id: i64,
    /// Trace id, when a producer already minted one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Payload of [`topics::CRAWL_REQUEST`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRequest {
    /// URL to fetch.
    pub url: String,
    /// Source the URL belongs to.
    pub source_id: i64,
    /// Run this crawl belongs to.
    pub run_id: i64,
    /// Fresh id for this crawl request; stable across redeliveries.
    pub crawl_request_id: String,
    /// Trace id of the run.
    pub trace_id: String,
    /// Subscription that scheduled the crawl.
    pub subscription_id: i64,
}

/// Payload of [`topics::CRAWL_RESULT`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    /// Artifact row recording the fetch.
    pub artifact_id: i64,
    /// Object-store pointer to the raw bytes.
    pub blob_uri: String,
    /// Content type reported by the origin.
    pub content_type: String,
    /// HTTP status of the fetch.
    pub status_code: u16,
    /// Response headers, for encoding detection downstream.
    pub headers: BTreeMap<String, String>,
    /// URL that was fetched.
    pub source_url: String,
    /// Source the URL belongs to.
    pub source_id: i64,
    /// Run this crawl belongs to.
    pub run_id: i64,
    /// Trace id of the run.
    pub trace_id: String,
}

/// Payload of [`topics::PARSE_RESULT`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseResult {
    /// Document the snapshot belongs to.
    pub doc_id: i64,
    /// Version created by this parse.
    pub version_id: i64,
    /// Object-store pointer to the parsed JSON.
    pub parsed_uri: String,
    /// Number of extracted sections.
    pub section_count: usize,
    /// URL the document was crawled from.
    pub source_url: String,
    /// Run this parse belongs to.
    pub run_id: i64,
    /// Trace id of the run.
    pub trace_id: String,
}

/// Payload of [`topics::VERSIONING_RESULT`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersioningResult {
    /// Document the version belongs to.
    pub doc_id: i64,
    /// Version that was diffed.
    pub version_id: i64,
    /// Pointer to the RFC 6902 patch; `None` for a first version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_uri: Option<String>,
    /// Run this versioning belongs to.
    pub run_id: i64,
    /// Trace id of the run.
    pub trace_id: String,
}

/// Payload of [`topics::DELIVERY_REQUEST`]: the parsed document itself, for
/// downstream subscribers (who dedupe by content hash).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRequest {
    /// Document the payload belongs to.
    pub doc_id: i64,
    /// Delivered version.
    pub version_id: i64,
    /// The full parsed document.
    pub parsed_document: serde_json::Value,
    /// Run this delivery belongs to.
    pub run_id: i64,
    /// Trace id of the run.
    pub trace_id: String,
}

/// Summary carried in [`DeliveryResult::result`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    /// Delivery event row recording the hand-off.
    pub delivery_event_id: i64,
    /// Number of sections in the delivered payload.
    pub sections_delivered: usize,
}

/// Payload of [`topics::DELIVERY_RESULT`], the pipeline's terminal event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    /// Document the delivery belongs to.
    pub doc_id: i64,
    /// Delivered version.
    pub version_id: i64,
    /// Hand-off outcome.
    pub status: DeliveryStatus,
    /// Delivery summary.
    pub result: DeliveryOutcome,
    /// Run this delivery belongs to.
    pub run_id: i64,
    /// Trace id of the run.
    pub trace_id: String,
}

/// Payload of run lifecycle events on [`topics::RUN_STATUS`]. The lifecycle
/// kind travels in the envelope's `event` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLifecycle {
    /// Run the event belongs to.
    pub run_id: i64,
    /// Trace id of the run.
    pub trace_id: String,
    /// Failure message, on `run.failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Failure backtrace, on `run.failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_traceback: Option<String>,
    /// Stage result summary, on `run.completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}
