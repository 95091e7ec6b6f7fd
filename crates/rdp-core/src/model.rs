// SPDX-License-Identifier: MIT OR Apache-2.0
//! Domain records and status state machines.
//!
//! These mirror the relational tables: sources, subscriptions, runs, the
//! outbox, artifacts, documents, document versions, and delivery events.
//! Statuses serialize as upper-case strings, matching the stored TEXT values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a source serves and therefore how its payloads are parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Plain HTML pages.
    Html,
    /// Structured API responses.
    Api,
    /// PDF publications.
    Pdf,
}

impl SourceKind {
    /// Stored TEXT value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Api => "api",
            Self::Pdf => "pdf",
        }
    }

    /// Parse a stored TEXT value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "html" => Some(Self::Html),
            "api" => Some(Self::Api),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }
}

/// How robots.txt is honored when crawling a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotsMode {
    /// Crawl regardless of robots.txt.
    Allow,
    /// Never crawl when robots.txt forbids it.
    Disallow,
    /// Operator-supplied rules.
    Custom,
}

impl RobotsMode {
    /// Stored TEXT value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Disallow => "disallow",
            Self::Custom => "custom",
        }
    }

    /// Parse a stored TEXT value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "disallow" => Some(Self::Disallow),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// A crawlable origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Surrogate id.
    pub id: i64,
    /// Operator-facing name.
    pub name: String,
    /// Payload kind.
    pub kind: SourceKind,
    /// URL crawled by scheduled runs.
    pub base_url: String,
    /// Reference into external credential storage, when the source needs auth.
    pub auth_ref: Option<String>,
    /// robots.txt policy.
    pub robots_mode: RobotsMode,
    /// Requests per minute the crawler may issue against this source.
    pub rate_limit: u32,
    /// Disabled sources are never scheduled.
    pub enabled: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Fields required to register a new [`Source`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSource {
    /// Operator-facing name.
    pub name: String,
    /// Payload kind.
    pub kind: SourceKind,
    /// URL crawled by scheduled runs.
    pub base_url: String,
    /// Optional credential reference.
    #[serde(default)]
    pub auth_ref: Option<String>,
    /// robots.txt policy.
    pub robots_mode: RobotsMode,
    /// Requests per minute.
    pub rate_limit: u32,
}

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    /// Eligible for scheduling.
    Active,
    /// Temporarily suspended by an operator.
    Paused,
    /// Switched off; kept for history.
    Disabled,
    /// Parked after repeated failures.
    Error,
}

impl SubscriptionStatus {
    /// Stored TEXT value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Disabled => "DISABLED",
            Self::Error => "ERROR",
        }
    }

    /// Parse a stored TEXT value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "PAUSED" => Some(Self::Paused),
            "DISABLED" => Some(Self::Disabled),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recurring-crawl contract against a [`Source`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Surrogate id.
    pub id: i64,
    /// Owning source.
    pub source_id: i64,
    /// Jurisdiction tag used by downstream consumers.
    pub jurisdiction: String,
    /// Opaque content-selection rules.
    pub selectors: serde_json::Value,
    /// Cron expression driving the schedule.
    pub schedule: String,
    /// When the scheduler last claimed this subscription.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next due time; `None` until the next-fire computer fills it.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Lifecycle state.
    pub status: SubscriptionStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Fields required to register a new [`Subscription`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscription {
    /// Owning source.
    pub source_id: i64,
    /// Jurisdiction tag.
    pub jurisdiction: String,
    /// Opaque content-selection rules.
    pub selectors: serde_json::Value,
    /// Cron expression.
    pub schedule: String,
    /// Initial lifecycle state.
    pub status: SubscriptionStatus,
}

/// What a run was created to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunKind {
    /// A one-off crawl.
    Crawl,
    /// A one-off re-parse.
    Parse,
    /// A one-off normalization pass.
    Normalize,
    /// A full scheduled pipeline execution.
    Schedule,
}

impl RunKind {
    /// Stored TEXT value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crawl => "CRAWL",
            Self::Parse => "PARSE",
            Self::Normalize => "NORMALIZE",
            Self::Schedule => "SCHEDULE",
        }
    }

    /// Parse a stored TEXT value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CRAWL" => Some(Self::Crawl),
            "PARSE" => Some(Self::Parse),
            "NORMALIZE" => Some(Self::Normalize),
            "SCHEDULE" => Some(Self::Schedule),
            _ => None,
        }
    }
}

/// Aggregated state of one pipeline execution.
///
/// `PENDING → RUNNING → {COMPLETED, FAILED, CANCELLED}`; terminal states are
/// sticky and are the only ones that set `ended_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Created but no stage has started yet.
    Pending,
    /// At least one stage has executed.
    Running,
    /// The delivery stage finished.
    Completed,
    /// A stage failed; `error` holds the detail.
    Failed,
    /// Terminated by an operator.
    Cancelled,
}

impl RunStatus {
    /// Whether this status ends the run.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stored TEXT value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parse a stored TEXT value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Surrogate id.
    pub id: i64,
    /// Originating subscription; `None` once the subscription is deleted.
    pub subscription_id: Option<i64>,
    /// What the run was created to do.
    pub run_kind: RunKind,
    /// When the run row was created.
    pub started_at: DateTime<Utc>,
    /// Set only when the run reaches a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Aggregated state.
    pub status: RunStatus,
    /// Failure detail, set when the run fails.
    pub error: Option<String>,
}

/// Dispatch state of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Awaiting dispatch.
    Pending,
    /// Acknowledged by the bus; never re-emitted.
    Published,
    /// Gave up after the attempt cap.
    Failed,
}

impl OutboxStatus {
    /// Stored TEXT value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Published => "PUBLISHED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse a stored TEXT value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PUBLISHED" => Some(Self::Published),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A pending bus emission committed atomically with the state change that
/// caused it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Monotonic id; dispatch order.
    pub id: i64,
    /// When the row was enqueued.
    pub created_at: DateTime<Utc>,
    /// Bus topic the payload is published to.
    pub event_type: String,
    /// Opaque structured payload.
    pub payload: serde_json::Value,
    /// Dispatch state.
    pub status: OutboxStatus,
    /// Failed publish attempts so far.
    pub attempts: i32,
    /// Set when the row transitions to PUBLISHED.
    pub published_at: Option<DateTime<Utc>>,
}

/// Immutable record of one raw fetch of one URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Surrogate id.
    pub id: i64,
    /// URL that was fetched.
    pub source_url: String,
    /// Content type reported by the origin.
    pub content_type: String,
    /// Object-store pointer to the raw bytes.
    pub blob_uri: String,
    /// sha256 of the fetched body; uniquely identifies the bytes.
    pub fetch_hash: String,
    /// Fetch time.
    pub fetched_at: DateTime<Utc>,
    /// Run that produced this artifact.
    pub run_id: i64,
}

/// Logical identity of a crawled resource, unique per `source_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Surrogate id.
    pub id: i64,
    /// Source the document was first crawled from.
    pub source_id: i64,
    /// Unique crawl URL.
    pub source_url: String,
    /// Publication date extracted from the page, when present.
    pub published_date: Option<String>,
    /// Detected or defaulted language tag.
    pub language: String,
    /// Creation time (first successful parse).
    pub created_at: DateTime<Utc>,
    /// Bumped whenever a new version lands.
    pub updated_at: DateTime<Utc>,
}

/// A parsed snapshot of a document at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentVersion {
    /// Surrogate id.
    pub id: i64,
    /// Owning document.
    pub document_id: i64,
    /// Object-store pointer to the parsed JSON.
    pub parsed_uri: String,
    /// Object-store pointer to the RFC 6902 patch from the previous version;
    /// `None` for the first version of a document.
    pub diff_uri: Option<String>,
    /// sha256 of the canonicalized parsed JSON.
    pub content_hash: String,
    /// Creation time; versions of a document are totally ordered by this.
    pub created_at: DateTime<Utc>,
    /// Run that produced this version.
    pub run_id: i64,
}

/// Outcome of a downstream hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// Hand-off recorded, publish not yet acknowledged.
    Pending,
    /// Payload published downstream.
    Completed,
    /// Publish failed; `error_message` holds the detail.
    Failed,
}

impl DeliveryStatus {
    /// Stored TEXT value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse a stored TEXT value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Record of one downstream hand-off of one document version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEvent {
    /// Surrogate id.
    pub id: i64,
    /// Version that was handed off.
    pub doc_version_id: i64,
    /// Hand-off outcome.
    pub status: DeliveryStatus,
    /// What was delivered (`"parsed_document"` for pipeline deliveries).
    pub artifact_type: String,
    /// Where the delivered payload lives, once delivery completes.
    pub delivery_uri: Option<String>,
    /// Failure detail.
    pub error_message: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_terminality() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn statuses_round_trip_through_text() {
        for s in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Paused,
            SubscriptionStatus::Disabled,
            SubscriptionStatus::Error,
        ] {
            assert_eq!(SubscriptionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(OutboxStatus::parse("PUBLISHED"), Some(OutboxStatus::Published));
        assert_eq!(RunKind::parse("SCHEDULE"), Some(RunKind::Schedule));
        assert_eq!(RunStatus::parse("running"), None);
    }

    #[test]
    fn statuses_serialize_upper_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
        assert_eq!(
            serde_json::to_string(&OutboxStatus::Pending).unwrap(),
            "\"PENDING\""
        );
        assert_eq!(
            serde_json::to_string(&DeliveryStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
    }
}
