// SPDX-License-Identifier: MIT OR Apache-2.0
//! Store ports for the regulatory-document pipeline.
//!
//! Each trait captures one aggregate of the relational model, with the
//! cross-aggregate atomic claim of the scheduler tick expressed as a single
//! operation so adapters can make it transactional. Two adapters ship:
//! [`PgStore`] (Postgres via sqlx, row locks with skip-locked) and
//! [`MemoryStore`] (single-mutex state for hermetic tests and local runs).

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// In-memory adapter.
pub mod memory;
/// Postgres adapter.
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdp_core::model::{NewSource, NewSubscription};
use rdp_core::{
    Artifact, DeliveryEvent, Document, DocumentVersion, OutboxEntry, Run, RunStatus, Source,
    Subscription, SubscriptionStatus,
};

/// Errors surfaced by store adapters.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error")]
    Database(#[from] sqlx::Error),

    /// A referenced row does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Which aggregate.
        entity: &'static str,
        /// Which row.
        id: i64,
    },

    /// A unique constraint rejected the write.
    #[error("conflict: {detail}")]
    Conflict {
        /// Constraint detail.
        detail: String,
    },

    /// A stored value could not be mapped back into the domain model.
    #[error("corrupt row: {detail}")]
    Corrupt {
        /// What failed to decode.
        detail: String,
    },
}

/// One subscription claimed by a scheduler tick, with the run and outbox row
/// created in the same transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedRun {
    /// Claimed subscription.
    pub subscription_id: i64,
    /// PENDING run created for the execution.
    pub run_id: i64,
    /// `subs.schedule` outbox row committed with the run.
    pub outbox_id: i64,
}

/// A subscription awaiting a `next_run_at` value.
#[derive(Debug, Clone)]
pub struct NextFireCandidate {
    /// Subscription id.
    pub id: i64,
    /// Cron expression.
    pub schedule: String,
    /// Base instant the next occurrence is computed after
    /// (`COALESCE(last_run_at, created_at, now)`).
    pub base: DateTime<Utc>,
}

/// The scheduler tick's atomic claim. This is the only cross-process mutex in
/// the system: adapters must guarantee that two concurrent claims never hand
/// out the same subscription.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    /// Claim up to `limit` due subscriptions: stamp `last_run_at`, clear
    /// `next_run_at`, create a PENDING run, and enqueue the `subs.schedule`
    /// outbox row — atomically per batch.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ClaimedRun>, StoreError>;

    /// The single-subscription twin of [`claim_due`](Self::claim_due),
    /// ignoring due times (operator "run now").
    async fn run_now(
        &self,
        subscription_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ClaimedRun, StoreError>;
}

/// Source registry.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Register a new source.
    async fn create_source(&self, new: NewSource, now: DateTime<Utc>)
    -> Result<Source, StoreError>;

    /// Fetch a source by id.
    async fn source(&self, id: i64) -> Result<Option<Source>, StoreError>;
}

/// Mutable subscription state and next-fire bookkeeping.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Register a new subscription.
    async fn create_subscription(
        &self,
        new: NewSubscription,
        now: DateTime<Utc>,
    ) -> Result<Subscription, StoreError>;

    /// Fetch a subscription by id.
    async fn subscription(&self, id: i64) -> Result<Option<Subscription>, StoreError>;

    /// Set the lifecycle status (enable / disable / pause / park).
    async fn set_subscription_status(
        &self,
        id: i64,
        status: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, StoreError>;

    /// ACTIVE subscriptions whose `next_run_at` is unset.
    async fn next_fire_candidates(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<NextFireCandidate>, StoreError>;

    /// Write a computed `next_run_at`. Writing the same instant twice is a
    /// no-op, which makes the next-fire computer idempotent.
    async fn set_next_run(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Recent subscriptions, optionally filtered by status.
    async fn list_subscriptions(
        &self,
        status: Option<SubscriptionStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Subscription>, StoreError>;
}

/// Per-run aggregated status.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Fetch a run by id.
    async fn run(&self, id: i64) -> Result<Option<Run>, StoreError>;

    /// Apply a lifecycle transition. Terminal states are sticky: once a run
    /// is COMPLETED, FAILED, or CANCELLED, further transitions (including a
    /// duplicate of the same terminal state) are no-ops. RUNNING after a
    /// terminal state is ignored. Terminal transitions set `ended_at`; a
    /// failure stores `error`.
    async fn transition_run(
        &self,
        id: i64,
        target: RunStatus,
        now: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<Option<Run>, StoreError>;

    /// Most recent runs, newest first.
    async fn list_recent_runs(&self, limit: i64) -> Result<Vec<Run>, StoreError>;
}

/// A batch of outbox rows claimed for dispatch. Rows stay locked (skip-locked
/// for concurrent dispatchers) until [`commit`](OutboxClaim::commit).
#[async_trait]
pub trait OutboxClaim: Send {
    /// The claimed rows, in id order.
    fn entries(&self) -> &[OutboxEntry];

    /// Mark a row PUBLISHED with the given acknowledgement time.
    async fn mark_published(&mut self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Record a failed publish attempt; the row moves to FAILED once its
    /// attempt count reaches `max_attempts`, otherwise it stays PENDING and
    /// is re-selected by a later dispatch.
    async fn mark_attempt(&mut self, id: i64, max_attempts: i32) -> Result<(), StoreError>;

    /// Commit the batch, releasing the row locks.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Append-only outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` PENDING rows in id order for exclusive dispatch.
    async fn claim_pending(&self, limit: i64) -> Result<Box<dyn OutboxClaim>, StoreError>;

    /// The outbox row whose payload references the given run, if any.
    async fn outbox_for_run(&self, run_id: i64) -> Result<Option<OutboxEntry>, StoreError>;

    /// Most recent rows, newest first.
    async fn list_recent_outbox(&self, limit: i64) -> Result<Vec<OutboxEntry>, StoreError>;
}

/// Fields of a new [`Artifact`] row.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    /// URL that was fetched.
    pub source_url: String,
    /// Content type reported by the origin.
    pub content_type: String,
    /// Object-store pointer to the raw bytes.
    pub blob_uri: String,
    /// sha256 of the fetched body.
    pub fetch_hash: String,
    /// Run that produced the artifact.
    pub run_id: i64,
}

/// Immutable result records: artifacts, documents, versions, deliveries.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Record a raw fetch. Artifacts are write-once.
    async fn insert_artifact(
        &self,
        new: NewArtifact,
        now: DateTime<Utc>,
    ) -> Result<Artifact, StoreError>;

    /// The artifact produced by a run, if any. Used for replay dedupe and
    /// the audit trail.
    async fn artifact_by_run(&self, run_id: i64) -> Result<Option<Artifact>, StoreError>;

    /// Get or create the document identified by `source_url`. Concurrent
    /// creators race on the unique index; the loser retries the read. An
    /// existing document only has its `updated_at` bumped.
    async fn upsert_document(
        &self,
        source_id: i64,
        source_url: &str,
        published_date: Option<String>,
        language: &str,
        now: DateTime<Utc>,
    ) -> Result<Document, StoreError>;

    /// Fetch a document by id.
    async fn document(&self, id: i64) -> Result<Option<Document>, StoreError>;

    /// Insert a new version row; `parsed_uri` is written back after upload.
    async fn insert_version(
        &self,
        document_id: i64,
        content_hash: &str,
        run_id: i64,
        now: DateTime<Utc>,
    ) -> Result<DocumentVersion, StoreError>;

    /// Write the uploaded parsed-JSON pointer back to the version row.
    async fn set_parsed_uri(&self, version_id: i64, uri: &str) -> Result<(), StoreError>;

    /// Write the uploaded diff pointer to the version row.
    async fn set_diff_uri(&self, version_id: i64, uri: &str) -> Result<(), StoreError>;

    /// Fetch a version by id.
    async fn version(&self, id: i64) -> Result<Option<DocumentVersion>, StoreError>;

    /// The version produced by a run, if any. Used for replay dedupe.
    async fn version_by_run(&self, run_id: i64) -> Result<Option<DocumentVersion>, StoreError>;

    /// All versions of a document, oldest first.
    async fn versions_of(&self, document_id: i64) -> Result<Vec<DocumentVersion>, StoreError>;

    /// The latest version of the document other than `version_id`
    /// (highest `created_at`, ties broken by id).
    async fn previous_version(
        &self,
        document_id: i64,
        version_id: i64,
    ) -> Result<Option<DocumentVersion>, StoreError>;

    /// Record a PENDING downstream hand-off.
    async fn insert_delivery(
        &self,
        doc_version_id: i64,
        artifact_type: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryEvent, StoreError>;

    /// Mark a hand-off COMPLETED.
    async fn complete_delivery(
        &self,
        id: i64,
        delivery_uri: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Mark a hand-off FAILED.
    async fn fail_delivery(
        &self,
        id: i64,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// All hand-offs recorded for a version.
    async fn deliveries_for_version(
        &self,
        doc_version_id: i64,
    ) -> Result<Vec<DeliveryEvent>, StoreError>;
}
