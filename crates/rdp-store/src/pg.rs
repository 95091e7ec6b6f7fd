// SPDX-License-Identifier: MIT OR Apache-2.0
//! Postgres store adapter.
//!
//! Runtime-checked sqlx queries against the layout in `schema.sql`. The
//! scheduler claim and the outbox claim both use `FOR UPDATE SKIP LOCKED`
//! so that replicas split work without coordination; everything claimed in
//! one call commits (or rolls back) together.

use crate::{
    ClaimedRun, DocumentStore, NewArtifact, NextFireCandidate, OutboxClaim, OutboxStore, RunStore,
    SchedulerStore, SourceStore, StoreError, SubscriptionStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdp_core::event::topics;
use rdp_core::model::{NewSource, NewSubscription};
use rdp_core::{
    Artifact, DeliveryEvent, DeliveryStatus, Document, DocumentVersion, OutboxEntry, OutboxStatus,
    RobotsMode, Run, RunKind, RunStatus, Source, SourceKind, Subscription, SubscriptionStatus,
};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::Transaction;
use std::time::Duration;
use tracing::debug;

/// Idempotent DDL for the pipeline tables; applied by [`apply_schema`].
pub const SCHEMA: &str = include_str!("schema.sql");

/// Create the pipeline tables and indexes if they do not exist yet.
///
/// Development and test convenience; production deployments run their own
/// migrations.
///
/// # Errors
///
/// Returns the underlying database error.
pub async fn apply_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// Connect a pool with a connection-level statement timeout.
///
/// # Errors
///
/// Returns the underlying connection error.
pub async fn connect(
    url: &str,
    max_connections: u32,
    statement_timeout: Duration,
) -> Result<PgPool, sqlx::Error> {
    let timeout_ms = statement_timeout.as_millis();
    PgPoolOptions::new()
        .max_connections(max_connections)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query(&format!("SET statement_timeout = {timeout_ms}"))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(url)
        .await
}

/// Postgres implementation of every store port.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn schedule_one(
        tx: &mut Transaction<'static, Postgres>,
        subscription_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ClaimedRun, StoreError> {
        let run_id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO runs (subscription_id, run_kind, started_at, status)
            VALUES ($1, 'SCHEDULE', $2, 'PENDING')
            RETURNING id
            ",
        )
        .bind(subscription_id)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;

        let payload = serde_json::json!({
            "subscription_id": subscription_id,
            "run_id": run_id,
        });
        let outbox_id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO outbox (created_at, event_type, payload, status)
            VALUES ($1, $2, $3, 'PENDING')
            RETURNING id
            ",
        )
        .bind(now)
        .bind(topics::SUBS_SCHEDULE)
        .bind(&payload)
        .fetch_one(&mut **tx)
        .await?;

        Ok(ClaimedRun {
            subscription_id,
            run_id,
            outbox_id,
        })
    }
}

fn bad_status(entity: &str, value: &str) -> StoreError {
    StoreError::Corrupt {
        detail: format!("unknown {entity} status {value:?}"),
    }
}

type SubscriptionRow = (
    i64,
    i64,
    String,
    serde_json::Value,
    String,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

const SUBSCRIPTION_COLUMNS: &str = "id, source_id, jurisdiction, selectors, schedule, \
     last_run_at, next_run_at, status, created_at, updated_at";

fn subscription_from_row(row: SubscriptionRow) -> Result<Subscription, StoreError> {
    let status =
        SubscriptionStatus::parse(&row.7).ok_or_else(|| bad_status("subscription", &row.7))?;
    Ok(Subscription {
        id: row.0,
        source_id: row.1,
        jurisdiction: row.2,
        selectors: row.3,
        schedule: row.4,
        last_run_at: row.5,
        next_run_at: row.6,
        status,
        created_at: row.8,
        updated_at: row.9,
    })
}

type RunRow = (
    i64,
    Option<i64>,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    String,
    Option<String>,
);

const RUN_COLUMNS: &str = "id, subscription_id, run_kind, started_at, ended_at, status, error";

fn run_from_row(row: RunRow) -> Result<Run, StoreError> {
    let run_kind = RunKind::parse(&row.2).ok_or_else(|| bad_status("run_kind", &row.2))?;
    let status = RunStatus::parse(&row.5).ok_or_else(|| bad_status("run", &row.5))?;
    Ok(Run {
        id: row.0,
        subscription_id: row.1,
        run_kind,
        started_at: row.3,
        ended_at: row.4,
        status,
        error: row.6,
    })
}

type OutboxRow = (
    i64,
    DateTime<Utc>,
    String,
    serde_json::Value,
    String,
    i32,
    Option<DateTime<Utc>>,
);

const OUTBOX_COLUMNS: &str = "id, created_at, event_type, payload, status, attempts, published_at";

fn outbox_from_row(row: OutboxRow) -> Result<OutboxEntry, StoreError> {
    let status = OutboxStatus::parse(&row.4).ok_or_else(|| bad_status("outbox", &row.4))?;
    Ok(OutboxEntry {
        id: row.0,
        created_at: row.1,
        event_type: row.2,
        payload: row.3,
        status,
        attempts: row.5,
        published_at: row.6,
    })
}

type VersionRow = (
    i64,
    i64,
    String,
    Option<String>,
    String,
    DateTime<Utc>,
    i64,
);

const VERSION_COLUMNS: &str =
    "id, document_id, parsed_uri, diff_uri, content_hash, created_at, run_id";

fn version_from_row(row: VersionRow) -> DocumentVersion {
    DocumentVersion {
        id: row.0,
        document_id: row.1,
        parsed_uri: row.2,
        diff_uri: row.3,
        content_hash: row.4,
        created_at: row.5,
        run_id: row.6,
    }
}

type DocumentRow = (
    i64,
    i64,
    String,
    Option<String>,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

const DOCUMENT_COLUMNS: &str =
    "id, source_id, source_url, published_date, language, created_at, updated_at";

fn document_from_row(row: DocumentRow) -> Document {
    Document {
        id: row.0,
        source_id: row.1,
        source_url: row.2,
        published_date: row.3,
        language: row.4,
        created_at: row.5,
        updated_at: row.6,
    }
}

#[async_trait]
impl SchedulerStore for PgStore {
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ClaimedRun>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // The claim predicate excludes rows already stamped at this instant so
        // that re-running a tick on the same clock is a no-op.
        let due_ids = sqlx::query_scalar::<_, i64>(
            r"
            WITH due AS (
                SELECT id
                FROM subscriptions
                WHERE status = 'ACTIVE'
                  AND (next_run_at IS NULL OR next_run_at <= $1)
                  AND (last_run_at IS NULL OR last_run_at < $1)
                ORDER BY next_run_at NULLS FIRST
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            UPDATE subscriptions s
            SET last_run_at = $1,
                next_run_at = NULL,
                updated_at = $1
            FROM due
            WHERE s.id = due.id
            RETURNING s.id
            ",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(due_ids.len());
        for subscription_id in due_ids {
            claimed.push(Self::schedule_one(&mut tx, subscription_id, now).await?);
        }
        tx.commit().await?;

        debug!(target: "rdp.store", claimed = claimed.len(), "tick claim committed");
        Ok(claimed)
    }

    async fn run_now(
        &self,
        subscription_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ClaimedRun, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query_scalar::<_, i64>(
            r"
            UPDATE subscriptions
            SET last_run_at = $2, next_run_at = NULL, updated_at = $2
            WHERE id = $1
            RETURNING id
            ",
        )
        .bind(subscription_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        if updated.is_none() {
            return Err(StoreError::NotFound {
                entity: "subscription",
                id: subscription_id,
            });
        }
        let claim = Self::schedule_one(&mut tx, subscription_id, now).await?;
        tx.commit().await?;
        Ok(claim)
    }
}

#[async_trait]
impl SourceStore for PgStore {
    async fn create_source(
        &self,
        new: NewSource,
        now: DateTime<Utc>,
    ) -> Result<Source, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO sources (name, kind, base_url, auth_ref, robots_mode, rate_limit,
                                 enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $7)
            RETURNING id
            ",
        )
        .bind(&new.name)
        .bind(new.kind.as_str())
        .bind(&new.base_url)
        .bind(&new.auth_ref)
        .bind(new.robots_mode.as_str())
        .bind(i64::from(new.rate_limit))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(Source {
            id,
            name: new.name,
            kind: new.kind,
            base_url: new.base_url,
            auth_ref: new.auth_ref,
            robots_mode: new.robots_mode,
            rate_limit: new.rate_limit,
            enabled: true,
            created_at: now,
            updated_at: now,
        })
    }

    async fn source(&self, id: i64) -> Result<Option<Source>, StoreError> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                String,
                String,
                String,
                Option<String>,
                String,
                i64,
                bool,
                DateTime<Utc>,
                DateTime<Utc>,
            ),
        >(
            r"
            SELECT id, name, kind, base_url, auth_ref, robots_mode, rate_limit::bigint,
                   enabled, created_at, updated_at
            FROM sources
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            let kind = SourceKind::parse(&row.2).ok_or_else(|| bad_status("source kind", &row.2))?;
            let robots_mode =
                RobotsMode::parse(&row.5).ok_or_else(|| bad_status("robots mode", &row.5))?;
            Ok(Source {
                id: row.0,
                name: row.1,
                kind,
                base_url: row.3,
                auth_ref: row.4,
                robots_mode,
                rate_limit: u32::try_from(row.6).unwrap_or(u32::MAX),
                enabled: row.7,
                created_at: row.8,
                updated_at: row.9,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn create_subscription(
        &self,
        new: NewSubscription,
        now: DateTime<Utc>,
    ) -> Result<Subscription, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO subscriptions (source_id, jurisdiction, selectors, schedule,
                                       status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING id
            ",
        )
        .bind(new.source_id)
        .bind(&new.jurisdiction)
        .bind(&new.selectors)
        .bind(&new.schedule)
        .bind(new.status.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(Subscription {
            id,
            source_id: new.source_id,
            jurisdiction: new.jurisdiction,
            selectors: new.selectors,
            schedule: new.schedule,
            last_run_at: None,
            next_run_at: None,
            status: new.status,
            created_at: now,
            updated_at: now,
        })
    }

    async fn subscription(&self, id: i64) -> Result<Option<Subscription>, StoreError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(subscription_from_row).transpose()
    }

    async fn set_subscription_status(
        &self,
        id: i64,
        status: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, StoreError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r"
            UPDATE subscriptions
            SET status = $2, updated_at = $3
            WHERE id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(subscription_from_row).transpose()
    }

    async fn next_fire_candidates(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<NextFireCandidate>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String, DateTime<Utc>)>(
            r"
            SELECT id, schedule, COALESCE(last_run_at, created_at, $1) AS base
            FROM subscriptions
            WHERE next_run_at IS NULL AND status = 'ACTIVE'
            LIMIT $2
            ",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, schedule, base)| NextFireCandidate { id, schedule, base })
            .collect())
    }

    async fn set_next_run(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE subscriptions SET next_run_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_subscriptions(
        &self,
        status: Option<SubscriptionStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Subscription>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, SubscriptionRow>(&format!(
                    r"
                    SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
                    WHERE status = $1
                    ORDER BY id DESC LIMIT $2 OFFSET $3
                    "
                ))
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, SubscriptionRow>(&format!(
                    r"
                    SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
                    ORDER BY id DESC LIMIT $1 OFFSET $2
                    "
                ))
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(subscription_from_row).collect()
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn run(&self, id: i64) -> Result<Option<Run>, StoreError> {
        let row =
            sqlx::query_as::<_, RunRow>(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(run_from_row).transpose()
    }

    async fn transition_run(
        &self,
        id: i64,
        target: RunStatus,
        now: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<Option<Run>, StoreError> {
        // The WHERE clause keeps terminal states sticky; duplicate terminal
        // transitions and late RUNNING updates fall through to the re-read.
        sqlx::query(
            r"
            UPDATE runs
            SET status = $2,
                ended_at = CASE WHEN $2 IN ('COMPLETED', 'FAILED', 'CANCELLED')
                                THEN $3 ELSE ended_at END,
                error = CASE WHEN $2 = 'FAILED'
                             THEN COALESCE($4, 'unknown error') ELSE error END
            WHERE id = $1
              AND status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            ",
        )
        .bind(id)
        .bind(target.as_str())
        .bind(now)
        .bind(&error)
        .execute(&self.pool)
        .await?;
        self.run(id).await
    }

    async fn list_recent_runs(&self, limit: i64) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY id DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(run_from_row).collect()
    }
}

/// A dispatch batch holding row locks in an open transaction.
pub struct PgOutboxClaim {
    tx: Transaction<'static, Postgres>,
    entries: Vec<OutboxEntry>,
}

#[async_trait]
impl OutboxClaim for PgOutboxClaim {
    fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    async fn mark_published(&mut self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE outbox
            SET status = 'PUBLISHED', published_at = $2
            WHERE id = $1 AND status = 'PENDING'
            ",
        )
        .bind(id)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn mark_attempt(&mut self, id: i64, max_attempts: i32) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE outbox
            SET attempts = attempts + 1,
                status = CASE WHEN attempts + 1 >= $2 THEN 'FAILED' ELSE status END
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(max_attempts)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn claim_pending(&self, limit: i64) -> Result<Box<dyn OutboxClaim>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            r"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox
            WHERE status = 'PENDING'
            ORDER BY id
            FOR UPDATE SKIP LOCKED
            LIMIT $1
            "
        ))
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        let entries = rows
            .into_iter()
            .map(outbox_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Box::new(PgOutboxClaim { tx, entries }))
    }

    async fn outbox_for_run(&self, run_id: i64) -> Result<Option<OutboxEntry>, StoreError> {
        let probe = serde_json::json!({ "run_id": run_id });
        let row = sqlx::query_as::<_, OutboxRow>(&format!(
            r"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox
            WHERE payload @> $1
            ORDER BY id
            LIMIT 1
            "
        ))
        .bind(&probe)
        .fetch_optional(&self.pool)
        .await?;
        row.map(outbox_from_row).transpose()
    }

    async fn list_recent_outbox(&self, limit: i64) -> Result<Vec<OutboxEntry>, StoreError> {
        let rows = sqlx::query_as::<_, OutboxRow>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox ORDER BY id DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(outbox_from_row).collect()
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn insert_artifact(
        &self,
        new: NewArtifact,
        now: DateTime<Utc>,
    ) -> Result<Artifact, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO artifacts (source_url, content_type, blob_uri, fetch_hash,
                                   fetched_at, run_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            ",
        )
        .bind(&new.source_url)
        .bind(&new.content_type)
        .bind(&new.blob_uri)
        .bind(&new.fetch_hash)
        .bind(now)
        .bind(new.run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(Artifact {
            id,
            source_url: new.source_url,
            content_type: new.content_type,
            blob_uri: new.blob_uri,
            fetch_hash: new.fetch_hash,
            fetched_at: now,
            run_id: new.run_id,
        })
    }

    async fn artifact_by_run(&self, run_id: i64) -> Result<Option<Artifact>, StoreError> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                String,
                String,
                String,
                String,
                DateTime<Utc>,
                i64,
            ),
        >(
            r"
            SELECT id, source_url, content_type, blob_uri, fetch_hash, fetched_at, run_id
            FROM artifacts
            WHERE run_id = $1
            ORDER BY id
            LIMIT 1
            ",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Artifact {
            id: row.0,
            source_url: row.1,
            content_type: row.2,
            blob_uri: row.3,
            fetch_hash: row.4,
            fetched_at: row.5,
            run_id: row.6,
        }))
    }

    async fn upsert_document(
        &self,
        source_id: i64,
        source_url: &str,
        published_date: Option<String>,
        language: &str,
        now: DateTime<Utc>,
    ) -> Result<Document, StoreError> {
        let existing = sqlx::query_as::<_, DocumentRow>(&format!(
            r"
            UPDATE documents SET updated_at = $2
            WHERE source_url = $1
            RETURNING {DOCUMENT_COLUMNS}
            "
        ))
        .bind(source_url)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = existing {
            return Ok(document_from_row(row));
        }

        let inserted = sqlx::query_as::<_, DocumentRow>(&format!(
            r"
            INSERT INTO documents (source_id, source_url, published_date, language,
                                   created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (source_url) DO NOTHING
            RETURNING {DOCUMENT_COLUMNS}
            "
        ))
        .bind(source_id)
        .bind(source_url)
        .bind(&published_date)
        .bind(language)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = inserted {
            return Ok(document_from_row(row));
        }

        // Lost the unique-index race: another worker created the row between
        // our probe and insert. Retry the read.
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE source_url = $1"
        ))
        .bind(source_url)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::Conflict {
            detail: format!("document upsert race lost twice for {source_url}"),
        })?;
        Ok(document_from_row(row))
    }

    async fn document(&self, id: i64) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(document_from_row))
    }

    async fn insert_version(
        &self,
        document_id: i64,
        content_hash: &str,
        run_id: i64,
        now: DateTime<Utc>,
    ) -> Result<DocumentVersion, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO document_versions (document_id, parsed_uri, diff_uri,
                                           content_hash, created_at, run_id)
            VALUES ($1, '', NULL, $2, $3, $4)
            RETURNING id
            ",
        )
        .bind(document_id)
        .bind(content_hash)
        .bind(now)
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(DocumentVersion {
            id,
            document_id,
            parsed_uri: String::new(),
            diff_uri: None,
            content_hash: content_hash.to_string(),
            created_at: now,
            run_id,
        })
    }

    async fn set_parsed_uri(&self, version_id: i64, uri: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE document_versions SET parsed_uri = $2 WHERE id = $1")
            .bind(version_id)
            .bind(uri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_diff_uri(&self, version_id: i64, uri: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE document_versions SET diff_uri = $2 WHERE id = $1")
            .bind(version_id)
            .bind(uri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn version(&self, id: i64) -> Result<Option<DocumentVersion>, StoreError> {
        let row = sqlx::query_as::<_, VersionRow>(&format!(
            "SELECT {VERSION_COLUMNS} FROM document_versions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(version_from_row))
    }

    async fn version_by_run(&self, run_id: i64) -> Result<Option<DocumentVersion>, StoreError> {
        let row = sqlx::query_as::<_, VersionRow>(&format!(
            r"
            SELECT {VERSION_COLUMNS} FROM document_versions
            WHERE run_id = $1
            ORDER BY id
            LIMIT 1
            "
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(version_from_row))
    }

    async fn versions_of(&self, document_id: i64) -> Result<Vec<DocumentVersion>, StoreError> {
        let rows = sqlx::query_as::<_, VersionRow>(&format!(
            r"
            SELECT {VERSION_COLUMNS} FROM document_versions
            WHERE document_id = $1
            ORDER BY created_at, id
            "
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(version_from_row).collect())
    }

    async fn previous_version(
        &self,
        document_id: i64,
        version_id: i64,
    ) -> Result<Option<DocumentVersion>, StoreError> {
        let row = sqlx::query_as::<_, VersionRow>(&format!(
            r"
            SELECT {VERSION_COLUMNS} FROM document_versions
            WHERE document_id = $1 AND id <> $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "
        ))
        .bind(document_id)
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(version_from_row))
    }

    async fn insert_delivery(
        &self,
        doc_version_id: i64,
        artifact_type: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryEvent, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO delivery_events (doc_version_id, status, artifact_type,
                                         created_at, updated_at)
            VALUES ($1, 'PENDING', $2, $3, $3)
            RETURNING id
            ",
        )
        .bind(doc_version_id)
        .bind(artifact_type)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(DeliveryEvent {
            id,
            doc_version_id,
            status: DeliveryStatus::Pending,
            artifact_type: artifact_type.to_string(),
            delivery_uri: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn complete_delivery(
        &self,
        id: i64,
        delivery_uri: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE delivery_events
            SET status = 'COMPLETED', delivery_uri = $2, updated_at = $3
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(delivery_uri)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_delivery(
        &self,
        id: i64,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE delivery_events
            SET status = 'FAILED', error_message = $2, updated_at = $3
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(error_message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deliveries_for_version(
        &self,
        doc_version_id: i64,
    ) -> Result<Vec<DeliveryEvent>, StoreError> {
        let rows = sqlx::query_as::<
            _,
            (
                i64,
                i64,
                String,
                String,
                Option<String>,
                Option<String>,
                DateTime<Utc>,
                DateTime<Utc>,
            ),
        >(
            r"
            SELECT id, doc_version_id, status, artifact_type, delivery_uri,
                   error_message, created_at, updated_at
            FROM delivery_events
            WHERE doc_version_id = $1
            ORDER BY id
            ",
        )
        .bind(doc_version_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let status =
                    DeliveryStatus::parse(&row.2).ok_or_else(|| bad_status("delivery", &row.2))?;
                Ok(DeliveryEvent {
                    id: row.0,
                    doc_version_id: row.1,
                    status,
                    artifact_type: row.3,
                    delivery_uri: row.4,
                    error_message: row.5,
                    created_at: row.6,
                    updated_at: row.7,
                })
            })
            .collect()
    }
}
