// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory store adapter.
//!
//! Backs every port with a single mutex-guarded state, which makes the
//! scheduler claim atomic the same way the Postgres adapter's transaction
//! does. Used by the hermetic test suites and local runs without a database.

use crate::{
    ClaimedRun, NewArtifact, NextFireCandidate, OutboxClaim, OutboxStore, RunStore, SchedulerStore,
    SourceStore, StoreError, SubscriptionStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdp_core::event::topics;
use rdp_core::model::{NewSource, NewSubscription};
use rdp_core::{
    Artifact, DeliveryEvent, DeliveryStatus, Document, DocumentVersion, OutboxEntry, OutboxStatus,
    Run, RunKind, RunStatus, Source, Subscription, SubscriptionStatus,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    next_id: HashMap<&'static str, i64>,
    sources: BTreeMap<i64, Source>,
    subscriptions: BTreeMap<i64, Subscription>,
    runs: BTreeMap<i64, Run>,
    outbox: BTreeMap<i64, OutboxEntry>,
    outbox_locks: HashSet<i64>,
    artifacts: BTreeMap<i64, Artifact>,
    documents: BTreeMap<i64, Document>,
    documents_by_url: HashMap<String, i64>,
    versions: BTreeMap<i64, DocumentVersion>,
    deliveries: BTreeMap<i64, DeliveryEvent>,
}

impl Inner {
    fn next_id(&mut self, table: &'static str) -> i64 {
        let id = self.next_id.entry(table).or_insert(0);
        *id += 1;
        *id
    }

    fn enqueue_outbox(
        &mut self,
        event_type: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> i64 {
        let id = self.next_id("outbox");
        self.outbox.insert(
            id,
            OutboxEntry {
                id,
                created_at: now,
                event_type: event_type.to_string(),
                payload,
                status: OutboxStatus::Pending,
                attempts: 0,
                published_at: None,
            },
        );
        id
    }

    fn schedule_one(&mut self, subscription_id: i64, now: DateTime<Utc>) -> ClaimedRun {
        let run_id = self.next_id("runs");
        self.runs.insert(
            run_id,
            Run {
                id: run_id,
                subscription_id: Some(subscription_id),
                run_kind: RunKind::Schedule,
                started_at: now,
                ended_at: None,
                status: RunStatus::Pending,
                error: None,
            },
        );
        let outbox_id = self.enqueue_outbox(
            topics::SUBS_SCHEDULE,
            serde_json::json!({"subscription_id": subscription_id, "run_id": run_id}),
            now,
        );
        ClaimedRun {
            subscription_id,
            run_id,
            outbox_id,
        }
    }
}

/// Mutex-guarded in-memory implementation of every store port.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned mutex means a panicked test thread; propagate the state.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl SchedulerStore for MemoryStore {
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ClaimedRun>, StoreError> {
        let mut inner = self.lock();
        let mut due: Vec<(Option<DateTime<Utc>>, i64)> = inner
            .subscriptions
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Active
                    && s.next_run_at.is_none_or(|at| at <= now)
                    && s.last_run_at.is_none_or(|at| at < now)
            })
            .map(|s| (s.next_run_at, s.id))
            .collect();
        // next_run_at NULLS FIRST, then id for stable order.
        due.sort_by_key(|(at, id)| (at.is_some(), *at, *id));
        due.truncate(usize::try_from(limit.max(0)).unwrap_or(0));

        let mut claimed = Vec::with_capacity(due.len());
        for (_, sub_id) in due {
            if let Some(sub) = inner.subscriptions.get_mut(&sub_id) {
                sub.last_run_at = Some(now);
                sub.next_run_at = None;
                sub.updated_at = now;
            }
            claimed.push(inner.schedule_one(sub_id, now));
        }
        Ok(claimed)
    }

    async fn run_now(
        &self,
        subscription_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ClaimedRun, StoreError> {
        let mut inner = self.lock();
        let sub = inner
            .subscriptions
            .get_mut(&subscription_id)
            .ok_or(StoreError::NotFound {
                entity: "subscription",
                id: subscription_id,
            })?;
        sub.last_run_at = Some(now);
        sub.next_run_at = None;
        sub.updated_at = now;
        Ok(inner.schedule_one(subscription_id, now))
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn create_source(
        &self,
        new: NewSource,
        now: DateTime<Utc>,
    ) -> Result<Source, StoreError> {
        let mut inner = self.lock();
        let id = inner.next_id("sources");
        let source = Source {
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
        };
        inner.sources.insert(id, source.clone());
        Ok(source)
    }

    async fn source(&self, id: i64) -> Result<Option<Source>, StoreError> {
        Ok(self.lock().sources.get(&id).cloned())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn create_subscription(
        &self,
        new: NewSubscription,
        now: DateTime<Utc>,
    ) -> Result<Subscription, StoreError> {
        let mut inner = self.lock();
        let id = inner.next_id("subscriptions");
        let sub = Subscription {
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
        };
        inner.subscriptions.insert(id, sub.clone());
        Ok(sub)
    }

    async fn subscription(&self, id: i64) -> Result<Option<Subscription>, StoreError> {
        Ok(self.lock().subscriptions.get(&id).cloned())
    }

    async fn set_subscription_status(
        &self,
        id: i64,
        status: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, StoreError> {
        let mut inner = self.lock();
        Ok(inner.subscriptions.get_mut(&id).map(|sub| {
            sub.status = status;
            sub.updated_at = now;
            sub.clone()
        }))
    }

    async fn next_fire_candidates(
        &self,
        _now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<NextFireCandidate>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active && s.next_run_at.is_none())
            .take(usize::try_from(limit.max(0)).unwrap_or(0))
            .map(|s| NextFireCandidate {
                id: s.id,
                schedule: s.schedule.clone(),
                base: s.last_run_at.unwrap_or(s.created_at),
            })
            .collect())
    }

    async fn set_next_run(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(sub) = inner.subscriptions.get_mut(&id) {
            sub.next_run_at = Some(at);
        }
        Ok(())
    }

    async fn list_subscriptions(
        &self,
        status: Option<SubscriptionStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Subscription>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .subscriptions
            .values()
            .rev()
            .filter(|s| status.is_none_or(|st| s.status == st))
            .skip(usize::try_from(offset.max(0)).unwrap_or(0))
            .take(usize::try_from(limit.max(0)).unwrap_or(0))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn run(&self, id: i64) -> Result<Option<Run>, StoreError> {
        Ok(self.lock().runs.get(&id).cloned())
    }

    async fn transition_run(
        &self,
        id: i64,
        target: RunStatus,
        now: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<Option<Run>, StoreError> {
        let mut inner = self.lock();
        let Some(run) = inner.runs.get_mut(&id) else {
            return Ok(None);
        };
        if run.status.is_terminal() {
            return Ok(Some(run.clone()));
        }
        match target {
            RunStatus::Running => {
                run.status = RunStatus::Running;
            }
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => {
                run.status = target;
                run.ended_at = Some(now);
                if target == RunStatus::Failed {
                    run.error = error.or_else(|| Some("unknown error".to_string()));
                }
            }
            RunStatus::Pending => {}
        }
        Ok(Some(run.clone()))
    }

    async fn list_recent_runs(&self, limit: i64) -> Result<Vec<Run>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .runs
            .values()
            .rev()
            .take(usize::try_from(limit.max(0)).unwrap_or(0))
            .cloned()
            .collect())
    }
}

/// A claimed batch of outbox rows. Locks are held in the shared state and
/// released on commit (or on drop, for crash symmetry with row locks).
pub struct MemoryOutboxClaim {
    inner: Arc<Mutex<Inner>>,
    entries: Vec<OutboxEntry>,
    locked: Vec<i64>,
}

impl MemoryOutboxClaim {
    fn release(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            for id in self.locked.drain(..) {
                inner.outbox_locks.remove(&id);
            }
        }
    }
}

impl Drop for MemoryOutboxClaim {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl OutboxClaim for MemoryOutboxClaim {
    fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    async fn mark_published(&mut self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(entry) = inner.outbox.get_mut(&id) {
            if entry.status == OutboxStatus::Pending {
                entry.status = OutboxStatus::Published;
                entry.published_at = Some(at);
            }
        }
        Ok(())
    }

    async fn mark_attempt(&mut self, id: i64, max_attempts: i32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(entry) = inner.outbox.get_mut(&id) {
            entry.attempts += 1;
            if entry.attempts >= max_attempts {
                entry.status = OutboxStatus::Failed;
            }
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.release();
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn claim_pending(&self, limit: i64) -> Result<Box<dyn OutboxClaim>, StoreError> {
        let mut inner = self.lock();
        let ids: Vec<i64> = inner
            .outbox
            .values()
            .filter(|e| e.status == OutboxStatus::Pending && !inner.outbox_locks.contains(&e.id))
            .take(usize::try_from(limit.max(0)).unwrap_or(0))
            .map(|e| e.id)
            .collect();
        let mut entries = Vec::with_capacity(ids.len());
        for id in &ids {
            inner.outbox_locks.insert(*id);
            entries.push(inner.outbox[id].clone());
        }
        Ok(Box::new(MemoryOutboxClaim {
            inner: Arc::clone(&self.inner),
            entries,
            locked: ids,
        }))
    }

    async fn outbox_for_run(&self, run_id: i64) -> Result<Option<OutboxEntry>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .outbox
            .values()
            .find(|e| e.payload.get("run_id").and_then(serde_json::Value::as_i64) == Some(run_id))
            .cloned())
    }

    async fn list_recent_outbox(&self, limit: i64) -> Result<Vec<OutboxEntry>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .outbox
            .values()
            .rev()
            .take(usize::try_from(limit.max(0)).unwrap_or(0))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl crate::DocumentStore for MemoryStore {
    async fn insert_artifact(
        &self,
        new: NewArtifact,
        now: DateTime<Utc>,
    ) -> Result<Artifact, StoreError> {
        let mut inner = self.lock();
        let id = inner.next_id("artifacts");
        let artifact = Artifact {
            id,
            source_url: new.source_url,
            content_type: new.content_type,
            blob_uri: new.blob_uri,
            fetch_hash: new.fetch_hash,
            fetched_at: now,
            run_id: new.run_id,
        };
        inner.artifacts.insert(id, artifact.clone());
        Ok(artifact)
    }

    async fn artifact_by_run(&self, run_id: i64) -> Result<Option<Artifact>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .artifacts
            .values()
            .find(|a| a.run_id == run_id)
            .cloned())
    }

    async fn upsert_document(
        &self,
        source_id: i64,
        source_url: &str,
        published_date: Option<String>,
        language: &str,
        now: DateTime<Utc>,
    ) -> Result<Document, StoreError> {
        let mut inner = self.lock();
        if let Some(id) = inner.documents_by_url.get(source_url).copied() {
            let doc = inner
                .documents
                .get_mut(&id)
                .ok_or(StoreError::Corrupt {
                    detail: format!("document index points at missing row {id}"),
                })?;
            doc.updated_at = now;
            return Ok(doc.clone());
        }
        let id = inner.next_id("documents");
        let doc = Document {
            id,
            source_id,
            source_url: source_url.to_string(),
            published_date,
            language: language.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.documents.insert(id, doc.clone());
        inner.documents_by_url.insert(source_url.to_string(), id);
        Ok(doc)
    }

    async fn document(&self, id: i64) -> Result<Option<Document>, StoreError> {
        Ok(self.lock().documents.get(&id).cloned())
    }

    async fn insert_version(
        &self,
        document_id: i64,
        content_hash: &str,
        run_id: i64,
        now: DateTime<Utc>,
    ) -> Result<DocumentVersion, StoreError> {
        let mut inner = self.lock();
        if !inner.documents.contains_key(&document_id) {
            return Err(StoreError::NotFound {
                entity: "document",
                id: document_id,
            });
        }
        let id = inner.next_id("versions");
        let version = DocumentVersion {
            id,
            document_id,
            parsed_uri: String::new(),
            diff_uri: None,
            content_hash: content_hash.to_string(),
            created_at: now,
            run_id,
        };
        inner.versions.insert(id, version.clone());
        Ok(version)
    }

    async fn set_parsed_uri(&self, version_id: i64, uri: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let version = inner.versions.get_mut(&version_id).ok_or(StoreError::NotFound {
            entity: "document_version",
            id: version_id,
        })?;
        version.parsed_uri = uri.to_string();
        Ok(())
    }

    async fn set_diff_uri(&self, version_id: i64, uri: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let version = inner.versions.get_mut(&version_id).ok_or(StoreError::NotFound {
            entity: "document_version",
            id: version_id,
        })?;
        version.diff_uri = Some(uri.to_string());
        Ok(())
    }

    async fn version(&self, id: i64) -> Result<Option<DocumentVersion>, StoreError> {
        Ok(self.lock().versions.get(&id).cloned())
    }

    async fn version_by_run(&self, run_id: i64) -> Result<Option<DocumentVersion>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .versions
            .values()
            .find(|v| v.run_id == run_id)
            .cloned())
    }

    async fn versions_of(&self, document_id: i64) -> Result<Vec<DocumentVersion>, StoreError> {
        let inner = self.lock();
        let mut versions: Vec<DocumentVersion> = inner
            .versions
            .values()
            .filter(|v| v.document_id == document_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| (v.created_at, v.id));
        Ok(versions)
    }

    async fn previous_version(
        &self,
        document_id: i64,
        version_id: i64,
    ) -> Result<Option<DocumentVersion>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .versions
            .values()
            .filter(|v| v.document_id == document_id && v.id != version_id)
            .max_by_key(|v| (v.created_at, v.id))
            .cloned())
    }

    async fn insert_delivery(
        &self,
        doc_version_id: i64,
        artifact_type: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryEvent, StoreError> {
        let mut inner = self.lock();
        let id = inner.next_id("deliveries");
        let delivery = DeliveryEvent {
            id,
            doc_version_id,
            status: DeliveryStatus::Pending,
            artifact_type: artifact_type.to_string(),
            delivery_uri: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        inner.deliveries.insert(id, delivery.clone());
        Ok(delivery)
    }

    async fn complete_delivery(
        &self,
        id: i64,
        delivery_uri: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let delivery = inner.deliveries.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "delivery_event",
            id,
        })?;
        delivery.status = DeliveryStatus::Completed;
        delivery.delivery_uri = Some(delivery_uri.to_string());
        delivery.updated_at = now;
        Ok(())
    }

    async fn fail_delivery(
        &self,
        id: i64,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let delivery = inner.deliveries.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "delivery_event",
            id,
        })?;
        delivery.status = DeliveryStatus::Failed;
        delivery.error_message = Some(error_message.to_string());
        delivery.updated_at = now;
        Ok(())
    }

    async fn deliveries_for_version(
        &self,
        doc_version_id: i64,
    ) -> Result<Vec<DeliveryEvent>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .deliveries
            .values()
            .filter(|d| d.doc_version_id == doc_version_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DocumentStore;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, secs).unwrap()
    }

    async fn seeded_store() -> (MemoryStore, i64) {
        let store = MemoryStore::new();
        let source = store
            .create_source(
                NewSource {
                    name: "example".into(),
                    kind: rdp_core::SourceKind::Html,
                    base_url: "https://example.test/reg".into(),
                    auth_ref: None,
                    robots_mode: rdp_core::RobotsMode::Allow,
                    rate_limit: 60,
                },
                at(0),
            )
            .await
            .unwrap();
        let sub = store
            .create_subscription(
                NewSubscription {
                    source_id: source.id,
                    jurisdiction: "eu".into(),
                    selectors: json!({}),
                    schedule: "*/5 * * * *".into(),
                    status: SubscriptionStatus::Active,
                },
                at(0),
            )
            .await
            .unwrap();
        (store, sub.id)
    }

    #[tokio::test]
    async fn claim_due_creates_run_and_outbox_atomically() {
        let (store, sub_id) = seeded_store().await;
        let claimed = store.claim_due(at(1), 100).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let claim = &claimed[0];
        assert_eq!(claim.subscription_id, sub_id);

        let run = store.run(claim.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.subscription_id, Some(sub_id));

        let outbox = store.outbox_for_run(claim.run_id).await.unwrap().unwrap();
        assert_eq!(outbox.event_type, "subs.schedule");
        assert_eq!(outbox.status, OutboxStatus::Pending);

        let sub = store.subscription(sub_id).await.unwrap().unwrap();
        assert_eq!(sub.last_run_at, Some(at(1)));
        assert_eq!(sub.next_run_at, None);
    }

    #[tokio::test]
    async fn tick_twice_on_the_same_clock_claims_nothing_new() {
        let (store, _) = seeded_store().await;
        let first = store.claim_due(at(1), 100).await.unwrap();
        let second = store.claim_due(at(1), 100).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn paused_subscriptions_are_never_claimed() {
        let (store, sub_id) = seeded_store().await;
        store
            .set_subscription_status(sub_id, SubscriptionStatus::Paused, at(0))
            .await
            .unwrap();
        assert!(store.claim_due(at(1), 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn future_next_run_is_not_due() {
        let (store, sub_id) = seeded_store().await;
        store.set_next_run(sub_id, at(30)).await.unwrap();
        assert!(store.claim_due(at(1), 100).await.unwrap().is_empty());
        assert_eq!(store.claim_due(at(30), 100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_claims_split_without_overlap() {
        let store = MemoryStore::new();
        // Seed 100 due subscriptions against one source.
        let source = store
            .create_source(
                NewSource {
                    name: "bulk".into(),
                    kind: rdp_core::SourceKind::Html,
                    base_url: "https://example.test".into(),
                    auth_ref: None,
                    robots_mode: rdp_core::RobotsMode::Allow,
                    rate_limit: 60,
                },
                at(0),
            )
            .await
            .unwrap();
        for _ in 0..100 {
            store
                .create_subscription(
                    NewSubscription {
                        source_id: source.id,
                        jurisdiction: "eu".into(),
                        selectors: json!({}),
                        schedule: "* * * * *".into(),
                        status: SubscriptionStatus::Active,
                    },
                    at(0),
                )
                .await
                .unwrap();
        }

        let a = store.clone();
        let b = store.clone();
        let (left, right) = tokio::join!(
            tokio::spawn(async move { a.claim_due(at(1), 100).await.unwrap() }),
            tokio::spawn(async move { b.claim_due(at(1), 100).await.unwrap() }),
        );
        let left = left.unwrap();
        let right = right.unwrap();
        assert_eq!(left.len() + right.len(), 100);
        let mut subs: Vec<i64> = left
            .iter()
            .chain(right.iter())
            .map(|c| c.subscription_id)
            .collect();
        subs.sort_unstable();
        subs.dedup();
        assert_eq!(subs.len(), 100, "a subscription was claimed twice");
    }

    #[tokio::test]
    async fn run_transitions_are_sticky() {
        let (store, _) = seeded_store().await;
        let claim = store.claim_due(at(1), 1).await.unwrap().remove(0);

        store
            .transition_run(claim.run_id, RunStatus::Running, at(2), None)
            .await
            .unwrap();
        store
            .transition_run(claim.run_id, RunStatus::Completed, at(3), None)
            .await
            .unwrap();
        // Late RUNNING and duplicate terminal transitions are no-ops.
        store
            .transition_run(claim.run_id, RunStatus::Running, at(4), None)
            .await
            .unwrap();
        store
            .transition_run(claim.run_id, RunStatus::Failed, at(5), Some("late".into()))
            .await
            .unwrap();

        let run = store.run(claim.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.ended_at, Some(at(3)));
        assert_eq!(run.error, None);
    }

    #[tokio::test]
    async fn terminal_states_set_ended_at_and_error() {
        let (store, _) = seeded_store().await;
        let claim = store.claim_due(at(1), 1).await.unwrap().remove(0);
        store
            .transition_run(claim.run_id, RunStatus::Failed, at(2), Some("boom".into()))
            .await
            .unwrap();
        let run = store.run(claim.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.ended_at, Some(at(2)));
        assert_eq!(run.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn outbox_claims_skip_locked_rows() {
        let (store, _) = seeded_store().await;
        store.claim_due(at(1), 1).await.unwrap();

        let first = store.claim_pending(10).await.unwrap();
        assert_eq!(first.entries().len(), 1);
        // Second claim while the first is open sees nothing.
        let second = store.claim_pending(10).await.unwrap();
        assert!(second.entries().is_empty());
        second.commit().await.unwrap();

        first.commit().await.unwrap();
        // Lock released, row still pending.
        let third = store.claim_pending(10).await.unwrap();
        assert_eq!(third.entries().len(), 1);
    }

    #[tokio::test]
    async fn mark_attempt_parks_after_the_cap() {
        let (store, _) = seeded_store().await;
        store.claim_due(at(1), 1).await.unwrap();
        for round in 0..5 {
            let mut claim = store.claim_pending(10).await.unwrap();
            let entries: Vec<OutboxEntry> = claim.entries().to_vec();
            assert_eq!(entries.len(), 1, "round {round}");
            claim.mark_attempt(entries[0].id, 5).await.unwrap();
            claim.commit().await.unwrap();
        }
        assert!(store.claim_pending(10).await.unwrap().entries().is_empty());
        let entry = store.list_recent_outbox(1).await.unwrap().remove(0);
        assert_eq!(entry.status, OutboxStatus::Failed);
        assert_eq!(entry.attempts, 5);
    }

    #[tokio::test]
    async fn published_rows_are_never_reclaimed() {
        let (store, _) = seeded_store().await;
        store.claim_due(at(1), 1).await.unwrap();
        let mut claim = store.claim_pending(10).await.unwrap();
        let id = claim.entries()[0].id;
        claim.mark_published(id, at(2)).await.unwrap();
        claim.commit().await.unwrap();

        let entry = store.list_recent_outbox(1).await.unwrap().remove(0);
        assert_eq!(entry.status, OutboxStatus::Published);
        assert_eq!(entry.published_at, Some(at(2)));
        assert!(store.claim_pending(10).await.unwrap().entries().is_empty());
    }

    #[tokio::test]
    async fn document_upsert_is_keyed_by_url() {
        let (store, _) = seeded_store().await;
        let first = store
            .upsert_document(1, "https://example.test/reg", None, "en", at(1))
            .await
            .unwrap();
        let second = store
            .upsert_document(1, "https://example.test/reg", None, "en", at(2))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.updated_at, at(2));
    }

    #[tokio::test]
    async fn previous_version_orders_by_created_at_then_id() {
        let (store, _) = seeded_store().await;
        let doc = store
            .upsert_document(1, "https://example.test/reg", None, "en", at(1))
            .await
            .unwrap();
        let v1 = store.insert_version(doc.id, "h1", 1, at(1)).await.unwrap();
        let v2 = store.insert_version(doc.id, "h2", 2, at(2)).await.unwrap();
        let v3 = store.insert_version(doc.id, "h3", 3, at(2)).await.unwrap();

        assert!(
            store
                .previous_version(doc.id, v1.id)
                .await
                .unwrap()
                .is_some_and(|v| v.id == v3.id)
        );
        let prev_of_v3 = store.previous_version(doc.id, v3.id).await.unwrap().unwrap();
        assert_eq!(prev_of_v3.id, v2.id);
        let ordered = store.versions_of(doc.id).await.unwrap();
        assert_eq!(
            ordered.iter().map(|v| v.id).collect::<Vec<_>>(),
            vec![v1.id, v2.id, v3.id]
        );
    }

    #[tokio::test]
    async fn delivery_lifecycle_updates_row() {
        let (store, _) = seeded_store().await;
        let doc = store
            .upsert_document(1, "https://example.test/reg", None, "en", at(1))
            .await
            .unwrap();
        let version = store.insert_version(doc.id, "h", 1, at(1)).await.unwrap();
        let delivery = store
            .insert_delivery(version.id, "parsed_document", at(2))
            .await
            .unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Pending);

        store
            .complete_delivery(delivery.id, "s3://artifacts/parsed/1/1.json", at(3))
            .await
            .unwrap();
        let rows = store.deliveries_for_version(version.id).await.unwrap();
        assert_eq!(rows[0].status, DeliveryStatus::Completed);
        assert_eq!(
            rows[0].delivery_uri.as_deref(),
            Some("s3://artifacts/parsed/1/1.json")
        );
    }
}
