// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end pipeline scenarios over the in-memory adapters with a real
//! HTTP source: scheduling through delivery, change detection, failure
//! handling, duplicate events, and concurrent claiming.

mod common;

use common::{Harness, PAGE_V1, PAGE_V2};
use rdp_blob::BlobStore;
use rdp_bus::{BusSubscription, EventBus};
use rdp_core::event::topics;
use rdp_core::{Envelope, OutboxStatus, RunStatus};
use rdp_store::{DocumentStore, OutboxStore, RunStore, SchedulerStore};
use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn serve(server: &MockServer, body: &str) {
    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/html; charset=utf-8"))
        .mount(server)
        .await;
}

#[tokio::test]
async fn fresh_subscription_reaches_first_version() {
    let server = MockServer::start().await;
    serve(&server, PAGE_V1).await;
    let harness = Harness::start().await;
    let source_id = harness.create_source(&server.uri()).await;
    let sub_id = harness.create_due_subscription(source_id).await;

    // One bus record per stage event for a completed run.
    let bus = harness.bus.clone();
    let mut stage_subs = Vec::new();
    for topic in [
        topics::SUBS_SCHEDULE,
        topics::CRAWL_REQUEST,
        topics::CRAWL_RESULT,
        topics::PARSE_RESULT,
        topics::VERSIONING_RESULT,
        topics::DELIVERY_REQUEST,
        topics::DELIVERY_RESULT,
    ] {
        stage_subs.push((topic, bus.subscribe(topic, "probe").await.unwrap()));
    }

    // Tick: a PENDING run and a PENDING outbox row appear atomically.
    assert_eq!(harness.service.tick(100).await.unwrap(), 1);
    let run = harness.store.list_recent_runs(1).await.unwrap().remove(0);
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.subscription_id, Some(sub_id));
    let outbox = harness.store.outbox_for_run(run.id).await.unwrap().unwrap();
    assert_eq!(outbox.event_type, "subs.schedule");
    assert_eq!(outbox.status, OutboxStatus::Pending);

    // Dispatch and let the stages run to completion.
    assert_eq!(harness.service.dispatch_outbox(100).await.unwrap(), 1);
    harness.wait_for_run(run.id, RunStatus::Completed).await;

    let run = harness.store.run(run.id).await.unwrap().unwrap();
    assert!(run.ended_at.is_some());

    // Exactly one document for the crawled URL, one version, no diff.
    let artifact = harness.store.artifact_by_run(run.id).await.unwrap().unwrap();
    let version = harness.store.version_by_run(run.id).await.unwrap().unwrap();
    assert!(version.diff_uri.is_none());
    let versions = harness.store.versions_of(version.document_id).await.unwrap();
    assert_eq!(versions.len(), 1);
    let document = harness
        .store
        .document(version.document_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(document.source_url, server.uri());

    // Object store holds the raw bytes and the parsed snapshot.
    let keys = harness.blobs.keys();
    assert!(
        keys.iter()
            .any(|k| k.starts_with(&format!("raw/{source_id}/"))
                && k.ends_with(&format!("{}.bin", artifact.fetch_hash)))
    );
    assert!(keys.contains(&format!(
        "parsed/{}/{}.json",
        version.document_id, version.id
    )));

    // Causal ordering: exactly one record on every stage topic.
    for (topic, sub) in &mut stage_subs {
        let message = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap_or_else(|_| panic!("no message on {topic}"))
            .unwrap()
            .unwrap();
        assert_eq!(&message.topic, topic);
        let extra = tokio::time::timeout(Duration::from_millis(30), sub.next()).await;
        assert!(extra.is_err(), "duplicate message on {topic}");
    }

    // The dispatched row is PUBLISHED and stamped.
    let outbox = harness.store.outbox_for_run(run.id).await.unwrap().unwrap();
    assert_eq!(outbox.status, OutboxStatus::Published);
    assert!(outbox.published_at.is_some());

    harness.stop();
}

#[tokio::test]
async fn second_crawl_with_unchanged_content_diffs_empty() {
    let server = MockServer::start().await;
    serve(&server, PAGE_V1).await;
    let harness = Harness::start().await;
    let source_id = harness.create_source(&server.uri()).await;
    harness.create_due_subscription(source_id).await;

    let first_run = harness.tick_and_dispatch_one().await;
    harness.wait_for_run(first_run, RunStatus::Completed).await;
    let v1 = harness.store.version_by_run(first_run).await.unwrap().unwrap();

    // Identical bytes on the second crawl.
    let second_run = harness.tick_and_dispatch_one().await;
    harness.wait_for_run(second_run, RunStatus::Completed).await;

    let a1 = harness.store.artifact_by_run(first_run).await.unwrap().unwrap();
    let a2 = harness.store.artifact_by_run(second_run).await.unwrap().unwrap();
    assert_ne!(a1.id, a2.id);
    assert_eq!(a1.fetch_hash, a2.fetch_hash);

    let v2 = harness.store.version_by_run(second_run).await.unwrap().unwrap();
    assert_ne!(v1.id, v2.id);
    assert_eq!(v1.content_hash, v2.content_hash);

    // The diff exists and its operations list is empty.
    let diff_uri = v2.diff_uri.expect("second version records a diff");
    let patch: serde_json::Value =
        serde_json::from_slice(&harness.blobs.get(&diff_uri).await.unwrap()).unwrap();
    assert_eq!(patch, serde_json::json!([]));

    harness.stop();
}

#[tokio::test]
async fn second_crawl_with_changed_content_produces_applicable_patch() {
    let server = MockServer::start().await;
    serve(&server, PAGE_V1).await;
    let harness = Harness::start().await;
    let source_id = harness.create_source(&server.uri()).await;
    harness.create_due_subscription(source_id).await;

    let first_run = harness.tick_and_dispatch_one().await;
    harness.wait_for_run(first_run, RunStatus::Completed).await;
    let v1 = harness.store.version_by_run(first_run).await.unwrap().unwrap();

    serve(&server, PAGE_V2).await;
    let second_run = harness.tick_and_dispatch_one().await;
    harness.wait_for_run(second_run, RunStatus::Completed).await;
    let v2 = harness.store.version_by_run(second_run).await.unwrap().unwrap();

    assert_ne!(v1.content_hash, v2.content_hash);

    let diff_uri = v2.diff_uri.expect("changed content records a diff");
    let patch_bytes = harness.blobs.get(&diff_uri).await.unwrap();
    let patch: json_patch::Patch = serde_json::from_slice(&patch_bytes).unwrap();
    let replaces_section_text = patch.0.iter().any(|op| {
        serde_json::to_value(op).is_ok_and(|v| {
            v["op"].as_str() == Some("replace")
                && v["path"]
                    .as_str()
                    .is_some_and(|p| p.starts_with("/sections/") && p.ends_with("/text"))
        })
    });
    assert!(replaces_section_text, "patch: {patch:?}");

    // Diff law: v1 snapshot + patch == v2 snapshot.
    let mut old: serde_json::Value =
        serde_json::from_slice(&harness.blobs.get(&v1.parsed_uri).await.unwrap()).unwrap();
    let new: serde_json::Value =
        serde_json::from_slice(&harness.blobs.get(&v2.parsed_uri).await.unwrap()).unwrap();
    json_patch::patch(&mut old, &patch).unwrap();
    assert_eq!(old, new);

    harness.stop();
}

#[tokio::test]
async fn crawler_failure_fails_the_run_after_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let harness = Harness::start().await;
    let source_id = harness.create_source(&server.uri()).await;
    harness.create_due_subscription(source_id).await;

    let bus = harness.bus.clone();
    let mut crawl_results = bus.subscribe(topics::CRAWL_RESULT, "probe").await.unwrap();

    let run_id = harness.tick_and_dispatch_one().await;
    harness.wait_for_run(run_id, RunStatus::Failed).await;

    let run = harness.store.run(run_id).await.unwrap().unwrap();
    assert!(run.error.as_deref().is_some_and(|e| !e.is_empty()));
    assert!(run.ended_at.is_some());

    // No version was created and no crawl.result was emitted.
    assert!(harness.store.version_by_run(run_id).await.unwrap().is_none());
    let silent = tokio::time::timeout(Duration::from_millis(50), crawl_results.next()).await;
    assert!(silent.is_err());

    // Failure is downstream of dispatch: the outbox row is PUBLISHED.
    let outbox = harness.store.outbox_for_run(run_id).await.unwrap().unwrap();
    assert_eq!(outbox.status, OutboxStatus::Published);

    harness.stop();
}

#[tokio::test]
async fn duplicate_schedule_event_does_not_duplicate_effects() {
    let server = MockServer::start().await;
    serve(&server, PAGE_V1).await;
    let harness = Harness::start().await;
    let source_id = harness.create_source(&server.uri()).await;
    harness.create_due_subscription(source_id).await;

    let run_id = harness.tick_and_dispatch_one().await;
    harness.wait_for_run(run_id, RunStatus::Completed).await;

    // A dispatcher that crashed between publish and commit re-publishes the
    // same outbox row after restart.
    let outbox = harness.store.outbox_for_run(run_id).await.unwrap().unwrap();
    harness
        .bus
        .publish(
            topics::SUBS_SCHEDULE,
            &Envelope {
                event: outbox.event_type.clone(),
                data: outbox.payload.clone(),
            },
        )
        .await
        .unwrap();

    // Let the duplicate flow through every stage.
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Still one artifact and one version for the run, and the run stays
    // COMPLETED.
    let versions = harness
        .store
        .versions_of(
            harness
                .store
                .version_by_run(run_id)
                .await
                .unwrap()
                .unwrap()
                .document_id,
        )
        .await
        .unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(
        harness.store.run(run_id).await.unwrap().unwrap().status,
        RunStatus::Completed
    );
    let deliveries = harness
        .store
        .deliveries_for_version(versions[0].id)
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 1);

    harness.stop();
}

#[tokio::test]
async fn concurrent_ticks_split_the_claims_without_loss() {
    let harness = Harness::start().await;
    // No dispatch in this scenario; only claiming is under test.
    harness.stop();
    let source_id = harness.create_source("https://example.test/reg").await;
    for _ in 0..100 {
        harness.create_due_subscription(source_id).await;
    }

    let store_a = harness.store.clone();
    let store_b = harness.store.clone();
    let now = chrono::Utc::now();
    let (left, right) = tokio::join!(
        tokio::spawn(async move { store_a.claim_due(now, 100).await.unwrap() }),
        tokio::spawn(async move { store_b.claim_due(now, 100).await.unwrap() }),
    );
    let left = left.unwrap();
    let right = right.unwrap();

    assert_eq!(left.len() + right.len(), 100);
    let mut subscription_ids: Vec<i64> = left
        .iter()
        .chain(right.iter())
        .map(|c| c.subscription_id)
        .collect();
    subscription_ids.sort_unstable();
    subscription_ids.dedup();
    assert_eq!(subscription_ids.len(), 100);

    assert_eq!(harness.store.list_recent_runs(200).await.unwrap().len(), 100);
    assert_eq!(
        harness.store.list_recent_outbox(200).await.unwrap().len(),
        100
    );
}
