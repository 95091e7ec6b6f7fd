// SPDX-License-Identifier: MIT OR Apache-2.0
//! Run-status aggregator (K).
//!
//! Folds run lifecycle events into the run row: `run.started` → RUNNING,
//! `run.completed` → COMPLETED, `run.failed` → FAILED with the error detail.
//! `delivery.result` doubles as the terminal trigger. All transitions go
//! through the store's sticky-terminal rule, so duplicates and late arrivals
//! are no-ops.

use crate::handler::{StageHandler, decode_payload};
use async_trait::async_trait;
use chrono::Utc;
use rdp_core::event::{DeliveryResult, RunLifecycle, lifecycle, topics};
use rdp_core::{Envelope, RunStatus};
use rdp_error::PipelineError;
use rdp_store::RunStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Consumes `run.status` lifecycle events.
pub struct RunStatusHandler {
    runs: Arc<dyn RunStore>,
}

impl RunStatusHandler {
    /// Build the handler.
    pub fn new(runs: Arc<dyn RunStore>) -> Self {
        Self { runs }
    }

    async fn transition(
        &self,
        run_id: i64,
        target: RunStatus,
        error: Option<String>,
    ) -> Result<(), PipelineError> {
        let updated = self
            .runs
            .transition_run(run_id, target, Utc::now(), error)
            .await
            .map_err(|err| PipelineError::transient("run transition failed").with_cause(err))?;
        match updated {
            Some(run) => {
                debug!(
                    target: "rdp.stages",
                    run_id,
                    status = %run.status,
                    "run transition applied"
                );
            }
            None => {
                warn!(target: "rdp.stages", run_id, "run not found for status update");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StageHandler for RunStatusHandler {
    fn topic(&self) -> &'static str {
        topics::RUN_STATUS
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), PipelineError> {
        let target = match envelope.event.as_str() {
            lifecycle::RUN_STARTED => RunStatus::Running,
            lifecycle::RUN_COMPLETED => RunStatus::Completed,
            lifecycle::RUN_FAILED => RunStatus::Failed,
            other => {
                return Err(PipelineError::contract(format!(
                    "unknown run lifecycle event {other:?}"
                )));
            }
        };
        let payload: RunLifecycle = decode_payload(envelope)?;

        let error = if target == RunStatus::Failed {
            let message = payload
                .error_message
                .unwrap_or_else(|| "unknown error".to_string());
            Some(match payload.error_traceback {
                Some(traceback) => format!("{message}\n{traceback}"),
                None => message,
            })
        } else {
            None
        };

        self.transition(payload.run_id, target, error).await
    }
}

/// Consumes `delivery.result` as the pipeline's terminal trigger.
pub struct DeliveryResultStatusHandler {
    runs: Arc<dyn RunStore>,
}

impl DeliveryResultStatusHandler {
    /// Build the handler.
    pub fn new(runs: Arc<dyn RunStore>) -> Self {
        Self { runs }
    }
}

#[async_trait]
impl StageHandler for DeliveryResultStatusHandler {
    fn topic(&self) -> &'static str {
        topics::DELIVERY_RESULT
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), PipelineError> {
        let payload: DeliveryResult = decode_payload(envelope)?;
        let updated = self
            .runs
            .transition_run(payload.run_id, RunStatus::Completed, Utc::now(), None)
            .await
            .map_err(|err| PipelineError::transient("run transition failed").with_cause(err))?;
        if updated.is_none() {
            warn!(
                target: "rdp.stages",
                run_id = payload.run_id,
                "run not found for delivery result"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdp_core::event::DeliveryOutcome;
    use rdp_core::model::{NewSource, NewSubscription};
    use rdp_core::{DeliveryStatus, SubscriptionStatus};
    use rdp_store::{MemoryStore, SchedulerStore, SourceStore, SubscriptionStore};
    use serde_json::json;

    async fn seeded_run(store: &MemoryStore) -> i64 {
        let now = Utc::now() - chrono::Duration::seconds(2);
        let source = store
            .create_source(
                NewSource {
                    name: "s".into(),
                    kind: rdp_core::SourceKind::Html,
                    base_url: "https://example.test".into(),
                    auth_ref: None,
                    robots_mode: rdp_core::RobotsMode::Allow,
                    rate_limit: 60,
                },
                now,
            )
            .await
            .unwrap();
        store
            .create_subscription(
                NewSubscription {
                    source_id: source.id,
                    jurisdiction: "eu".into(),
                    selectors: json!({}),
                    schedule: "* * * * *".into(),
                    status: SubscriptionStatus::Active,
                },
                now,
            )
            .await
            .unwrap();
        store.claim_due(Utc::now(), 1).await.unwrap().remove(0).run_id
    }

    fn lifecycle_envelope(event: &str, run_id: i64, error: Option<&str>) -> Envelope {
        Envelope::new(
            event,
            &RunLifecycle {
                run_id,
                trace_id: "trace".into(),
                error_message: error.map(String::from),
                error_traceback: error.map(|_| "stage backtrace".to_string()),
                result: None,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn started_then_completed_walks_the_state_machine() {
        let store = MemoryStore::new();
        let run_id = seeded_run(&store).await;
        let handler = RunStatusHandler::new(Arc::new(store.clone()));

        handler
            .handle(&lifecycle_envelope(lifecycle::RUN_STARTED, run_id, None))
            .await
            .unwrap();
        assert_eq!(
            store.run(run_id).await.unwrap().unwrap().status,
            RunStatus::Running
        );

        handler
            .handle(&lifecycle_envelope(lifecycle::RUN_COMPLETED, run_id, None))
            .await
            .unwrap();
        let run = store.run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.ended_at.is_some());
    }

    #[tokio::test]
    async fn failure_stores_message_and_traceback() {
        let store = MemoryStore::new();
        let run_id = seeded_run(&store).await;
        let handler = RunStatusHandler::new(Arc::new(store.clone()));

        handler
            .handle(&lifecycle_envelope(lifecycle::RUN_FAILED, run_id, Some("fetch blew up")))
            .await
            .unwrap();
        let run = store.run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let error = run.error.unwrap();
        assert!(error.contains("fetch blew up"));
        assert!(error.contains("stage backtrace"));
    }

    #[tokio::test]
    async fn terminal_states_are_sticky_against_late_events() {
        let store = MemoryStore::new();
        let run_id = seeded_run(&store).await;
        let handler = RunStatusHandler::new(Arc::new(store.clone()));

        handler
            .handle(&lifecycle_envelope(lifecycle::RUN_FAILED, run_id, Some("boom")))
            .await
            .unwrap();
        // A late started and a conflicting completed are both ignored.
        handler
            .handle(&lifecycle_envelope(lifecycle::RUN_STARTED, run_id, None))
            .await
            .unwrap();
        handler
            .handle(&lifecycle_envelope(lifecycle::RUN_COMPLETED, run_id, None))
            .await
            .unwrap();

        assert_eq!(
            store.run(run_id).await.unwrap().unwrap().status,
            RunStatus::Failed
        );
    }

    #[tokio::test]
    async fn delivery_result_is_a_terminal_trigger() {
        let store = MemoryStore::new();
        let run_id = seeded_run(&store).await;
        let handler = DeliveryResultStatusHandler::new(Arc::new(store.clone()));

        let envelope = Envelope::new(
            topics::DELIVERY_RESULT,
            &DeliveryResult {
                doc_id: 1,
                version_id: 1,
                status: DeliveryStatus::Completed,
                result: DeliveryOutcome {
                    delivery_event_id: 1,
                    sections_delivered: 2,
                },
                run_id,
                trace_id: "trace".into(),
            },
        )
        .unwrap();
        handler.handle(&envelope).await.unwrap();

        let run = store.run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.ended_at.is_some());
    }

    #[tokio::test]
    async fn unknown_lifecycle_event_is_a_contract_error() {
        let store = MemoryStore::new();
        let handler = RunStatusHandler::new(Arc::new(store));
        let envelope = Envelope {
            event: "run.paused".into(),
            data: json!({"run_id": 1, "trace_id": "t"}),
        };
        let err = handler.handle(&envelope).await.unwrap_err();
        assert_eq!(err.class, rdp_error::ErrorClass::Contract);
    }
}
