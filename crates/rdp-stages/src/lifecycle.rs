// SPDX-License-Identifier: MIT OR Apache-2.0
//! Run lifecycle event emission.
//!
//! Stage workers announce `run.started` on first execution, `run.completed`
//! after the final stage, and `run.failed` on any stage failure. Emission is
//! best-effort: a worker whose bus publish fails will fail its own stage work
//! soon enough, and the aggregator dedupes whatever arrives.

use rdp_bus::EventBus;
use rdp_core::Envelope;
use rdp_core::event::{RunLifecycle, lifecycle, topics};
use std::sync::Arc;
use tracing::warn;

/// Publishes run lifecycle events on the `run.status` topic.
#[derive(Clone)]
pub struct RunLifecycleEmitter {
    bus: Arc<dyn EventBus>,
}

impl RunLifecycleEmitter {
    /// Build an emitter over the given bus.
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    async fn emit(&self, event: &str, payload: &RunLifecycle) -> bool {
        let envelope = match Envelope::new(event, payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(target: "rdp.stages", event, error = %err, "lifecycle payload unserializable");
                return false;
            }
        };
        match self.bus.publish(topics::RUN_STATUS, &envelope).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target: "rdp.stages",
                    event,
                    run_id = payload.run_id,
                    error = %err,
                    "lifecycle publish failed"
                );
                false
            }
        }
    }

    /// Announce that a stage executed for this run.
    pub async fn started(&self, run_id: i64, trace_id: &str) -> bool {
        self.emit(
            lifecycle::RUN_STARTED,
            &RunLifecycle {
                run_id,
                trace_id: trace_id.to_string(),
                error_message: None,
                error_traceback: None,
                result: None,
            },
        )
        .await
    }

    /// Announce that the pipeline finished for this run.
    pub async fn completed(
        &self,
        run_id: i64,
        trace_id: &str,
        result: Option<serde_json::Value>,
    ) -> bool {
        self.emit(
            lifecycle::RUN_COMPLETED,
            &RunLifecycle {
                run_id,
                trace_id: trace_id.to_string(),
                error_message: None,
                error_traceback: None,
                result,
            },
        )
        .await
    }

    /// Announce a stage failure; the pipeline halts for this run.
    pub async fn failed(
        &self,
        run_id: i64,
        trace_id: &str,
        error_message: &str,
        error_traceback: Option<String>,
    ) -> bool {
        self.emit(
            lifecycle::RUN_FAILED,
            &RunLifecycle {
                run_id,
                trace_id: trace_id.to_string(),
                error_message: Some(error_message.to_string()),
                error_traceback,
                result: None,
            },
        )
        .await
    }
}
