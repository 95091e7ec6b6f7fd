// SPDX-License-Identifier: MIT OR Apache-2.0
//! Outbox → bus draining.

use crate::SchedError;
use chrono::Utc;
use rdp_bus::EventBus;
use rdp_core::Envelope;
use rdp_store::OutboxStore;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Drains PENDING outbox rows to the bus.
///
/// At-least-once: a crash between a bus acknowledgement and the status commit
/// re-publishes the row on restart, and downstream consumers dedupe by
/// `(run_id, event_type)`. Rows are published in id order within a batch;
/// a failed publish increments the attempt counter and leaves the row for a
/// later pass rather than blocking the batch.
pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    max_attempts: i32,
}

impl OutboxDispatcher {
    /// Build a dispatcher with the attempt cap after which rows park as
    /// FAILED.
    pub fn new(outbox: Arc<dyn OutboxStore>, bus: Arc<dyn EventBus>, max_attempts: i32) -> Self {
        Self {
            outbox,
            bus,
            max_attempts,
        }
    }

    /// Drain one batch. Returns the number of rows published and marked.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::Store`] on database failure. Bus failures are
    /// not errors at this level; they are recorded per row.
    pub async fn dispatch(&self, batch_size: i64) -> Result<usize, SchedError> {
        let mut claim = self.outbox.claim_pending(batch_size).await?;
        let entries = claim.entries().to_vec();
        if entries.is_empty() {
            return Ok(0);
        }
        debug!(target: "rdp.sched", count = entries.len(), "dispatching outbox batch");

        let mut published = 0usize;
        for entry in entries {
            let envelope = Envelope {
                event: entry.event_type.clone(),
                data: entry.payload.clone(),
            };
            match self.bus.publish(&entry.event_type, &envelope).await {
                Ok(()) => {
                    claim.mark_published(entry.id, Utc::now()).await?;
                    published += 1;
                }
                Err(err) => {
                    error!(
                        target: "rdp.sched",
                        outbox_id = entry.id,
                        topic = %entry.event_type,
                        attempts = entry.attempts + 1,
                        error = %err,
                        "publish failed"
                    );
                    claim.mark_attempt(entry.id, self.max_attempts).await?;
                }
            }
        }
        claim.commit().await?;

        if published > 0 {
            info!(target: "rdp.sched", published, "outbox batch dispatched");
        }
        Ok(published)
    }
}
