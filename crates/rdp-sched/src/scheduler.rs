// SPDX-License-Identifier: MIT OR Apache-2.0
//! Due-subscription claiming.

use crate::SchedError;
use chrono::Utc;
use rdp_store::{ClaimedRun, SchedulerStore};
use std::sync::Arc;
use tracing::info;

/// The periodic tick: claims due subscriptions and commits a PENDING run plus
/// a `subs.schedule` outbox row per claim, atomically.
pub struct SchedulerTick {
    store: Arc<dyn SchedulerStore>,
}

impl SchedulerTick {
    /// Build a tick over the given store.
    pub fn new(store: Arc<dyn SchedulerStore>) -> Self {
        Self { store }
    }

    /// Run one tick. Returns the claims made; the count is what the control
    /// surface reports.
    ///
    /// Two concurrent ticks never claim the same subscription (row locks with
    /// skip-locked in the store), and a tick that fails mid-way commits
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::Store`] on database failure; the caller retries
    /// the entire tick.
    pub async fn tick(&self, batch_size: i64) -> Result<Vec<ClaimedRun>, SchedError> {
        let now = Utc::now();
        let claimed = self.store.claim_due(now, batch_size).await?;
        if !claimed.is_empty() {
            info!(
                target: "rdp.sched",
                claimed = claimed.len(),
                batch_size,
                "tick claimed due subscriptions"
            );
        }
        Ok(claimed)
    }
}
