// SPDX-License-Identifier: MIT OR Apache-2.0
//! `next_run_at` computation from cron expressions.

use crate::SchedError;
use chrono::{DateTime, Utc};
use cron::Schedule;
use rdp_store::SubscriptionStore;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Parse a subscription schedule.
///
/// Subscriptions use standard 5-field cron. The evaluator wants a seconds
/// field, so 5-field expressions are pinned to second zero.
///
/// # Errors
///
/// Returns the evaluator's parse error for malformed expressions.
pub fn parse_schedule(expr: &str) -> Result<Schedule, cron::error::Error> {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        Schedule::from_str(&format!("0 {expr}"))
    } else {
        Schedule::from_str(expr)
    }
}

/// Compute the next occurrence of a schedule strictly after `base`.
#[must_use]
pub fn next_occurrence(schedule: &Schedule, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&base).next()
}

/// Fills `next_run_at` for ACTIVE subscriptions missing one.
///
/// Idempotent: the next occurrence after an unchanged base is always the same
/// instant, so re-running writes the same value.
pub struct NextFireComputer {
    subscriptions: Arc<dyn SubscriptionStore>,
}

impl NextFireComputer {
    /// Build a computer over the given store.
    pub fn new(subscriptions: Arc<dyn SubscriptionStore>) -> Self {
        Self { subscriptions }
    }

    /// Fill up to `batch_size` subscriptions. Returns how many were updated.
    /// Subscriptions with malformed expressions are logged and skipped so one
    /// bad row cannot starve the batch.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::Store`] on database failure.
    pub async fn compute_next(&self, batch_size: i64) -> Result<u64, SchedError> {
        let now = Utc::now();
        let candidates = self.subscriptions.next_fire_candidates(now, batch_size).await?;
        let mut updated = 0u64;
        for candidate in candidates {
            let Ok(schedule) = parse_schedule(&candidate.schedule) else {
                warn!(
                    target: "rdp.sched",
                    subscription_id = candidate.id,
                    schedule = %candidate.schedule,
                    "unparseable schedule, skipping"
                );
                continue;
            };
            let Some(next) = next_occurrence(&schedule, candidate.base) else {
                warn!(
                    target: "rdp.sched",
                    subscription_id = candidate.id,
                    schedule = %candidate.schedule,
                    "schedule has no future occurrence"
                );
                continue;
            };
            self.subscriptions.set_next_run(candidate.id, next).await?;
            debug!(
                target: "rdp.sched",
                subscription_id = candidate.id,
                next_run_at = %next,
                "next fire computed"
            );
            updated += 1;
        }
        Ok(updated)
    }
}
