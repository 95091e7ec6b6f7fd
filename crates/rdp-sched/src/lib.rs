// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scheduling layer: the due-subscription tick, the next-fire computer, and
//! the outbox dispatcher, plus the [`SchedulingService`] facade that the
//! daemon and CLI invoke.
//!
//! All three batch operations are idempotent and safe to run from multiple
//! replicas: claiming goes through the store's row locks, and re-running a
//! tick on the same clock claims nothing new.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Outbox → bus draining.
pub mod dispatcher;
/// `next_run_at` computation from cron expressions.
pub mod next_fire;
/// Due-subscription claiming.
pub mod scheduler;
/// Control facade over the batch operations and subscription actions.
pub mod service;

pub use dispatcher::OutboxDispatcher;
pub use next_fire::{NextFireComputer, parse_schedule};
pub use scheduler::SchedulerTick;
pub use service::SchedulingService;

use rdp_store::StoreError;

/// Errors from the scheduling layer.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    /// Store failure; the whole batch rolls back and the caller retries.
    #[error("store error")]
    Store(#[from] StoreError),

    /// A cron expression could not be evaluated.
    #[error("invalid schedule {expr:?} for subscription {subscription_id}")]
    BadSchedule {
        /// Subscription carrying the expression.
        subscription_id: i64,
        /// The offending expression.
        expr: String,
    },
}
