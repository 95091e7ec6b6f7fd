// SPDX-License-Identifier: MIT OR Apache-2.0
//! Control facade over the batch operations and subscription actions.
//!
//! Everything here is invokable out-of-band: the daemon drives the batch
//! operations on timers, while operators reach the same code paths through
//! the HTTP surface and the CLI.

use crate::{NextFireComputer, OutboxDispatcher, SchedError, SchedulerTick};
use crate::next_fire::{next_occurrence, parse_schedule};
use chrono::Utc;
use rdp_bus::EventBus;
use rdp_core::model::NewSubscription;
use rdp_core::{OutboxEntry, Run, Subscription, SubscriptionStatus};
use rdp_store::{
    ClaimedRun, OutboxStore, RunStore, SchedulerStore, StoreError, SubscriptionStore,
};
use std::sync::Arc;
use tracing::info;

/// The stores and gateways the service operates over.
pub struct SchedulingDeps {
    /// Atomic tick claims.
    pub scheduler: Arc<dyn SchedulerStore>,
    /// Subscription state.
    pub subscriptions: Arc<dyn SubscriptionStore>,
    /// Run state.
    pub runs: Arc<dyn RunStore>,
    /// Outbox rows.
    pub outbox: Arc<dyn OutboxStore>,
    /// Bus the dispatcher publishes to.
    pub bus: Arc<dyn EventBus>,
    /// Publish attempts before an outbox row parks as FAILED.
    pub max_outbox_attempts: i32,
}

/// Idempotent scheduling actions shared by the daemon, HTTP surface, and CLI.
pub struct SchedulingService {
    tick: SchedulerTick,
    next_fire: NextFireComputer,
    dispatcher: OutboxDispatcher,
    subscriptions: Arc<dyn SubscriptionStore>,
    runs: Arc<dyn RunStore>,
    outbox: Arc<dyn OutboxStore>,
    scheduler: Arc<dyn SchedulerStore>,
}

impl SchedulingService {
    /// Assemble the service from its dependencies.
    #[must_use]
    pub fn new(deps: SchedulingDeps) -> Self {
        Self {
            tick: SchedulerTick::new(Arc::clone(&deps.scheduler)),
            next_fire: NextFireComputer::new(Arc::clone(&deps.subscriptions)),
            dispatcher: OutboxDispatcher::new(
                Arc::clone(&deps.outbox),
                deps.bus,
                deps.max_outbox_attempts,
            ),
            subscriptions: deps.subscriptions,
            runs: deps.runs,
            outbox: deps.outbox,
            scheduler: deps.scheduler,
        }
    }

    /// Claim due subscriptions. Returns the number processed.
    ///
    /// # Errors
    ///
    /// Propagates [`SchedError`] from the tick.
    pub async fn tick(&self, batch_size: i64) -> Result<usize, SchedError> {
        Ok(self.tick.tick(batch_size).await?.len())
    }

    /// Fill missing `next_run_at` values. Returns the number updated.
    ///
    /// # Errors
    ///
    /// Propagates [`SchedError`] from the computer.
    pub async fn compute_next(&self, batch_size: i64) -> Result<u64, SchedError> {
        self.next_fire.compute_next(batch_size).await
    }

    /// Drain the outbox to the bus. Returns the number published.
    ///
    /// # Errors
    ///
    /// Propagates [`SchedError`] from the dispatcher.
    pub async fn dispatch_outbox(&self, batch_size: i64) -> Result<usize, SchedError> {
        self.dispatcher.dispatch(batch_size).await
    }

    /// Register a subscription and stamp its first `next_run_at` so the tick
    /// can pick it up without waiting for the next-fire pass.
    ///
    /// # Errors
    ///
    /// Returns [`SchedError::BadSchedule`] for an unparseable cron expression
    /// or [`SchedError::Store`] on database failure.
    pub async fn create_subscription(
        &self,
        new: NewSubscription,
    ) -> Result<Subscription, SchedError> {
        let schedule = parse_schedule(&new.schedule).map_err(|_| SchedError::BadSchedule {
            subscription_id: 0,
            expr: new.schedule.clone(),
        })?;
        let now = Utc::now();
        let created = self.subscriptions.create_subscription(new, now).await?;
        if let Some(next) = next_occurrence(&schedule, now) {
            self.subscriptions.set_next_run(created.id, next).await?;
        }
        info!(
            target: "rdp.sched",
            subscription_id = created.id,
            schedule = %created.schedule,
            "subscription created"
        );
        self.subscription(created.id)
            .await?
            .ok_or(SchedError::Store(StoreError::NotFound {
                entity: "subscription",
                id: created.id,
            }))
    }

    /// Fetch one subscription.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn subscription(&self, id: i64) -> Result<Option<Subscription>, SchedError> {
        Ok(self.subscriptions.subscription(id).await?)
    }

    /// Re-enable a subscription for scheduling.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn enable_subscription(&self, id: i64) -> Result<Option<Subscription>, SchedError> {
        Ok(self
            .subscriptions
            .set_subscription_status(id, SubscriptionStatus::Active, Utc::now())
            .await?)
    }

    /// Take a subscription out of scheduling.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn disable_subscription(&self, id: i64) -> Result<Option<Subscription>, SchedError> {
        Ok(self
            .subscriptions
            .set_subscription_status(id, SubscriptionStatus::Disabled, Utc::now())
            .await?)
    }

    /// Schedule one subscription immediately: stamps `last_run_at`, clears
    /// `next_run_at`, creates a PENDING run, and enqueues the outbox row —
    /// exactly what the tick does for a due row.
    ///
    /// # Errors
    ///
    /// Propagates store failures, including an unknown subscription id.
    pub async fn run_subscription_now(&self, id: i64) -> Result<ClaimedRun, SchedError> {
        let claim = self.scheduler.run_now(id, Utc::now()).await?;
        info!(
            target: "rdp.sched",
            subscription_id = id,
            run_id = claim.run_id,
            "subscription scheduled out of band"
        );
        Ok(claim)
    }

    /// Recent subscriptions, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_subscriptions(
        &self,
        status: Option<SubscriptionStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Subscription>, SchedError> {
        Ok(self
            .subscriptions
            .list_subscriptions(status, limit, offset)
            .await?)
    }

    /// Recent runs, newest first.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_runs(&self, limit: i64) -> Result<Vec<Run>, SchedError> {
        Ok(self.runs.list_recent_runs(limit).await?)
    }

    /// Recent outbox rows, newest first.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_outbox(&self, limit: i64) -> Result<Vec<OutboxEntry>, SchedError> {
        Ok(self.outbox.list_recent_outbox(limit).await?)
    }
}
