// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stage workers for the regulatory-document pipeline.
//!
//! Each worker consumes one topic, performs its stage's database and
//! object-store writes, and only then emits the next-stage event. A failure
//! becomes a `run.failed` lifecycle event and no next-stage event; the
//! run-status aggregator folds lifecycle events into the run row.
//!
//! Handlers are registered in a [`HandlerRegistry`] keyed by topic, populated
//! once at process start and read-only afterwards.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Crawler (J₁).
pub mod crawl;
/// Deliverer (J₄).
pub mod deliver;
/// Handler contract and topic registry.
pub mod handler;
/// Run lifecycle event emission.
pub mod lifecycle;
/// Parser (J₂).
pub mod parse;
/// Subscription-scheduled handler (J₀).
pub mod schedule;
/// Run-status aggregator (K).
pub mod status;
/// Versioner (J₃).
pub mod version;
/// Topic consumer loop.
pub mod worker;

pub use crawl::CrawlHandler;
pub use deliver::DeliverHandler;
pub use handler::{HandlerRegistry, StageHandler};
pub use lifecycle::RunLifecycleEmitter;
pub use parse::ParseHandler;
pub use schedule::ScheduleHandler;
pub use status::{DeliveryResultStatusHandler, RunStatusHandler};
pub use version::VersionHandler;
pub use worker::run_consumer;
