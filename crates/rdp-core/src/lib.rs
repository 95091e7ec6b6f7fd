// SPDX-License-Identifier: MIT OR Apache-2.0
//! rdp-core
//!
//! The stable contract for the regulatory-document pipeline: domain records
//! and their state machines, bus topics and event payloads, canonical JSON
//! hashing, and the object-store key layout.
//!
//! If you only take one dependency, take this one.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Canonical JSON serialization and content hashing.
pub mod canonical;
/// Bus topics, the wire envelope, and typed event payloads.
pub mod event;
/// Object-store key layout and blob URI handling.
pub mod keys;
/// Domain records and status state machines.
pub mod model;

pub use event::Envelope;
pub use model::{
    Artifact, DeliveryEvent, DeliveryStatus, Document, DocumentVersion, OutboxEntry, OutboxStatus,
    RobotsMode, Run, RunKind, RunStatus, Source, SourceKind, Subscription, SubscriptionStatus,
};

/// Mint a fresh trace id for a pipeline entry.
///
/// Trace ids are opaque strings carried in every event payload of a run and
/// used to correlate logs with the audit trail.
#[must_use]
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
