// SPDX-License-Identifier: MIT OR Apache-2.0
//! Handler contract and topic registry.

use async_trait::async_trait;
use rdp_core::Envelope;
use rdp_error::PipelineError;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A stage worker: consumes envelopes from one topic.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Topic this handler consumes.
    fn topic(&self) -> &'static str;

    /// Process one envelope. Contract errors (malformed payloads) are
    /// returned for the consumer loop to log and skip; stage failures have
    /// already emitted `run.failed` by the time they propagate out of here.
    async fn handle(&self, envelope: &Envelope) -> Result<(), PipelineError>;
}

/// Decode a typed payload out of an envelope, classifying failures as
/// contract errors.
///
/// # Errors
///
/// Returns a [`PipelineError`] of class `Contract` when required fields are
/// missing or malformed.
pub fn decode_payload<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, PipelineError> {
    envelope.decode().map_err(|err| {
        PipelineError::contract(format!("malformed {} payload", envelope.event))
            .with_cause(err)
            .with_context("event", envelope.event.clone())
    })
}

/// Topic → handler registry. Populated at component init, read-only
/// thereafter; consumers look handlers up without inspecting payloads.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its topic, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(handler.topic(), handler);
    }

    /// Look up the handler for a topic.
    #[must_use]
    pub fn get(&self, topic: &str) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(topic).cloned()
    }

    /// Topics with a registered handler, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}
