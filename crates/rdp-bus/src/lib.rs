// SPDX-License-Identifier: MIT OR Apache-2.0
//! Event bus gateway.
//!
//! Stage events travel as [`Envelope`]s on named topics. The [`EventBus`]
//! trait hides the transport: [`NatsBus`] uses JetStream with durable pull
//! consumers (at-least-once, per-subject ordering), [`MemoryBus`] uses
//! per-topic broadcast channels for hermetic tests and local runs.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use futures::StreamExt;
use rdp_core::Envelope;
use rdp_core::event::topics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Errors surfaced by bus adapters.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Could not reach or provision the bus.
    #[error("bus connection error: {message}")]
    Connection {
        /// Transport detail.
        message: String,
    },

    /// A publish was not acknowledged.
    #[error("bus publish error: {message}")]
    Publish {
        /// Transport detail.
        message: String,
    },

    /// A subscription could not be created or read.
    #[error("bus subscribe error: {message}")]
    Subscribe {
        /// Transport detail.
        message: String,
    },

    /// An envelope failed to serialize or parse.
    #[error("bus codec error")]
    Codec(#[from] serde_json::Error),
}

enum MessageInner {
    Memory,
    Nats(Box<async_nats::jetstream::Message>),
}

/// One message received from a topic. Must be acknowledged (or negatively
/// acknowledged for redelivery) before the consumer reads the next one.
pub struct BusMessage {
    /// Topic the message arrived on.
    pub topic: String,
    /// The decoded envelope.
    pub envelope: Envelope,
    inner: MessageInner,
}

impl BusMessage {
    /// Acknowledge successful processing.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Subscribe`] if the acknowledgement cannot be sent.
    pub async fn ack(self) -> Result<(), BusError> {
        match self.inner {
            MessageInner::Memory => Ok(()),
            MessageInner::Nats(message) => {
                message.ack().await.map_err(|err| BusError::Subscribe {
                    message: err.to_string(),
                })
            }
        }
    }

    /// Request redelivery (processing failed for a retryable reason).
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Subscribe`] if the negative acknowledgement cannot
    /// be sent.
    pub async fn nak(self) -> Result<(), BusError> {
        match self.inner {
            MessageInner::Memory => Ok(()),
            MessageInner::Nats(message) => message
                .ack_with(async_nats::jetstream::AckKind::Nak(None))
                .await
                .map_err(|err| BusError::Subscribe {
                    message: err.to_string(),
                }),
        }
    }
}

/// Publish/subscribe over named topics with at-least-once delivery.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an envelope to a topic and wait for the acknowledgement.
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BusError>;

    /// Subscribe to a topic within a consumer group. Each group sees every
    /// message at least once, in per-topic order.
    async fn subscribe(&self, topic: &str, group: &str)
    -> Result<Box<dyn BusSubscription>, BusError>;

    /// Flush buffered messages. Called once on graceful shutdown.
    async fn flush(&self) -> Result<(), BusError> {
        Ok(())
    }
}

/// A handle yielding messages from one topic.
#[async_trait]
pub trait BusSubscription: Send {
    /// The next message, or `None` once the bus is closed.
    async fn next(&mut self) -> Result<Option<BusMessage>, BusError>;
}

// ---------------------------------------------------------------------------
// NATS JetStream adapter
// ---------------------------------------------------------------------------

/// JetStream-backed bus: one stream covering every pipeline subject, one
/// durable pull consumer per `(group, topic)` pair.
pub struct NatsBus {
    client: async_nats::Client,
    jetstream: async_nats::jetstream::Context,
    stream_name: String,
    consumer_prefix: String,
}

impl NatsBus {
    /// Connect and provision the pipeline stream.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Connection`] when the server is unreachable or the
    /// stream cannot be created.
    pub async fn connect(
        url: &str,
        stream_prefix: &str,
        consumer_prefix: &str,
    ) -> Result<Self, BusError> {
        info!(target: "rdp.bus", url, "connecting to NATS");
        let client = async_nats::connect(url)
            .await
            .map_err(|err| BusError::Connection {
                message: err.to_string(),
            })?;
        let jetstream = async_nats::jetstream::new(client.clone());
        let stream_name = format!("{stream_prefix}-pipeline");

        let config = async_nats::jetstream::stream::Config {
            name: stream_name.clone(),
            subjects: topics::all().iter().map(ToString::to_string).collect(),
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            duplicate_window: Duration::from_secs(120),
            ..Default::default()
        };
        match jetstream.get_stream(&stream_name).await {
            Ok(_) => {
                debug!(target: "rdp.bus", stream = %stream_name, "stream exists, updating");
                jetstream
                    .update_stream(config)
                    .await
                    .map_err(|err| BusError::Connection {
                        message: err.to_string(),
                    })?;
            }
            Err(_) => {
                info!(target: "rdp.bus", stream = %stream_name, "creating stream");
                jetstream
                    .create_stream(config)
                    .await
                    .map_err(|err| BusError::Connection {
                        message: err.to_string(),
                    })?;
            }
        }

        Ok(Self {
            client,
            jetstream,
            stream_name,
            consumer_prefix: consumer_prefix.to_string(),
        })
    }
}

struct NatsSubscription {
    topic: String,
    messages: async_nats::jetstream::consumer::pull::Stream,
}

#[async_trait]
impl BusSubscription for NatsSubscription {
    async fn next(&mut self) -> Result<Option<BusMessage>, BusError> {
        loop {
            let Some(message) = self.messages.next().await else {
                return Ok(None);
            };
            let message = message.map_err(|err| BusError::Subscribe {
                message: err.to_string(),
            })?;
            match Envelope::from_bytes(&message.payload) {
                Ok(envelope) => {
                    return Ok(Some(BusMessage {
                        topic: self.topic.clone(),
                        envelope,
                        inner: MessageInner::Nats(Box::new(message)),
                    }));
                }
                Err(err) => {
                    // Non-JSON payload: terminate it so it is not redelivered
                    // forever, then keep reading.
                    warn!(
                        target: "rdp.bus",
                        topic = %self.topic,
                        error = %err,
                        "dropping undecodable message"
                    );
                    let _ = message
                        .ack_with(async_nats::jetstream::AckKind::Term)
                        .await;
                }
            }
        }
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BusError> {
        let bytes = envelope.to_bytes()?;
        let ack = self
            .jetstream
            .publish(topic.to_string(), bytes.into())
            .await
            .map_err(|err| BusError::Publish {
                message: err.to_string(),
            })?;
        ack.await.map_err(|err| BusError::Publish {
            message: err.to_string(),
        })?;
        debug!(target: "rdp.bus", topic, event = %envelope.event, "published");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|err| BusError::Subscribe {
                message: err.to_string(),
            })?;
        // Consumer names may not contain subject tokens.
        let durable = format!(
            "{}-{group}-{}",
            self.consumer_prefix,
            topic.replace('.', "-")
        );
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                async_nats::jetstream::consumer::pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: topic.to_string(),
                    ack_policy: async_nats::jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| BusError::Subscribe {
                message: err.to_string(),
            })?;
        let messages = consumer
            .messages()
            .await
            .map_err(|err| BusError::Subscribe {
                message: err.to_string(),
            })?;
        info!(target: "rdp.bus", topic, durable, "consumer attached");
        Ok(Box::new(NatsSubscription {
            topic: topic.to_string(),
            messages,
        }))
    }

    async fn flush(&self) -> Result<(), BusError> {
        self.client
            .flush()
            .await
            .map_err(|err| BusError::Publish {
                message: err.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// In-memory adapter
// ---------------------------------------------------------------------------

const MEMORY_CAPACITY: usize = 256;

#[derive(Default)]
struct MemoryInner {
    channels: HashMap<String, broadcast::Sender<Envelope>>,
    published: u64,
    dropped: u64,
}

/// Broadcast-based in-memory bus.
///
/// Consumer groups collapse to plain subscribers: within one process each
/// topic has a single consuming loop, which matches the per-partition
/// single-flight model.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Envelope> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_CAPACITY).0)
            .clone()
    }

    /// Number of envelopes published so far. Test helper.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .published
    }

    /// Envelopes lost because nothing was subscribed. Test helper.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .dropped
    }
}

struct MemorySubscription {
    topic: String,
    rx: broadcast::Receiver<Envelope>,
}

#[async_trait]
impl BusSubscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<BusMessage>, BusError> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => {
                    return Ok(Some(BusMessage {
                        topic: self.topic.clone(),
                        envelope,
                        inner: MessageInner::Memory,
                    }));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(target: "rdp.bus", topic = %self.topic, lagged = n, "subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BusError> {
        let sender = self.sender(topic);
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.published += 1;
        if sender.send(envelope.clone()).is_err() {
            inner.dropped += 1;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        _group: &str,
    ) -> Result<Box<dyn BusSubscription>, BusError> {
        let rx = self.sender(topic).subscribe();
        Ok(Box::new(MemorySubscription {
            topic: topic.to_string(),
            rx,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event: &str) -> Envelope {
        Envelope {
            event: event.to_string(),
            data: json!({"run_id": 1, "trace_id": "t"}),
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe(topics::CRAWL_REQUEST, "workers").await.unwrap();
        bus.publish(topics::CRAWL_REQUEST, &envelope("crawl.request"))
            .await
            .unwrap();
        let message = sub.next().await.unwrap().unwrap();
        assert_eq!(message.topic, "crawl.request");
        assert_eq!(message.envelope.event, "crawl.request");
        message.ack().await.unwrap();
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = MemoryBus::new();
        let mut crawl = bus.subscribe(topics::CRAWL_REQUEST, "w").await.unwrap();
        let mut parse = bus.subscribe(topics::PARSE_RESULT, "w").await.unwrap();
        bus.publish(topics::PARSE_RESULT, &envelope("parse.result"))
            .await
            .unwrap();
        let message = parse.next().await.unwrap().unwrap();
        assert_eq!(message.envelope.event, "parse.result");
        // The crawl subscription saw nothing.
        let pending = tokio::time::timeout(Duration::from_millis(20), crawl.next()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn unsubscribed_publishes_are_counted_as_dropped() {
        let bus = MemoryBus::new();
        bus.publish(topics::RUN_STATUS, &envelope("run.started"))
            .await
            .unwrap();
        assert_eq!(bus.published(), 1);
        assert_eq!(bus.dropped(), 1);
    }
}
