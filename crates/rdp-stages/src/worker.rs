// SPDX-License-Identifier: MIT OR Apache-2.0
//! Topic consumer loop.
//!
//! One loop per topic, single-flight: a message is fully processed before the
//! next one is read. Contract errors are logged and the message acknowledged
//! (skipped); everything else is negatively acknowledged so the bus redelivers
//! per its at-least-once policy. Shutdown drains the in-flight message first.

use crate::handler::HandlerRegistry;
use rdp_bus::{BusError, EventBus};
use rdp_error::ErrorClass;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Consume a topic until shutdown, dispatching envelopes through the registry.
///
/// # Errors
///
/// Returns [`BusError`] when the subscription cannot be created or the bus
/// connection is lost; supervision restarts the loop.
pub async fn run_consumer(
    bus: Arc<dyn EventBus>,
    registry: Arc<HandlerRegistry>,
    topic: &str,
    group: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BusError> {
    let mut subscription = bus.subscribe(topic, group).await?;
    info!(target: "rdp.stages", topic, group, "consumer started");

    loop {
        let message = tokio::select! {
            () = shutdown_requested(&mut shutdown) => {
                info!(target: "rdp.stages", topic, "consumer draining on shutdown");
                return Ok(());
            }
            message = subscription.next() => message?,
        };
        let Some(message) = message else {
            info!(target: "rdp.stages", topic, "bus closed, consumer stopping");
            return Ok(());
        };

        let Some(handler) = registry.get(&message.topic) else {
            warn!(
                target: "rdp.stages",
                topic = %message.topic,
                event = %message.envelope.event,
                "no handler registered, skipping message"
            );
            message.ack().await?;
            continue;
        };

        let envelope = message.envelope.clone();
        match handler.handle(&envelope).await {
            Ok(()) => message.ack().await?,
            Err(err) if err.class == ErrorClass::Contract => {
                warn!(
                    target: "rdp.stages",
                    topic,
                    event = %envelope.event,
                    error = %err,
                    "contract error, skipping message"
                );
                message.ack().await?;
            }
            Err(err) => {
                error!(
                    target: "rdp.stages",
                    topic,
                    event = %envelope.event,
                    class = %err.class,
                    error = %err.chain_message(),
                    "stage failed, requesting redelivery"
                );
                message.nak().await?;
            }
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // Already requested, or wait for the flag to flip.
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::StageHandler;
    use async_trait::async_trait;
    use rdp_bus::MemoryBus;
    use rdp_core::Envelope;
    use rdp_core::event::topics;
    use rdp_error::PipelineError;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingHandler {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StageHandler for RecordingHandler {
        fn topic(&self) -> &'static str {
            topics::CRAWL_REQUEST
        }

        async fn handle(&self, envelope: &Envelope) -> Result<(), PipelineError> {
            if envelope.data["url"].is_string() {
                self.seen
                    .lock()
                    .unwrap()
                    .push(envelope.data["url"].as_str().unwrap_or_default().to_string());
                Ok(())
            } else {
                Err(PipelineError::contract("missing url"))
            }
        }
    }

    #[tokio::test]
    async fn consumer_dispatches_in_order_and_survives_contract_errors() {
        let bus = MemoryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(RecordingHandler { seen: Arc::clone(&seen) }));
        let registry = Arc::new(registry);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = tokio::spawn(run_consumer(
            Arc::new(bus.clone()),
            registry,
            topics::CRAWL_REQUEST,
            "workers",
            shutdown_rx,
        ));
        // Give the consumer time to subscribe before publishing.
        tokio::time::sleep(Duration::from_millis(20)).await;

        for (event, data) in [
            ("crawl.request", json!({"url": "https://a.test"})),
            ("crawl.request", json!({"no_url": true})),
            ("crawl.request", json!({"url": "https://b.test"})),
        ] {
            bus.publish(
                topics::CRAWL_REQUEST,
                &Envelope {
                    event: event.into(),
                    data,
                },
            )
            .await
            .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["https://a.test".to_string(), "https://b.test".to_string()]
        );

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
