//! Bridge consumer
//!
//! Moves records from the bus to the fan-out layer. Acknowledgments are
//! manual and happen only after downstream hand-off, giving at-least-once
//! delivery; the fan-out dedup cache absorbs the resulting re-deliveries.

use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Connection, ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dedup::DedupCache;
use crate::error::{MarketDataError, Result};
use crate::server::SubscriptionRegistry;
use crate::tick::Tick;

/// Retention window absorbing bursts of redundant re-delivery
const DEDUP_TTL: Duration = Duration::from_secs(60);
/// Period of the dedup expiry sweep
const DEDUP_SWEEP_PERIOD: Duration = Duration::from_secs(60);
/// Bound on broker connection establishment
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// What became of one consumed record
#[derive(Debug, PartialEq, Eq)]
enum RecordOutcome {
    /// Forwarded to this many subscribers
    Forwarded(usize),
    /// Suppressed as a recent re-delivery
    Duplicate,
    /// Unparseable; skipped so a single bad record can never stall the feed
    Malformed,
}

/// Consumes bus records and forwards them to the fan-out broadcast path
pub struct BridgeConsumer {
    uri: String,
    topics: Vec<String>,
    client_id: String,
    group: String,
    registry: Arc<SubscriptionRegistry>,
    connection: RwLock<Option<Connection>>,
    tasks: RwLock<Vec<JoinHandle<()>>>,
    dedup: Arc<DedupCache>,
    shutdown: watch::Receiver<bool>,
}

impl BridgeConsumer {
    /// Create a new bridge consumer
    pub fn new(
        config: &Config,
        registry: Arc<SubscriptionRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            uri: config.bus_uri.clone(),
            topics: config.bus_topics.clone(),
            client_id: config.bus_client_id.clone(),
            group: config.bus_consumer_group.clone(),
            registry,
            connection: RwLock::new(None),
            tasks: RwLock::new(Vec::new()),
            dedup: Arc::new(DedupCache::new(DEDUP_TTL)),
            shutdown,
        }
    }

    /// Connect and start one consumer task per configured topic.
    ///
    /// Each topic gets a fresh exclusive queue, so consumption starts at the
    /// live edge and never replays history. Liveness heartbeats are
    /// negotiated on the connection and serviced by the client's reactor
    /// independently of record processing.
    pub async fn start(&self) -> Result<()> {
        let props = ConnectionProperties::default()
            .with_connection_name(format!("{}-consumer", self.client_id).into());

        let connection = timeout(CONNECT_TIMEOUT, Connection::connect(&self.uri, props))
            .await
            .map_err(|_| MarketDataError::ConnectionTimeout)??;

        for topic in &self.topics {
            let channel = connection.create_channel().await?;

            let queue = channel
                .queue_declare(
                    "",
                    QueueDeclareOptions {
                        exclusive: true,
                        auto_delete: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;

            channel
                .queue_bind(
                    queue.name().as_str(),
                    topic,
                    "#",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;

            let mut consumer = channel
                .basic_consume(
                    queue.name().as_str(),
                    &format!("{}-{}", self.group, topic),
                    BasicConsumeOptions {
                        no_ack: false,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;

            info!(topic = %topic, queue = %queue.name().as_str(), "Bridge consumer subscribed");

            let registry = Arc::clone(&self.registry);
            let dedup = Arc::clone(&self.dedup);
            let topic = topic.clone();
            let mut shutdown = self.shutdown.clone();

            let handle = tokio::spawn(async move {
                // The channel must outlive its consumer stream.
                let _channel = channel;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        delivery = consumer.next() => match delivery {
                            Some(Ok(delivery)) => handle_record(delivery, &registry, &dedup).await,
                            Some(Err(e)) => {
                                error!(topic = %topic, error = %e, "Bus consume error");
                            }
                            None => {
                                warn!(topic = %topic, "Bus consumer stream ended");
                                break;
                            }
                        }
                    }
                }
                debug!(topic = %topic, "Bridge consumer task stopped");
            });

            self.tasks.write().await.push(handle);
        }

        self.tasks
            .write()
            .await
            .push(Arc::clone(&self.dedup).spawn_sweeper(DEDUP_SWEEP_PERIOD));

        *self.connection.write().await = Some(connection);

        info!(topics = ?self.topics, "Bridge consumer started");
        Ok(())
    }

    /// Stop consuming and release the connection
    pub async fn stop(&self) {
        for handle in self.tasks.write().await.drain(..) {
            handle.abort();
        }

        if let Some(connection) = self.connection.write().await.take() {
            let _ = connection.close(200, "Normal shutdown").await;
        }

        info!("Bridge consumer stopped");
    }
}

/// Process one record end-to-end, then acknowledge it. Every path
/// acknowledges — malformed records are skipped with a warning rather than
/// left to redeliver forever.
async fn handle_record(
    delivery: Delivery,
    registry: &SubscriptionRegistry,
    dedup: &DedupCache,
) {
    match process_record(&delivery.data, registry, dedup) {
        RecordOutcome::Forwarded(count) => {
            debug!(subscribers = count, "Record forwarded");
        }
        RecordOutcome::Duplicate => debug!("Duplicate record suppressed"),
        RecordOutcome::Malformed => {
            warn!(routing_key = %delivery.routing_key.as_str(), "Skipping malformed bus record");
        }
    }

    // Acknowledge only after the forward: a crash before this point
    // re-delivers the record and the broadcast dedup absorbs it.
    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        warn!(error = %e, "Record acknowledgment failed");
    }
}

fn process_record(
    payload: &[u8],
    registry: &SubscriptionRegistry,
    dedup: &DedupCache,
) -> RecordOutcome {
    let tick: Tick = match serde_json::from_slice(payload) {
        Ok(tick) => tick,
        Err(_) => return RecordOutcome::Malformed,
    };

    if dedup.seen(&tick.dedup_key()) {
        return RecordOutcome::Duplicate;
    }

    RecordOutcome::Forwarded(registry.broadcast(&tick))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_context() -> (Arc<SubscriptionRegistry>, DedupCache) {
        (
            Arc::new(SubscriptionRegistry::new()),
            DedupCache::new(DEDUP_TTL),
        )
    }

    #[test]
    fn test_valid_record_is_forwarded() {
        let (registry, dedup) = fresh_context();
        let payload =
            br#"{"symbol":"BTCUSD","timestamp":"2023-01-01T00:00:00.000Z","bid":39485.3,"ask":39485.4}"#;

        // No subscribers yet: forwarded, reaching zero connections.
        assert_eq!(
            process_record(payload, &registry, &dedup),
            RecordOutcome::Forwarded(0)
        );
    }

    #[test]
    fn test_redelivered_record_is_suppressed() {
        let (registry, dedup) = fresh_context();
        let payload =
            br#"{"symbol":"BTCUSD","timestamp":"2023-01-01T00:00:00.000Z","bid":39485.3,"ask":39485.4}"#;

        assert_eq!(
            process_record(payload, &registry, &dedup),
            RecordOutcome::Forwarded(0)
        );
        assert_eq!(
            process_record(payload, &registry, &dedup),
            RecordOutcome::Duplicate
        );
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let (registry, dedup) = fresh_context();

        assert_eq!(
            process_record(b"not json", &registry, &dedup),
            RecordOutcome::Malformed
        );
        assert_eq!(
            process_record(br#"{"symbol":"BTCUSD"}"#, &registry, &dedup),
            RecordOutcome::Malformed
        );
    }
}
