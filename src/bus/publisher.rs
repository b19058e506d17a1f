//! Bus publisher
//!
//! Turns normalized ticks into durable bus records with local deduplication
//! and defensive failure handling.

use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dedup::DedupCache;
use crate::error::{MarketDataError, Result};
use crate::tick::Tick;

/// Retention window for suppressing duplicate publishes
const DEDUP_TTL: Duration = Duration::from_secs(1);
/// Period of the dedup expiry sweep
const DEDUP_SWEEP_PERIOD: Duration = Duration::from_secs(5);
/// Bound on one publish (per topic) including its broker confirmation
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);
/// Bound on broker connection establishment
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Publisher counters
#[derive(Debug, Clone)]
pub struct PublisherStats {
    pub published: u64,
    pub failed: u64,
    pub is_connected: bool,
}

/// Publishes ticks to every configured topic, keyed by symbol
pub struct BusPublisher {
    uri: String,
    topics: Vec<String>,
    client_id: String,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    is_connected: AtomicBool,
    dedup: Arc<DedupCache>,
    published: AtomicU64,
    failed: AtomicU64,
}

impl BusPublisher {
    /// Create a new publisher; no connection is made until [`connect`](Self::connect)
    pub fn new(config: &Config) -> Self {
        Self {
            uri: config.bus_uri.clone(),
            topics: config.bus_topics.clone(),
            client_id: config.bus_client_id.clone(),
            connection: RwLock::new(None),
            channel: RwLock::new(None),
            is_connected: AtomicBool::new(false),
            dedup: Arc::new(DedupCache::new(DEDUP_TTL)),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Connect once at startup and provision the configured topics.
    /// Provisioning failure is fatal to startup.
    pub async fn connect(&self) -> Result<()> {
        info!(uri = %self.uri, "Connecting bus publisher");

        let props = ConnectionProperties::default()
            .with_connection_name(self.client_id.clone().into());

        let connection = timeout(CONNECT_TIMEOUT, Connection::connect(&self.uri, props))
            .await
            .map_err(|_| MarketDataError::ConnectionTimeout)??;

        let channel = connection.create_channel().await?;

        // Per-publish broker confirmations on a single channel keep the
        // transport from silently duplicating or reordering on retry.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        self.ensure_topics(&channel).await?;

        *self.connection.write().await = Some(connection);
        *self.channel.write().await = Some(channel);
        self.is_connected.store(true, Ordering::Release);
        Arc::clone(&self.dedup).spawn_sweeper(DEDUP_SWEEP_PERIOD);

        info!(topics = ?self.topics, "Bus publisher connected");
        Ok(())
    }

    /// Declare every configured topic, creating any that are missing
    async fn ensure_topics(&self, channel: &Channel) -> Result<()> {
        for topic in &self.topics {
            channel
                .exchange_declare(
                    topic,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    MarketDataError::BusError(format!("Failed to provision topic {topic}: {e}"))
                })?;

            debug!(topic = %topic, "Topic ready");
        }
        Ok(())
    }

    /// Publish a tick to every configured topic.
    ///
    /// Returns false without side effects when the bus is down — ticks are
    /// real-time and a dropped update beats unbounded queuing. A tick whose
    /// key was seen within the retention window is treated as already
    /// delivered. True only when every topic confirms.
    pub async fn publish(&self, tick: &Tick) -> bool {
        if !self.is_connected.load(Ordering::Acquire) {
            return false;
        }

        if self.dedup.seen(&tick.dedup_key()) {
            return true;
        }

        let payload = match serde_json::to_vec(tick) {
            Ok(payload) => payload,
            Err(e) => {
                error!(symbol = %tick.symbol, error = %e, "Tick serialization failed");
                self.failed.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        let channel_guard = self.channel.read().await;
        let Some(channel) = channel_guard.as_ref() else {
            return false;
        };

        for topic in &self.topics {
            if let Err(e) = publish_one(channel, topic, &tick.symbol, &payload).await {
                warn!(topic = %topic, symbol = %tick.symbol, error = %e, "Bus publish failed");
                self.failed.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Release the connection. Nothing is buffered, so there is nothing to
    /// flush.
    pub async fn disconnect(&self) {
        self.is_connected.store(false, Ordering::Release);

        if let Some(channel) = self.channel.write().await.take() {
            let _ = channel.close(200, "Normal shutdown").await;
        }
        if let Some(connection) = self.connection.write().await.take() {
            let _ = connection.close(200, "Normal shutdown").await;
        }

        info!("Bus publisher disconnected");
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    /// Get publisher counters
    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            is_connected: self.is_connected(),
        }
    }
}

async fn publish_one(channel: &Channel, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
    let publish = async {
        let confirm = channel
            .basic_publish(
                topic,
                key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await?;
        confirm.await?;
        Ok::<_, lapin::Error>(())
    };

    timeout(PUBLISH_TIMEOUT, publish)
        .await
        .map_err(|_| MarketDataError::ConnectionTimeout)?
        .map_err(MarketDataError::from)
}
