//! Subscription registry and broadcast path
//!
//! Owns the bidirectional symbol/connection index and the live connection
//! handles. Index mutations and broadcast pruning contend per symbol, not
//! globally.

use axum::extract::ws::Message;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dedup::DedupCache;
use crate::tick::Tick;

/// Broadcast-side retention window for re-delivery noise
const DEDUP_TTL: Duration = Duration::from_secs(1);
/// Period of the dedup expiry sweep
const DEDUP_SWEEP_PERIOD: Duration = Duration::from_secs(5);
/// Connection-count log granularity
const CLIENT_COUNT_LOG_STEP: usize = 10;

/// Downstream connection identifier
pub type ConnectionId = u64;

/// Outbound hand-off to one connection's writer task
pub type ClientSender = mpsc::UnboundedSender<Message>;

/// Tracks live downstream connections and their symbol subscriptions.
///
/// Invariant: a connection is in `by_symbol[s]` iff `s` is in that
/// connection's subscription set; symbol entries are dropped as soon as
/// their connection set empties.
pub struct SubscriptionRegistry {
    clients: DashMap<ConnectionId, ClientSender>,
    subscriptions: DashMap<ConnectionId, HashSet<String>>,
    by_symbol: DashMap<String, HashSet<ConnectionId>>,
    dedup: Arc<DedupCache>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            subscriptions: DashMap::new(),
            by_symbol: DashMap::new(),
            dedup: Arc::new(DedupCache::new(DEDUP_TTL)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new connection with an empty subscription set
    pub fn register(&self, sender: ClientSender) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.insert(id, sender);
        self.subscriptions.insert(id, HashSet::new());

        let count = self.clients.len();
        if count % CLIENT_COUNT_LOG_STEP == 0 {
            info!(clients = count, "Active downstream connections");
        }

        id
    }

    /// Add symbols (uppercased) to a connection's set, returning the full
    /// current set
    pub fn subscribe(&self, id: ConnectionId, symbols: &[String]) -> Vec<String> {
        for symbol in symbols {
            let symbol = symbol.to_uppercase();

            let registered = match self.subscriptions.get_mut(&id) {
                Some(mut subs) => {
                    subs.insert(symbol.clone());
                    true
                }
                // Connection already gone; don't leave a dangling index entry.
                None => false,
            };

            if registered {
                self.by_symbol.entry(symbol).or_default().insert(id);
            }
        }

        self.current_set(id)
    }

    /// Remove symbols from a connection's set, returning the full current
    /// set. Symbol entries left empty are dropped from the index.
    pub fn unsubscribe(&self, id: ConnectionId, symbols: &[String]) -> Vec<String> {
        for symbol in symbols {
            let symbol = symbol.to_uppercase();

            if let Some(mut subs) = self.subscriptions.get_mut(&id) {
                subs.remove(&symbol);
            }
            self.remove_subscriber(&symbol, id);
        }

        self.current_set(id)
    }

    /// Remove a connection and take it out of every symbol set it belonged to
    pub fn disconnect(&self, id: ConnectionId) {
        self.clients.remove(&id);

        if let Some((_, symbols)) = self.subscriptions.remove(&id) {
            for symbol in symbols {
                self.remove_subscriber(&symbol, id);
            }
        }

        debug!(connection = id, "Connection deregistered");
    }

    /// Broadcast a tick to the connections subscribed to its symbol.
    /// Returns the number of successful sends.
    pub fn broadcast(&self, tick: &Tick) -> usize {
        if self.dedup.seen(&tick.dedup_key()) {
            return 0;
        }

        // Snapshot the subscriber set so concurrent (un)subscribes never
        // corrupt the iteration.
        let targets: Vec<ConnectionId> = match self.by_symbol.get(&tick.symbol) {
            Some(subscribers) if !subscribers.is_empty() => {
                subscribers.iter().copied().collect()
            }
            // No subscribers for this symbol; not an error.
            _ => return 0,
        };

        let payload = match serde_json::to_string(tick) {
            Ok(json) => json,
            Err(e) => {
                warn!(symbol = %tick.symbol, error = %e, "Tick serialization failed");
                return 0;
            }
        };

        let mut sent = 0;
        for id in targets {
            let delivered = self
                .clients
                .get(&id)
                .map(|sender| sender.send(Message::Text(payload.clone())).is_ok())
                .unwrap_or(false);

            if delivered {
                sent += 1;
            } else {
                // Lazy cleanup: a closed or failed connection is pruned here
                // instead of waiting for a separate sweep.
                warn!(connection = id, symbol = %tick.symbol, "Pruning dead subscriber");
                self.remove_subscriber(&tick.symbol, id);
            }
        }

        sent
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of connections subscribed to a symbol
    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.by_symbol.get(symbol).map(|s| s.len()).unwrap_or(0)
    }

    /// Whether a connection is currently subscribed to a symbol
    pub fn is_subscribed(&self, id: ConnectionId, symbol: &str) -> bool {
        self.subscriptions
            .get(&id)
            .map(|subs| subs.contains(symbol))
            .unwrap_or(false)
    }

    /// Start the periodic dedup expiry sweep; called once at server startup
    pub fn spawn_dedup_sweeper(&self) -> JoinHandle<()> {
        Arc::clone(&self.dedup).spawn_sweeper(DEDUP_SWEEP_PERIOD)
    }

    fn current_set(&self, id: ConnectionId) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .subscriptions
            .get(&id)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default();
        symbols.sort();
        symbols
    }

    fn remove_subscriber(&self, symbol: &str, id: ConnectionId) {
        if let Some(mut subscribers) = self.by_symbol.get_mut(symbol) {
            subscribers.remove(&id);
            let empty = subscribers.is_empty();
            drop(subscribers);

            if empty {
                self.by_symbol.remove_if(symbol, |_, set| set.is_empty());
            }
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn tick(symbol: &str) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            bid: dec!(100.5),
            ask: dec!(100.6),
        }
    }

    fn connect(registry: &SubscriptionRegistry) -> (ConnectionId, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.register(tx), rx)
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_subscribe_returns_full_current_set() {
        let registry = SubscriptionRegistry::new();
        let (id, _rx) = connect(&registry);

        assert_eq!(registry.subscribe(id, &symbols(&["btcusd"])), vec!["BTCUSD"]);
        assert_eq!(
            registry.subscribe(id, &symbols(&["ETHUSD"])),
            vec!["BTCUSD", "ETHUSD"]
        );
    }

    #[test]
    fn test_index_stays_consistent() {
        let registry = SubscriptionRegistry::new();
        let (id, _rx) = connect(&registry);

        registry.subscribe(id, &symbols(&["BTCUSD", "ETHUSD"]));
        assert!(registry.is_subscribed(id, "BTCUSD"));
        assert_eq!(registry.subscriber_count("BTCUSD"), 1);

        registry.unsubscribe(id, &symbols(&["BTCUSD"]));
        assert!(!registry.is_subscribed(id, "BTCUSD"));
        assert_eq!(registry.subscriber_count("BTCUSD"), 0);
        assert!(registry.is_subscribed(id, "ETHUSD"));
    }

    #[test]
    fn test_disconnect_clears_every_symbol_set() {
        let registry = SubscriptionRegistry::new();
        let (id, _rx) = connect(&registry);

        registry.subscribe(id, &symbols(&["BTCUSD", "ETHUSD", "SOLUSD"]));
        registry.disconnect(id);

        for symbol in ["BTCUSD", "ETHUSD", "SOLUSD"] {
            assert_eq!(registry.subscriber_count(symbol), 0);
        }
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_empty_symbol_entries_are_dropped() {
        let registry = SubscriptionRegistry::new();
        let (id, _rx) = connect(&registry);

        registry.subscribe(id, &symbols(&["BTCUSD"]));
        registry.unsubscribe(id, &symbols(&["BTCUSD"]));

        // The index entry itself is gone, not just emptied.
        assert!(registry.by_symbol.get("BTCUSD").is_none());
    }

    #[test]
    fn test_broadcast_reaches_subscribers_only() {
        let registry = SubscriptionRegistry::new();
        let (btc_id, mut btc_rx) = connect(&registry);
        let (eth_id, mut eth_rx) = connect(&registry);

        registry.subscribe(btc_id, &symbols(&["BTCUSD"]));
        registry.subscribe(eth_id, &symbols(&["ETHUSD"]));

        assert_eq!(registry.broadcast(&tick("BTCUSD")), 1);
        assert!(btc_rx.try_recv().is_ok());
        assert!(eth_rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_without_subscribers_returns_zero() {
        let registry = SubscriptionRegistry::new();
        let (_id, _rx) = connect(&registry);

        assert_eq!(registry.broadcast(&tick("BTCUSD")), 0);
    }

    #[test]
    fn test_broadcast_suppresses_redelivery() {
        let registry = SubscriptionRegistry::new();
        let (id, mut rx) = connect(&registry);
        registry.subscribe(id, &symbols(&["BTCUSD"]));

        let tick = tick("BTCUSD");
        assert_eq!(registry.broadcast(&tick), 1);
        assert_eq!(registry.broadcast(&tick), 0);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_prunes_dead_connections() {
        let registry = SubscriptionRegistry::new();
        let (alive_id, mut alive_rx) = connect(&registry);
        let (dead_id, dead_rx) = connect(&registry);

        registry.subscribe(alive_id, &symbols(&["BTCUSD"]));
        registry.subscribe(dead_id, &symbols(&["BTCUSD"]));
        drop(dead_rx);

        // One live send; the dead connection is pruned in passing.
        assert_eq!(registry.broadcast(&tick("BTCUSD")), 1);
        assert!(alive_rx.try_recv().is_ok());
        assert_eq!(registry.subscriber_count("BTCUSD"), 1);
    }

    #[test]
    fn test_ticker_frame_reaches_only_its_subscribers() {
        use crate::parser::FeedFrame;

        let registry = SubscriptionRegistry::new();
        let (btc_id, mut btc_rx) = connect(&registry);
        let (eth_id, mut eth_rx) = connect(&registry);

        registry.subscribe(btc_id, &symbols(&["BTCUSD"]));
        registry.subscribe(eth_id, &symbols(&["ETHUSD"]));

        let raw = r#"[0,{"a":["39485.40","1","1.000"],"b":["39485.30","1","1.000"]},"ticker","XBT/USD"]"#;
        let FeedFrame::Ticker(tick) = FeedFrame::parse(raw).unwrap() else {
            panic!("Expected Ticker");
        };

        assert_eq!(registry.broadcast(&tick), 1);

        let Message::Text(pushed) = btc_rx.try_recv().unwrap() else {
            panic!("Expected text frame");
        };
        let json: serde_json::Value = serde_json::from_str(&pushed).unwrap();
        assert_eq!(json["symbol"], "BTCUSD");
        assert_eq!(json["bid"], 39485.30);
        assert_eq!(json["ask"], 39485.40);

        assert!(eth_rx.try_recv().is_err());
    }

    #[test]
    fn test_subscribe_after_disconnect_is_inert() {
        let registry = SubscriptionRegistry::new();
        let (id, _rx) = connect(&registry);
        registry.disconnect(id);

        assert!(registry.subscribe(id, &symbols(&["BTCUSD"])).is_empty());
        assert_eq!(registry.subscriber_count("BTCUSD"), 0);
    }
}
