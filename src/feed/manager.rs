//! Feed connection manager
//!
//! Drives the connection-resilience state machine: reconnect with capped
//! exponential backoff, keepalive pings, and staleness detection.

use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};

use super::FeedTransport;
use crate::bus::BusPublisher;
use crate::config::Config;
use crate::error::{MarketDataError, Result};
use crate::parser::FeedFrame;
use crate::stats::ThroughputMonitor;

/// Base reconnect delay (5 seconds)
const BACKOFF_BASE_MS: u64 = 5_000;
/// Maximum reconnect delay (1 minute)
const BACKOFF_CAP_MS: u64 = 60_000;
/// Random jitter added to each scheduled reconnect (up to 1 second)
const BACKOFF_JITTER_MS: u64 = 1_000;
/// Hard ceiling on reconnect attempts; past this the feed stays down
const MAX_RECONNECT_ATTEMPTS: u32 = 30;
/// Keepalive ping period while connected
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);
/// Staleness check period
const HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(30);
/// A connection with no parsed tick for this long is treated as stalled
const STALL_THRESHOLD: Duration = Duration::from_secs(120);

/// Feed connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Subscribing,
    Streaming,
    Closing,
}

/// How a connection attempt ended
enum ConnectionEnd {
    /// Error path: reconnect after the backoff delay
    Scheduled,
    /// Abnormal closure or stall: reconnect without waiting
    Immediate,
    /// Shutdown was requested
    Shutdown,
}

/// Manages the upstream feed connection and hands normalized ticks to the
/// bus publisher
pub struct FeedManager {
    transport: FeedTransport,
    publisher: Arc<BusPublisher>,
    state: FeedState,
    reconnect_attempts: u32,
    shutdown: watch::Receiver<bool>,
    throughput: ThroughputMonitor,
}

impl FeedManager {
    /// Create a new feed manager
    pub fn new(
        config: &Config,
        publisher: Arc<BusPublisher>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let transport = FeedTransport::new(&config.feed_url, config.feed_pairs.clone());

        Self {
            transport,
            publisher,
            state: FeedState::Disconnected,
            reconnect_attempts: 0,
            shutdown,
            throughput: ThroughputMonitor::new(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> FeedState {
        self.state
    }

    /// Run until shutdown is requested or reconnection is exhausted.
    ///
    /// Reconnect exhaustion is terminal for the feed only: the error is
    /// returned for the caller to report, and no further attempts are made.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if *self.shutdown.borrow() {
                return self.close().await;
            }

            match self.connect_and_stream().await {
                ConnectionEnd::Shutdown => return self.close().await,
                ConnectionEnd::Immediate => {
                    warn!("Transient closure, reconnecting immediately");
                }
                ConnectionEnd::Scheduled => {
                    self.reconnect_attempts += 1;

                    let Some(delay) = reconnect_delay(self.reconnect_attempts) else {
                        error!(
                            attempts = MAX_RECONNECT_ATTEMPTS,
                            "Failed to reconnect, giving up; feed requires external restart"
                        );
                        return Err(MarketDataError::MaxReconnectAttemptsExceeded);
                    };

                    info!(
                        attempt = self.reconnect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnecting after backoff"
                    );

                    // Shutdown can arrive mid-backoff.
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// One connection attempt: connect, subscribe, then stream frames until
    /// the connection ends.
    async fn connect_and_stream(&mut self) -> ConnectionEnd {
        self.set_state(FeedState::Connecting);

        if let Err(e) = self.transport.connect().await {
            error!(error = %e, "Feed connect failed");
            self.set_state(FeedState::Disconnected);
            return ConnectionEnd::Scheduled;
        }

        // A successful connection resets the attempt counter.
        self.reconnect_attempts = 0;
        self.set_state(FeedState::Subscribing);

        if let Err(e) = self.transport.subscribe().await {
            error!(error = %e, "Ticker subscription failed");
            self.transport.close().await;
            self.set_state(FeedState::Disconnected);
            return ConnectionEnd::Scheduled;
        }

        // The subscription acknowledgment is logged when it arrives;
        // streaming starts without waiting for it.
        self.set_state(FeedState::Streaming);

        // Timers live in this scope only, so nothing can fire against a
        // replaced connection after the attempt ends.
        let mut keepalive = interval(KEEPALIVE_PERIOD);
        let mut health = interval(HEALTH_CHECK_PERIOD);
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    return ConnectionEnd::Shutdown;
                }
                _ = keepalive.tick() => {
                    if let Err(e) = self.transport.ping().await {
                        warn!(error = %e, "Keepalive ping failed");
                        self.set_state(FeedState::Disconnected);
                        return ConnectionEnd::Scheduled;
                    }
                }
                _ = health.tick() => {
                    if last_tick.elapsed() > STALL_THRESHOLD {
                        warn!(
                            stalled_secs = last_tick.elapsed().as_secs(),
                            "No ticks within stall threshold, forcing reconnect"
                        );
                        self.transport.close().await;
                        self.set_state(FeedState::Disconnected);
                        return ConnectionEnd::Immediate;
                    }
                }
                frame = self.transport.recv() => {
                    match frame {
                        Ok(Some(text)) => {
                            if self.handle_frame(&text).await {
                                last_tick = Instant::now();
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            self.set_state(FeedState::Disconnected);
                            if e.is_abnormal_closure() {
                                warn!(error = %e, "Feed connection closed abnormally");
                                return ConnectionEnd::Immediate;
                            }
                            warn!(error = %e, "Feed connection lost");
                            return ConnectionEnd::Scheduled;
                        }
                    }
                }
            }
        }
    }

    /// Process one inbound frame. Returns true when a tick was parsed.
    async fn handle_frame(&mut self, raw: &str) -> bool {
        match FeedFrame::parse(raw) {
            Ok(FeedFrame::Ticker(tick)) => {
                if !self.publisher.publish(&tick).await {
                    warn!(symbol = %tick.symbol, "Tick hand-off to bus failed");
                }
                if let Some(rate) = self.throughput.record() {
                    info!(msgs_per_sec = rate, "Feed throughput");
                }
                true
            }
            Ok(FeedFrame::Status(status)) => {
                if status.status.as_deref() == Some("subscribed") {
                    info!(pair = ?status.pair, "Ticker subscription confirmed");
                } else {
                    debug!(
                        status = ?status.status,
                        error = ?status.error_message,
                        "Subscription status"
                    );
                }
                false
            }
            Ok(FeedFrame::Ignored) => false,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable frame");
                false
            }
        }
    }

    /// Terminal shutdown: no further reconnects are scheduled and the
    /// transport is closed gracefully if open.
    async fn close(&mut self) -> Result<()> {
        self.set_state(FeedState::Closing);
        self.transport.close().await;
        self.set_state(FeedState::Disconnected);
        info!("Feed client stopped");
        Ok(())
    }

    fn set_state(&mut self, next: FeedState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "Feed state transition");
            self.state = next;
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based): exponential backoff
/// from the base delay plus up to one second of jitter, capped at the
/// maximum. Returns None once the attempt ceiling is exceeded.
fn reconnect_delay(attempt: u32) -> Option<Duration> {
    if attempt > MAX_RECONNECT_ATTEMPTS {
        return None;
    }

    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << (attempt - 1).min(30));
    let jitter = rand::rng().random_range(0..BACKOFF_JITTER_MS);

    Some(Duration::from_millis((base + jitter).min(BACKOFF_CAP_MS)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds() {
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            let delay = reconnect_delay(attempt).unwrap().as_millis() as u64;

            let base = BACKOFF_BASE_MS.saturating_mul(1u64 << (attempt - 1).min(30));
            let lower = base.min(BACKOFF_CAP_MS);
            let upper = (base + BACKOFF_JITTER_MS).min(BACKOFF_CAP_MS);

            assert!(
                delay >= lower && delay <= upper,
                "attempt {attempt}: delay {delay} outside [{lower}, {upper}]"
            );
        }
    }

    #[test]
    fn test_backoff_first_attempts_double() {
        // Jitter aside, attempts 1-3 start at 5s, 10s, 20s.
        for (attempt, base) in [(1u32, 5_000u64), (2, 10_000), (3, 20_000)] {
            let delay = reconnect_delay(attempt).unwrap().as_millis() as u64;
            assert!(delay >= base && delay < base + BACKOFF_JITTER_MS);
        }
    }

    #[test]
    fn test_backoff_caps_at_one_minute() {
        let delay = reconnect_delay(MAX_RECONNECT_ATTEMPTS).unwrap();
        assert_eq!(delay.as_millis() as u64, BACKOFF_CAP_MS);
    }

    #[test]
    fn test_no_reconnect_past_ceiling() {
        assert!(reconnect_delay(MAX_RECONNECT_ATTEMPTS + 1).is_none());
    }

    #[tokio::test]
    async fn test_manager_starts_disconnected() {
        let config = Config::default();
        let publisher = Arc::new(BusPublisher::new(&config));
        let (_tx, rx) = watch::channel(false);

        let manager = FeedManager::new(&config, publisher, rx);
        assert_eq!(manager.state(), FeedState::Disconnected);
    }
}
