//! Pipeline orchestrator
//!
//! Starts components in dependency order, tears them down in reverse, and
//! bounds the shutdown sequence with a global timeout.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::bus::{BridgeConsumer, BusPublisher};
use crate::config::Config;
use crate::feed::FeedManager;
use crate::server::{self, SubscriptionRegistry};

/// Bound on the whole shutdown sequence; past this the process exits dirty
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Wires the components together and owns their lifecycles
pub struct Pipeline {
    config: Arc<Config>,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Run the pipeline until a termination signal arrives.
    ///
    /// Startup order: bus publisher → fan-out server → bridge consumer →
    /// feed client, so the bus side is ready before the feed produces.
    /// Any startup failure tears down whatever already started and errors
    /// out; shutdown runs in exact reverse.
    pub async fn run(&self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let publisher = Arc::new(BusPublisher::new(&self.config));
        if let Err(e) = publisher.connect().await {
            anyhow::bail!("Bus publisher startup failed: {e}");
        }

        let registry = Arc::new(SubscriptionRegistry::new());
        let server_handle =
            match server::serve(&self.config, Arc::clone(&registry), shutdown_rx.clone()).await {
                Ok(handle) => handle,
                Err(e) => {
                    publisher.disconnect().await;
                    anyhow::bail!("Fan-out server startup failed: {e}");
                }
            };

        let consumer = Arc::new(BridgeConsumer::new(
            &self.config,
            Arc::clone(&registry),
            shutdown_rx.clone(),
        ));
        if let Err(e) = consumer.start().await {
            let _ = shutdown_tx.send(true);
            let _ = server_handle.await;
            publisher.disconnect().await;
            anyhow::bail!("Bridge consumer startup failed: {e}");
        }

        let mut feed = FeedManager::new(&self.config, Arc::clone(&publisher), shutdown_rx);
        let feed_handle = tokio::spawn(async move {
            if let Err(e) = feed.run().await {
                // Terminal for the feed only: bus and fan-out stay healthy,
                // but no further ticks arrive until an external restart.
                error!(error = %e, "Feed client gave up");
            }
        });

        info!("Market data pipeline ready (feed → bus → fan-out)");

        wait_for_termination_signal().await;

        info!("Shutting down market data pipeline");

        let teardown = shutdown_components(
            shutdown_tx,
            feed_handle,
            consumer,
            server_handle,
            publisher,
        );
        match timeout(SHUTDOWN_TIMEOUT, teardown).await {
            Ok(()) => {
                info!("Shutdown complete");
                Ok(())
            }
            Err(_) => anyhow::bail!(
                "Graceful shutdown timed out after {}s",
                SHUTDOWN_TIMEOUT.as_secs()
            ),
        }
    }
}

/// Reverse-order teardown; each step is isolated so one failure cannot block
/// the next.
async fn shutdown_components(
    shutdown_tx: watch::Sender<bool>,
    feed_handle: JoinHandle<()>,
    consumer: Arc<BridgeConsumer>,
    server_handle: JoinHandle<()>,
    publisher: Arc<BusPublisher>,
) {
    let _ = shutdown_tx.send(true);

    info!("Stopping feed client");
    if let Err(e) = feed_handle.await {
        warn!(error = %e, "Feed task ended abnormally");
    }

    info!("Stopping bridge consumer");
    consumer.stop().await;

    info!("Stopping fan-out server");
    if let Err(e) = server_handle.await {
        warn!(error = %e, "Server task ended abnormally");
    }

    info!("Stopping bus publisher");
    publisher.disconnect().await;
}

async fn wait_for_termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
            return;
        }
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received SIGINT");
    }
}
