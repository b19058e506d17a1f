//! WebSocket transport for the upstream exchange feed
//!
//! Handles connection, ticker subscription, and frame reception.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::protocol::{Message, WebSocketConfig},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::{MarketDataError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bound on the initial connection handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum accepted payload size, protecting against runaway frames (5MB)
const MAX_PAYLOAD_BYTES: usize = 5 * 1024 * 1024;

/// WebSocket transport for a single upstream connection
pub struct FeedTransport {
    stream: Option<WsStream>,
    url: String,
    pairs: Vec<String>,
}

impl FeedTransport {
    /// Create a new transport for the given feed URL and instrument pairs
    pub fn new(url: &str, pairs: Vec<String>) -> Self {
        Self {
            stream: None,
            url: url.to_string(),
            pairs,
        }
    }

    /// Open the connection, bounded by the handshake timeout
    pub async fn connect(&mut self) -> Result<()> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(MAX_PAYLOAD_BYTES);
        ws_config.max_frame_size = Some(MAX_PAYLOAD_BYTES);

        info!(url = %self.url, "Connecting to upstream feed");

        let connecting = connect_async_with_config(&self.url, Some(ws_config), false);
        let (ws_stream, response) = timeout(HANDSHAKE_TIMEOUT, connecting)
            .await
            .map_err(|_| MarketDataError::ConnectionTimeout)?
            .map_err(MarketDataError::from)?;

        info!(status = ?response.status(), "Feed connection established");
        self.stream = Some(ws_stream);

        Ok(())
    }

    /// Send the ticker subscription request for the configured pairs.
    /// The acknowledgment arrives later as a subscriptionStatus frame and
    /// is logged, not awaited.
    pub async fn subscribe(&mut self) -> Result<()> {
        let request = json!({
            "event": "subscribe",
            "pair": self.pairs,
            "subscription": { "name": "ticker" }
        });

        info!(pairs = ?self.pairs, "Subscribing to ticker channel");
        self.send_text(request.to_string()).await
    }

    /// Receive the next text frame; protocol pings are answered inline
    pub async fn recv(&mut self) -> Result<Option<String>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| MarketDataError::WebSocketConnection("Not connected".to_string()))?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!(len = text.len(), "Received text frame");
                Ok(Some(text))
            }
            Some(Ok(Message::Binary(data))) => {
                let text = String::from_utf8_lossy(&data).to_string();
                Ok(Some(text))
            }
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Some(stream) = self.stream.as_mut() {
                    let _ = stream.send(Message::Pong(data)).await;
                }
                Ok(None)
            }
            Some(Ok(Message::Pong(_))) => {
                debug!("Received pong");
                Ok(None)
            }
            Some(Ok(Message::Close(frame))) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                warn!(code = ?code, reason = ?frame.as_ref().map(|f| f.reason.to_string()), "Received close frame");
                self.stream = None;
                Err(MarketDataError::ConnectionClosed { code })
            }
            Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                self.stream = None;
                Err(e.into())
            }
            None => {
                warn!("WebSocket stream ended");
                self.stream = None;
                Err(MarketDataError::WebSocketConnection(
                    "Stream ended".to_string(),
                ))
            }
        }
    }

    /// Send a ping to keep the connection alive
    pub async fn ping(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream
                .send(Message::Ping(vec![]))
                .await
                .map_err(|e| MarketDataError::WebSocketMessage(e.to_string()))?;
        }
        Ok(())
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Close the connection gracefully if open
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| MarketDataError::WebSocketConnection("Not connected".to_string()))?;

        stream
            .send(Message::Text(text))
            .await
            .map_err(|e| MarketDataError::WebSocketMessage(e.to_string()))
    }
}
