//! Error types for the market data pipeline

use thiserror::Error;

/// Market data pipeline errors
#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Connection closed (code {code:?})")]
    ConnectionClosed { code: Option<u16> },

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("Bus error: {0}")]
    BusError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Max reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,
}

impl MarketDataError {
    /// Close codes that indicate a transient network fault rather than a
    /// rejection; these skip the backoff schedule and reconnect immediately.
    pub fn is_abnormal_closure(&self) -> bool {
        matches!(
            self,
            MarketDataError::ConnectionClosed {
                code: Some(1001) | Some(1006)
            }
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketDataError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError};

        match err {
            // The peer dropped the TCP stream without a closing handshake;
            // the WebSocket-level equivalent of close code 1006.
            WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                MarketDataError::ConnectionClosed { code: Some(1006) }
            }
            e => MarketDataError::WebSocketConnection(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for MarketDataError {
    fn from(err: serde_json::Error) -> Self {
        MarketDataError::ParseError(err.to_string())
    }
}

impl From<lapin::Error> for MarketDataError {
    fn from(err: lapin::Error) -> Self {
        MarketDataError::BusError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MarketDataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abnormal_closure_codes() {
        assert!(MarketDataError::ConnectionClosed { code: Some(1006) }.is_abnormal_closure());
        assert!(MarketDataError::ConnectionClosed { code: Some(1001) }.is_abnormal_closure());
        assert!(!MarketDataError::ConnectionClosed { code: Some(1000) }.is_abnormal_closure());
        assert!(!MarketDataError::ConnectionClosed { code: None }.is_abnormal_closure());
        assert!(!MarketDataError::ConnectionTimeout.is_abnormal_closure());
    }
}
