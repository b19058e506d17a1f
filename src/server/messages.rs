//! Downstream WebSocket protocol messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server-to-client frames
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// One-time welcome notice sent on connect
    Info {
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Confirmation carrying the connection's current full subscription set
    Subscription {
        status: String,
        symbols: Vec<String>,
    },
    /// Protocol error, isolated to the offending connection
    Error { message: String },
}

impl ServerMessage {
    pub fn welcome() -> Self {
        ServerMessage::Info {
            message: "Connected to Market Data Pipeline".to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn subscription_ack(symbols: Vec<String>) -> Self {
        ServerMessage::Subscription {
            status: "success".to_string(),
            symbols,
        }
    }

    pub fn invalid_request() -> Self {
        ServerMessage::Error {
            message: "Invalid subscription request".to_string(),
        }
    }
}

/// Client subscription request
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientRequest {
    Subscribe { symbols: SymbolList },
    Unsubscribe { symbols: SymbolList },
}

/// A single symbol or a list of symbols; scalars normalize to a list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SymbolList {
    One(String),
    Many(Vec<String>),
}

impl SymbolList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            SymbolList::One(symbol) => vec![symbol],
            SymbolList::Many(symbols) => symbols,
        }
    }
}
