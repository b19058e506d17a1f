//! Parser module for upstream exchange WebSocket frames
//!
//! Handles ticker arrays and subscription-status events, and normalizes
//! exchange pairs into internal symbols.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

use crate::error::Result;
use crate::tick::Tick;

/// Subscription lifecycle event, e.g.
/// `{"event":"subscriptionStatus","status":"subscribed","pair":"XBT/USD"}`
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionStatus {
    pub event: String,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub pair: Option<String>,

    #[serde(default, rename = "errorMessage")]
    pub error_message: Option<String>,
}

/// Parsed upstream frame
#[derive(Debug, Clone)]
pub enum FeedFrame {
    /// Ticker data normalized into the internal tick model
    Ticker(Tick),
    /// Subscription-status event; informational only
    Status(SubscriptionStatus),
    /// Anything else: heartbeats, system status, malformed ticker payloads
    Ignored,
}

impl FeedFrame {
    /// Parse a raw upstream frame.
    ///
    /// Returns an error only for invalid JSON. Frames that are valid JSON
    /// but not usable ticker data (wrong channel, missing or non-positive
    /// prices) come back as `Ignored` and are dropped without affecting
    /// the connection.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;

        match value {
            Value::Array(items) => Ok(Self::parse_ticker(&items)),
            Value::Object(_) => {
                if value.get("event").and_then(Value::as_str) == Some("subscriptionStatus") {
                    let status: SubscriptionStatus = serde_json::from_value(value)?;
                    Ok(FeedFrame::Status(status))
                } else {
                    Ok(FeedFrame::Ignored)
                }
            }
            _ => Ok(FeedFrame::Ignored),
        }
    }

    /// Ticker frame shape: `[channelId, {"a":[ask,..],"b":[bid,..]}, "ticker", pair]`
    fn parse_ticker(items: &[Value]) -> Self {
        if items.len() < 4 {
            return FeedFrame::Ignored;
        }

        if items[2].as_str() != Some("ticker") {
            return FeedFrame::Ignored;
        }

        let Some(pair) = items[3].as_str() else {
            return FeedFrame::Ignored;
        };

        // First element of each price array is the best price; the rest is
        // volume data this pipeline does not carry.
        let Some(bid) = best_price(&items[1], "b") else {
            return FeedFrame::Ignored;
        };
        let Some(ask) = best_price(&items[1], "a") else {
            return FeedFrame::Ignored;
        };

        if bid <= Decimal::ZERO || ask <= Decimal::ZERO {
            return FeedFrame::Ignored;
        }

        FeedFrame::Ticker(Tick {
            symbol: normalize_pair(pair),
            timestamp: Utc::now(),
            bid,
            ask,
        })
    }
}

fn best_price(data: &Value, side: &str) -> Option<Decimal> {
    let raw = data.get(side)?.get(0)?.as_str()?;
    Decimal::from_str(raw).ok()
}

/// Normalize an exchange pair into the internal symbol form: remap the
/// exchange's XBT code to BTC, drop separators, uppercase.
/// `"XBT/USD"` becomes `"BTCUSD"`.
pub fn normalize_pair(pair: &str) -> String {
    pair.replace("XBT", "BTC")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_ticker_frame() {
        let raw = r#"[0,{"a":["39485.40","1","1.000"],"b":["39485.30","1","1.000"]},"ticker","XBT/USD"]"#;

        let frame = FeedFrame::parse(raw).unwrap();
        if let FeedFrame::Ticker(tick) = frame {
            assert_eq!(tick.symbol, "BTCUSD");
            assert_eq!(tick.bid, dec!(39485.30));
            assert_eq!(tick.ask, dec!(39485.40));
        } else {
            panic!("Expected Ticker");
        }
    }

    #[test]
    fn test_parse_subscription_status() {
        let raw = r#"{"event":"subscriptionStatus","status":"subscribed","pair":"XBT/USD","channelName":"ticker"}"#;

        let frame = FeedFrame::parse(raw).unwrap();
        if let FeedFrame::Status(status) = frame {
            assert_eq!(status.status.as_deref(), Some("subscribed"));
            assert_eq!(status.pair.as_deref(), Some("XBT/USD"));
        } else {
            panic!("Expected Status");
        }
    }

    #[test]
    fn test_non_ticker_channel_is_ignored() {
        let raw = r#"[1,{"a":["1.0"],"b":["1.0"]},"ohlc","ETH/USD"]"#;
        assert!(matches!(FeedFrame::parse(raw).unwrap(), FeedFrame::Ignored));
    }

    #[test]
    fn test_missing_prices_are_ignored() {
        let raw = r#"[0,{"a":[],"b":["39485.30"]},"ticker","XBT/USD"]"#;
        assert!(matches!(FeedFrame::parse(raw).unwrap(), FeedFrame::Ignored));

        let raw = r#"[0,{"b":["39485.30"]},"ticker","XBT/USD"]"#;
        assert!(matches!(FeedFrame::parse(raw).unwrap(), FeedFrame::Ignored));
    }

    #[test]
    fn test_non_positive_prices_are_ignored() {
        let raw = r#"[0,{"a":["0"],"b":["39485.30"]},"ticker","XBT/USD"]"#;
        assert!(matches!(FeedFrame::parse(raw).unwrap(), FeedFrame::Ignored));
    }

    #[test]
    fn test_unknown_event_object_is_ignored() {
        let raw = r#"{"event":"heartbeat"}"#;
        assert!(matches!(FeedFrame::parse(raw).unwrap(), FeedFrame::Ignored));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(FeedFrame::parse("not json").is_err());
    }

    #[test]
    fn test_normalize_pair() {
        assert_eq!(normalize_pair("XBT/USD"), "BTCUSD");
        assert_eq!(normalize_pair("ETH/USD"), "ETHUSD");
        assert_eq!(normalize_pair("eth/usd"), "ETHUSD");
        assert_eq!(normalize_pair("XBT-EUR"), "BTCEUR");
    }
}
