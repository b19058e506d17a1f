//! Normalized tick model shared across the pipeline
//!
//! A tick is one bid/ask observation for one instrument. The same wire form
//! is used for bus records and downstream pushes:
//! `{"symbol":"BTCUSD","timestamp":"...","bid":39485.3,"ask":39485.4}`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single best bid/ask observation for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Normalized instrument symbol (uppercase, no separators, e.g. "BTCUSD")
    pub symbol: String,

    /// Observation time
    #[serde(with = "timestamp_serde")]
    pub timestamp: DateTime<Utc>,

    /// Best bid price
    #[serde(with = "rust_decimal::serde::float")]
    pub bid: Decimal,

    /// Best ask price
    #[serde(with = "rust_decimal::serde::float")]
    pub ask: Decimal,
}

impl Tick {
    /// Key used for short-window deduplication at the publisher, the bridge
    /// consumer, and the broadcast path. Ticks are distinguished by
    /// symbol + timestamp; equal keys within a retention window are treated
    /// as re-deliveries.
    pub fn dedup_key(&self) -> String {
        format!("{}-{}", self.symbol, self.timestamp.timestamp_millis())
    }
}

/// Timestamps are written as ISO-8601 with millisecond precision; inbound
/// bus records may also carry epoch milliseconds.
mod timestamp_serde {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Iso(String),
        EpochMillis(i64),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawTimestamp::deserialize(deserializer)? {
            RawTimestamp::Iso(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(de::Error::custom),
            RawTimestamp::EpochMillis(ms) => DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| de::Error::custom("timestamp out of range")),
        }
    }
}
