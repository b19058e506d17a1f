//! Market Data Pipeline Library
//!
//! Distributes real-time price ticks from an upstream exchange feed to many
//! downstream WebSocket subscribers, decoupled through a durable message bus
//! with per-symbol subscription filtering.

pub mod bus;
pub mod config;
pub mod dedup;
pub mod error;
pub mod feed;
pub mod parser;
pub mod pipeline;
pub mod server;
pub mod stats;
pub mod tick;

pub use bus::{BridgeConsumer, BusPublisher};
pub use config::Config;
pub use dedup::DedupCache;
pub use error::{MarketDataError, Result};
pub use feed::{FeedManager, FeedState, FeedTransport};
pub use parser::FeedFrame;
pub use pipeline::Pipeline;
pub use server::SubscriptionRegistry;
pub use tick::Tick;
