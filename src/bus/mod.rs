//! Message bus integration
//!
//! Publisher for the feed side and bridge consumer for the fan-out side.
//! Each configured topic is a durable topic exchange; records are keyed by
//! symbol through the routing key.

mod consumer;
mod publisher;

pub use consumer::BridgeConsumer;
pub use publisher::{BusPublisher, PublisherStats};
