//! Downstream fan-out WebSocket server
//!
//! Accepts client connections, manages per-symbol subscriptions, and
//! broadcasts ticks to interested subscribers only.

pub mod handler;
pub mod messages;
mod registry;

pub use handler::serve;
pub use registry::{ClientSender, ConnectionId, SubscriptionRegistry};
