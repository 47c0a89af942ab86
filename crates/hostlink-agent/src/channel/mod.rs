//! Persistent bidirectional channel to the backend.

mod client;
mod config;
mod envelope;
mod error;
mod metrics;
mod state;

pub use client::{ChannelClient, ChannelClientBuilder, ChannelReceivers, Delivery};
pub use config::ChannelConfig;
pub use envelope::{ChannelMessage, Envelope, Heartbeat, kinds};
pub use error::ChannelError;
pub use metrics::ChannelMetrics;
pub use state::{ConnectionState, ReconnectGuard, ReconnectPermit};
