//! Hostlink Agent Library
//!
//! Communication and resilience layer of the host agent:
//! - HTTP transport with linear retry
//! - Persistent WebSocket channel with ping/pong, reconnection and an offline buffer
//! - Durable priority queue for messages that could not be delivered
//! - Health and metrics monitor
//! - Agent wiring that runs the loops

pub mod agent;
pub mod backoff;
pub mod channel;
pub mod command;
pub mod monitor;
pub mod queue;
pub mod system;
pub mod transport;
