//! `Hostlink` Core Library
//!
//! Shared functionality for `Hostlink` components:
//! - Configuration resolution and hierarchy
//! - Common error types
//! - Tracing initialisation
//! - Wall-clock helpers

pub mod config;
pub mod error;
pub mod time;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use time::now_millis;
