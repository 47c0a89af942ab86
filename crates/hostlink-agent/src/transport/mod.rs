//! Retrying HTTP transport to the backend API.

mod client;
mod error;
mod metrics;
mod types;

pub use client::{TransportClient, TransportConfig, TransportResponse, endpoints};
pub use error::{ApiErrorBody, TransportError};
pub use metrics::HttpMetrics;
pub use types::{RegistrationRequest, RegistrationResponse};
