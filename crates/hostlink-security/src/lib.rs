//! `Hostlink` Security Library
//!
//! Guards the agent's link to its backend:
//!
//! - **Tokens**: opaque bearer values with bounded lifetime and refresh count
//! - **Rate limiting**: sliding-window admission per caller identifier
//! - **Certificate trust**: SHA-256 pins or system-root chain verification
//! - **Sanitation**: control-character stripping, URL and JSON payload checks
//! - **Helpers**: nonces, SHA-256 digests, security HTTP headers

pub mod error;
pub mod hash;
pub mod manager;
pub mod rate_limit;
pub mod sanitize;
pub mod token;
pub mod trust;

pub use error::SecurityError;
pub use hash::{constant_time_eq, generate_nonce, security_headers, sha256_hex};
pub use manager::{SecurityConfig, SecurityManager};
pub use rate_limit::RateLimiter;
pub use sanitize::{UrlPolicy, sanitize_input, validate_json, validate_url};
pub use token::{Token, TokenStore};
pub use trust::TrustPolicy;
