//! Request and response bodies for the agent endpoints.

use serde::{Deserialize, Serialize};

/// Body of the registration call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub machine_id: String,
    pub hostname: String,
    pub agent_version: String,
    pub os: String,
    pub arch: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// What the backend returns after registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Bearer token for subsequent calls, when the backend issues one.
    #[serde(default)]
    pub token: Option<String>,
    /// Heartbeat interval the backend asks for, in seconds.
    #[serde(default)]
    pub heartbeat_interval_secs: Option<u64>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn registration_response_tolerates_missing_fields() {
        let response: RegistrationResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(response, RegistrationResponse::default());

        let response: RegistrationResponse =
            serde_json::from_str(r#"{"agent_id":"a-1","token":"t","extra":true}"#).unwrap();
        assert_eq!(response.agent_id.as_deref(), Some("a-1"));
        assert_eq!(response.token.as_deref(), Some("t"));
    }
}
