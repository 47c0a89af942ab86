//! Bearer token lifecycle.
//!
//! Tokens are random hex values handed to the caller once. The store keeps
//! only their SHA-256 digest, so a dump of the table does not leak usable
//! credentials.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hostlink_core::now_millis;
use hostlink_core::time::duration_millis;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::SecurityError;
use crate::hash::{generate_nonce, sha256_hex};

/// Bytes of randomness in a freshly issued token.
const TOKEN_BYTES: usize = 32;

/// A token as seen by callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub machine_id: String,
    pub scope: Vec<String>,
    /// Unix milliseconds.
    pub issued_at: i64,
    /// Unix milliseconds. The token is valid while `now < expires_at`.
    pub expires_at: i64,
    pub refresh_count: u32,
}

impl Token {
    pub const fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.iter().any(|s| s == scope)
    }
}

/// Lock-guarded token table keyed by the SHA-256 digest of each value.
#[derive(Clone)]
pub struct TokenStore {
    entries: Arc<RwLock<HashMap<String, Token>>>,
    validity: Duration,
    max_refresh: u32,
}

impl TokenStore {
    pub fn new(validity: Duration, max_refresh: u32) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            validity,
            max_refresh,
        }
    }

    /// Issue a new token for `machine_id`.
    pub async fn generate(&self, machine_id: &str, scope: &[String]) -> Token {
        self.generate_at(machine_id, scope, now_millis()).await
    }

    pub async fn generate_at(&self, machine_id: &str, scope: &[String], now: i64) -> Token {
        let value = generate_nonce(TOKEN_BYTES);
        let token = Token {
            value: value.clone(),
            machine_id: machine_id.to_string(),
            scope: scope.to_vec(),
            issued_at: now,
            expires_at: now.saturating_add(duration_millis(self.validity)),
            refresh_count: 0,
        };
        self.entries
            .write()
            .await
            .insert(sha256_hex(&value), token.clone());
        debug!(machine_id, "Issued token");
        token
    }

    /// Check that `value` names a live token. Expired tokens are deleted.
    pub async fn validate(&self, value: &str) -> Result<Token, SecurityError> {
        self.validate_at(value, now_millis()).await
    }

    pub async fn validate_at(&self, value: &str, now: i64) -> Result<Token, SecurityError> {
        let digest = sha256_hex(value);
        {
            let entries = self.entries.read().await;
            match entries.get(&digest) {
                None => return Err(SecurityError::UnknownToken),
                Some(token) if !token.is_expired_at(now) => return Ok(token.clone()),
                Some(_) => {}
            }
        }
        self.entries.write().await.remove(&digest);
        debug!("Removed expired token on validation");
        Err(SecurityError::TokenExpired)
    }

    /// Extend the token's validity by one full period.
    pub async fn refresh(&self, value: &str) -> Result<Token, SecurityError> {
        self.refresh_at(value, now_millis()).await
    }

    pub async fn refresh_at(&self, value: &str, now: i64) -> Result<Token, SecurityError> {
        let digest = sha256_hex(value);
        let mut entries = self.entries.write().await;
        let Some(token) = entries.get_mut(&digest) else {
            return Err(SecurityError::UnknownToken);
        };
        if token.is_expired_at(now) {
            entries.remove(&digest);
            return Err(SecurityError::TokenExpired);
        }
        if token.refresh_count >= self.max_refresh {
            return Err(SecurityError::RefreshLimitExceeded {
                max: self.max_refresh,
            });
        }
        token.refresh_count += 1;
        token.expires_at = now.saturating_add(duration_millis(self.validity));
        Ok(token.clone())
    }

    /// Delete a token. Returns whether it existed.
    pub async fn revoke(&self, value: &str) -> bool {
        self.entries
            .write()
            .await
            .remove(&sha256_hex(value))
            .is_some()
    }

    /// Delete every expired token, returning how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(now_millis()).await
    }

    pub async fn sweep_expired_at(&self, now: i64) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, token| !token.is_expired_at(now));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const HOUR_MS: i64 = 60 * 60 * 1000;

    fn store() -> TokenStore {
        TokenStore::new(Duration::from_secs(3600), 2)
    }

    fn scope() -> Vec<String> {
        vec!["telemetry".to_string()]
    }

    #[tokio::test]
    async fn generated_token_validates() {
        let store = store();
        let token = store.generate_at("m-1", &scope(), 1_000).await;
        assert_eq!(token.value.len(), 64);
        assert_eq!(token.expires_at, 1_000 + HOUR_MS);

        let found = store.validate_at(&token.value, 2_000).await.unwrap();
        assert_eq!(found.machine_id, "m-1");
        assert!(found.has_scope("telemetry"));
    }

    #[tokio::test]
    async fn unknown_token_rejected() {
        let store = store();
        assert!(matches!(
            store.validate_at("nope", 0).await,
            Err(SecurityError::UnknownToken)
        ));
    }

    #[tokio::test]
    async fn table_is_keyed_by_digest() {
        let store = store();
        let token = store.generate_at("m-1", &scope(), 0).await;
        let entries = store.entries.read().await;
        assert!(!entries.contains_key(&token.value));
        assert_eq!(entries[&sha256_hex(&token.value)], token);
    }

    #[tokio::test]
    async fn expired_token_rejected_and_deleted() {
        let store = store();
        let token = store.generate_at("m-1", &scope(), 0).await;

        let result = store.validate_at(&token.value, HOUR_MS).await;
        assert!(matches!(result, Err(SecurityError::TokenExpired)));
        assert!(store.is_empty().await);
        assert!(matches!(
            store.validate_at(&token.value, 0).await,
            Err(SecurityError::UnknownToken)
        ));
    }

    #[tokio::test]
    async fn refresh_extends_and_is_bounded() {
        let store = store();
        let token = store.generate_at("m-1", &scope(), 0).await;

        let first = store.refresh_at(&token.value, 10).await.unwrap();
        assert_eq!(first.refresh_count, 1);
        assert_eq!(first.expires_at, 10 + HOUR_MS);

        let second = store.refresh_at(&token.value, 20).await.unwrap();
        assert_eq!(second.refresh_count, 2);

        let third = store.refresh_at(&token.value, 30).await;
        assert!(matches!(
            third,
            Err(SecurityError::RefreshLimitExceeded { max: 2 })
        ));
        // Still valid until its extended expiry.
        assert!(store.validate_at(&token.value, 30).await.is_ok());
    }

    #[tokio::test]
    async fn refresh_of_expired_token_fails() {
        let store = store();
        let token = store.generate_at("m-1", &scope(), 0).await;
        assert!(matches!(
            store.refresh_at(&token.value, HOUR_MS + 1).await,
            Err(SecurityError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn revoke_deletes() {
        let store = store();
        let token = store.generate_at("m-1", &scope(), 0).await;
        assert!(store.revoke(&token.value).await);
        assert!(!store.revoke(&token.value).await);
        assert!(store.validate_at(&token.value, 1).await.is_err());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let store = store();
        let old = store.generate_at("m-1", &scope(), 0).await;
        let fresh = store.generate_at("m-2", &scope(), HOUR_MS).await;

        let removed = store.sweep_expired_at(HOUR_MS + 5).await;
        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.validate_at(&fresh.value, HOUR_MS + 5).await.is_ok());
        assert!(store.validate_at(&old.value, HOUR_MS + 5).await.is_err());
    }
}
