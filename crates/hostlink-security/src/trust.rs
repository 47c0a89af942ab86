//! Server certificate trust.
//!
//! Two modes, never mixed:
//! - **Pinned**: the leaf certificate's SHA-256 (over DER) must match one of
//!   the configured fingerprints. Chain trust is not consulted.
//! - **System roots**: standard WebPKI chain and hostname verification against
//!   the platform trust store (bundled Mozilla roots when the platform store
//!   is empty).
//!
//! Both modes additionally enforce the optional host allow-list.

use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::error::SecurityError;
use crate::hash::{constant_time_eq, sha256_hex};

/// Certificate trust settings.
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    /// Hex SHA-256 fingerprints of acceptable leaf certificates.
    pub pinned_cert_hashes: Vec<String>,
    /// Acceptable server names. Empty means any.
    pub allowed_hosts: Vec<String>,
}

impl TrustPolicy {
    pub fn new(pinned_cert_hashes: Vec<String>, allowed_hosts: Vec<String>) -> Self {
        Self {
            pinned_cert_hashes: pinned_cert_hashes
                .into_iter()
                .map(|h| normalize_fingerprint(&h))
                .filter(|h| !h.is_empty())
                .collect(),
            allowed_hosts,
        }
    }

    pub fn is_pinned(&self) -> bool {
        !self.pinned_cert_hashes.is_empty()
    }

    /// Whether `der` matches one of the pins.
    pub fn matches_pin(&self, der: &[u8]) -> bool {
        let actual = sha256_hex(der);
        self.pinned_cert_hashes
            .iter()
            .any(|pin| constant_time_eq(pin, &actual))
    }

    /// Whether `host` passes the allow-list.
    pub fn host_allowed(&self, host: &str) -> bool {
        self.allowed_hosts.is_empty()
            || self
                .allowed_hosts
                .iter()
                .any(|allowed| allowed.trim_end_matches('.').eq_ignore_ascii_case(host))
    }

    /// Build a rustls client configuration enforcing this policy.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, SecurityError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let roots = Arc::new(load_root_store());
        let chain = WebPkiServerVerifier::builder_with_provider(roots, Arc::clone(&provider))
            .build()
            .map_err(|e| SecurityError::Tls(format!("Failed to build verifier: {e}")))?;

        let verifier = PolicyVerifier {
            policy: self.clone(),
            chain,
            provider: Arc::clone(&provider),
        };

        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| SecurityError::Tls(format!("Failed to select protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

/// Lowercase hex with `:` separators removed.
fn normalize_fingerprint(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn load_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        warn!(error = %err, "Failed to load a platform certificate");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!(added, ignored, "Loaded platform trust store");

    if roots.is_empty() {
        warn!("Platform trust store is empty, using bundled roots");
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    roots
}

#[derive(Debug)]
struct PolicyVerifier {
    policy: TrustPolicy,
    chain: Arc<WebPkiServerVerifier>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let host = server_name.to_str();
        if !self.policy.host_allowed(&host) {
            warn!(host = %host, "Server name not in allow-list");
            return Err(rustls::Error::General(format!(
                "host {host} is not in the allow-list"
            )));
        }

        if self.policy.is_pinned() {
            if self.policy.matches_pin(end_entity.as_ref()) {
                return Ok(ServerCertVerified::assertion());
            }
            warn!(host = %host, "Certificate does not match any pin");
            return Err(rustls::Error::General(
                "certificate fingerprint does not match any pin".to_string(),
            ));
        }

        self.chain
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_are_normalized() {
        let policy = TrustPolicy::new(vec!["AB:CD:ef:01".into(), "  ".into()], vec![]);
        assert_eq!(policy.pinned_cert_hashes, vec!["abcdef01".to_string()]);
    }

    #[test]
    fn pin_matches_sha256_of_der() {
        let der = b"not really a certificate";
        let pin = sha256_hex(der).to_uppercase();
        let policy = TrustPolicy::new(vec![pin], vec![]);
        assert!(policy.is_pinned());
        assert!(policy.matches_pin(der));
        assert!(!policy.matches_pin(b"another certificate"));
    }

    #[test]
    fn empty_allow_list_admits_any_host() {
        let policy = TrustPolicy::default();
        assert!(!policy.is_pinned());
        assert!(policy.host_allowed("anything.example.com"));
    }

    #[test]
    fn allow_list_is_case_insensitive() {
        let policy = TrustPolicy::new(vec![], vec!["Backend.Example.COM".into()]);
        assert!(policy.host_allowed("backend.example.com"));
        assert!(!policy.host_allowed("evil.example.com"));
    }

    #[test]
    fn client_config_builds_for_both_modes() {
        assert!(TrustPolicy::default().client_config().is_ok());
        let pinned = TrustPolicy::new(vec![sha256_hex(b"x")], vec![]);
        assert!(pinned.client_config().is_ok());
    }
}
