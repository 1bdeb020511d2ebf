//! TLS contexts for the two ends of an intercepted connection.
//!
//! - client-facing: the proxy acts as a TLS *server*, presenting a minted
//!   leaf for the destination host;
//! - upstream: the proxy acts as a TLS *client*, verifying the real
//!   destination the way a browser would.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;
use webpki_roots::TLS_SERVER_ROOTS;

use super::authority::IssuedLeaf;

/// TLS configuration errors.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS configuration error: {0}")]
    Config(String),

    #[error("invalid server name: {0}")]
    InvalidServerName(String),
}

/// Client-facing TLS: builds the server-side configuration presented to an
/// intercepted client.
pub struct ClientFacingTls;

impl ClientFacingTls {
    /// Server config that presents `leaf` chained to the signing CA, offers
    /// TLS 1.2 and 1.3, and requires no client certificate.
    pub fn for_leaf(
        leaf: &IssuedLeaf,
        ca_cert: CertificateDer<'static>,
    ) -> Result<Arc<ServerConfig>, TlsError> {
        let chain = vec![leaf.certificate().clone(), ca_cert];
        let config = ServerConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
            .with_no_client_auth()
            .with_single_cert(chain, leaf.clone_key())
            .map_err(|e| TlsError::Config(e.to_string()))?;
        Ok(Arc::new(config))
    }
}

/// Upstream TLS: the client-side configuration the proxy uses to emulate a
/// real client toward the destination.
#[derive(Clone)]
pub struct UpstreamTls {
    config: Arc<ClientConfig>,
}

impl UpstreamTls {
    /// Verifies upstream peers against the Mozilla root bundle.
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(roots)
    }

    /// Verifies upstream peers against an explicit root store, for
    /// destinations signed by a private CA (and for the test suite).
    pub fn with_roots(roots: RootCertStore) -> Self {
        let config = ClientConfig::builder_with_protocol_versions(&[&TLS12, &TLS13])
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            config: Arc::new(config),
        }
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    /// Parses `host` into an SNI server name.
    pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
        ServerName::try_from(host.to_owned()).map_err(|e| TlsError::InvalidServerName(e.to_string()))
    }
}

impl Default for UpstreamTls {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_accepts_hostnames_and_ips() {
        assert!(UpstreamTls::server_name("example.com").is_ok());
        assert!(UpstreamTls::server_name("192.168.1.1").is_ok());
        assert!(UpstreamTls::server_name("").is_err());
    }

    #[test]
    fn upstream_config_builds_with_default_roots() {
        let upstream = UpstreamTls::new();
        // Raw relay: no ALPN advertised on the upstream side.
        assert!(upstream.client_config().alpn_protocols.is_empty());
    }
}
