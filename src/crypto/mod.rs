//! X.509 issuance and TLS context construction.
//!
//! - [`CertificateAuthority`] loads or creates the root CA and mints cached
//!   per-host leaf certificates.
//! - [`ClientFacingTls`] / [`UpstreamTls`] translate that material into
//!   rustls configurations for the two ends of an intercepted connection.

mod authority;
mod tls;

pub use authority::{
    CertificateAuthority, CryptoError, IssuedLeaf, CA_CERT_FILENAME, CA_KEY_FILENAME,
    LEAF_CACHE_CAPACITY,
};
pub use tls::{ClientFacingTls, TlsError, UpstreamTls};
