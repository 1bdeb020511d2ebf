//! Wiretap - a customizable man-in-the-middle TCP proxy.
//!
//! Wiretap accepts client connections, sniffs enough bytes to identify the
//! application protocol, connects to the true destination and relays both
//! directions through an ordered middleware pipeline. Plain HTTP passes
//! through transparently; HTTPS is intercepted with the `CONNECT` dance: the
//! proxy answers the tunnel request, presents a leaf certificate minted for
//! the destination host by a local root CA, and opens a verified TLS session
//! to the real server, so middleware sees the decrypted streams on both
//! sides.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wiretap::{CertificateAuthority, HttpProtocol, LogMiddleware, MitmServer, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ProxyConfig::default();
//!     let ca = Arc::new(CertificateAuthority::init(&config.ca_dir).await?);
//!     let http = HttpProtocol::new(Arc::clone(&ca));
//!     let server = MitmServer::new(
//!         &config,
//!         vec![Arc::new(http)],
//!         vec![Arc::new(LogMiddleware)],
//!     );
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - `crypto` - root CA management, leaf issuance, TLS contexts
//! - `protocol` - protocol handler trait and registry
//! - `http` - the built-in HTTP/1.x handler (`CONNECT` + plain)
//! - `middleware` - event hooks over lifecycle and decrypted bytes
//! - `server` - accept loop and the bidirectional relay

pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod http;
pub mod middleware;
pub mod protocol;
pub mod server;

pub use config::ProxyConfig;
pub use core::{Connection, Flow, Host};
pub use crypto::{
    CertificateAuthority, ClientFacingTls, CryptoError, IssuedLeaf, UpstreamTls, CA_CERT_FILENAME,
    CA_KEY_FILENAME, LEAF_CACHE_CAPACITY,
};
pub use error::ProxyError;
pub use http::HttpProtocol;
pub use middleware::{LogMiddleware, Middleware, MiddlewareStack};
pub use protocol::{Protocol, ProtocolDescriptor, ProtocolRegistry};
pub use server::MitmServer;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
