//! Proxy error taxonomy.

use thiserror::Error;

/// Errors surfaced by the proxy core.
///
/// Every error here is contained to the connection task that produced it;
/// nothing tears down the listener or sibling connections.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client prefix did not match any registered protocol, or a handler
    /// recognized its shape but a hard constraint failed (missing `Host`
    /// header, malformed `CONNECT` target, client-side TLS handshake
    /// failure). The client socket is closed without a response.
    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    /// A TLS handshake could not be completed.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// DNS resolution, TCP connect, or the upstream TLS handshake failed.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Both relay directions exceeded the idle window.
    #[error("relay idle timeout")]
    Timeout,

    /// Normal EOF from one of the peers.
    #[error("peer closed the connection")]
    PeerClosed,
}

impl ProxyError {
    /// Create an invalid-protocol error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidProtocol(msg.into())
    }

    /// Create an upstream-unreachable error.
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::UpstreamUnreachable(msg.into())
    }

    /// Create a handshake error.
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::HandshakeFailed(msg.into())
    }

    /// Whether this error ends a session that never misbehaved (EOF or idle
    /// timeout).
    pub fn is_clean_close(&self) -> bool {
        matches!(self, Self::PeerClosed | Self::Timeout)
    }
}
