//! Protocol handler abstraction and registry.
//!
//! A protocol handler identifies an application-layer protocol from a
//! bounded prefix of client bytes and, on a match, sets up the upstream side
//! of the connection. Handlers are tried in registration order; the first
//! one that does not reject the prefix wins the connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::core::Connection;
use crate::error::ProxyError;

/// Static configuration of a protocol handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolDescriptor {
    /// Minimum prefix length required to attempt identification.
    pub bytes_needed: usize,
    /// Per-chunk relay read size.
    pub buffer_size: usize,
    /// Idle timeout for relay reads.
    pub timeout: Duration,
    /// Whether the relay keeps going after one completed request/response
    /// cycle.
    pub keep_alive: bool,
}

/// Strategy that claims a connection from a sniffed prefix and connects the
/// upstream side.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Short name used for logging and [`Connection::protocol`].
    fn name(&self) -> &'static str;

    fn descriptor(&self) -> ProtocolDescriptor;

    /// Attempts to claim the connection based on `prefix`.
    ///
    /// `prefix` is the raw bytes sniffed from the client and drives protocol
    /// identification; `payload` is the same data after the middleware chain
    /// and is what a pass-through handler forwards upstream.
    ///
    /// Failing with [`ProxyError::InvalidProtocol`] hands the prefix to the
    /// next registered handler; any other error aborts dispatch.
    async fn connect(
        &self,
        connection: &mut Connection,
        prefix: &[u8],
        payload: Bytes,
    ) -> Result<(), ProxyError>;
}

impl fmt::Debug for dyn Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol").field("name", &self.name()).finish()
    }
}

/// Ordered set of protocol handlers.
pub struct ProtocolRegistry {
    protocols: Vec<Arc<dyn Protocol>>,
}

impl ProtocolRegistry {
    pub fn new(protocols: Vec<Arc<dyn Protocol>>) -> Self {
        Self { protocols }
    }

    /// Largest prefix any registered handler needs for identification.
    pub fn max_prefix_bytes(&self) -> usize {
        self.protocols
            .iter()
            .map(|p| p.descriptor().bytes_needed)
            .max()
            .unwrap_or(0)
    }

    /// Longest idle timeout among registered handlers, used for the initial
    /// sniff read before a handler is chosen.
    pub fn sniff_timeout(&self) -> Duration {
        self.protocols
            .iter()
            .map(|p| p.descriptor().timeout)
            .max()
            .unwrap_or(Duration::from_secs(5))
    }

    /// Finds the first handler that accepts `prefix` and lets it connect the
    /// upstream side.
    pub async fn dispatch(
        &self,
        connection: &mut Connection,
        prefix: &[u8],
        payload: Bytes,
    ) -> Result<Arc<dyn Protocol>, ProxyError> {
        for protocol in &self.protocols {
            match protocol.connect(connection, prefix, payload.clone()).await {
                Ok(()) => {
                    connection.set_protocol(protocol.name());
                    return Ok(Arc::clone(protocol));
                }
                Err(ProxyError::InvalidProtocol(reason)) => {
                    debug!(protocol = protocol.name(), %reason, "handler rejected prefix");
                }
                Err(err) => return Err(err),
            }
        }
        Err(ProxyError::invalid(
            "no registered protocol matched the client prefix",
        ))
    }
}
