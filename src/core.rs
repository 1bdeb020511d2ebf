//! Core connection types shared by the supervisor, protocol handlers and
//! middleware.

use std::fmt;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed read half of a peer stream.
///
/// Plain TCP and TLS-wrapped streams both hide behind this, so a connection
/// can be upgraded mid-flight without changing its shape.
pub type StreamReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Boxed write half of a peer stream.
pub type StreamWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// One endpoint of a relayed pair.
///
/// A host is a pair of stream halves used to talk to a remote peer. The
/// client host exists as soon as a connection is accepted; the server host
/// stays unresolved until a protocol handler connects upstream on the
/// client's behalf.
///
/// `mitm_managed` controls teardown ownership: when false the supervisor
/// stops reading and writing but leaves closing the underlying stream to
/// whoever handed it in.
pub struct Host {
    pub reader: Option<StreamReader>,
    pub writer: Option<StreamWriter>,
    /// Observed peer address, unset until the TCP connection exists.
    pub peer_addr: Option<SocketAddr>,
    pub mitm_managed: bool,
}

impl Host {
    /// A resolved host backed by live stream halves.
    pub fn new(reader: StreamReader, writer: StreamWriter, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            reader: Some(reader),
            writer: Some(writer),
            peer_addr,
            mitm_managed: true,
        }
    }

    /// Placeholder for a server host that has not been connected yet.
    pub fn unresolved() -> Self {
        Self {
            reader: None,
            writer: None,
            peer_addr: None,
            mitm_managed: true,
        }
    }

    /// Whether both stream halves are present.
    pub fn is_resolved(&self) -> bool {
        self.reader.is_some() && self.writer.is_some()
    }

    /// Lends both halves out, e.g. to the relay loop or a TLS upgrade.
    /// Returns `None` unless both halves are present.
    pub fn take_streams(&mut self) -> Option<(StreamReader, StreamWriter)> {
        match (self.reader.take(), self.writer.take()) {
            (Some(reader), Some(writer)) => Some((reader, writer)),
            (reader, writer) => {
                // Don't lose a half if only one was present.
                self.reader = reader;
                self.writer = writer;
                None
            }
        }
    }

    /// Hands stream halves back, typically after a TLS upgrade replaced the
    /// transport.
    pub fn replace_streams(&mut self, reader: StreamReader, writer: StreamWriter) {
        self.reader = Some(reader);
        self.writer = Some(writer);
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr {
            Some(addr) => write!(f, "{addr}"),
            None => write!(f, "unresolved"),
        }
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("peer_addr", &self.peer_addr)
            .field("resolved", &self.is_resolved())
            .field("mitm_managed", &self.mitm_managed)
            .finish()
    }
}

/// One intercepted session: the client that connected to the proxy and the
/// server the proxy connected to on its behalf.
///
/// The client is always fully initialized; the server stays unresolved until
/// protocol resolution succeeds. The protocol name is set exactly once.
#[derive(Debug)]
pub struct Connection {
    pub client: Host,
    pub server: Host,
    protocol: Option<&'static str>,
}

impl Connection {
    pub fn new(client: Host) -> Self {
        Self {
            client,
            server: Host::unresolved(),
            protocol: None,
        }
    }

    /// Name of the protocol handling this session, once resolved.
    pub fn protocol(&self) -> Option<&'static str> {
        self.protocol
    }

    /// Records the resolved protocol. Immutable once set; later calls are
    /// ignored.
    pub(crate) fn set_protocol(&mut self, name: &'static str) {
        if self.protocol.is_none() {
            self.protocol = Some(name);
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.client, self.server)
    }
}

/// Direction of travel inside the relay loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    ClientToServer,
    ServerToClient,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_host_has_no_streams() {
        let host = Host::unresolved();
        assert!(!host.is_resolved());
        assert!(host.mitm_managed);
        assert_eq!(host.to_string(), "unresolved");
    }

    #[test]
    fn take_streams_requires_both_halves() {
        let mut host = Host::unresolved();
        assert!(host.take_streams().is_none());

        host.replace_streams(Box::new(tokio::io::empty()), Box::new(tokio::io::sink()));
        assert!(host.is_resolved());
        assert!(host.take_streams().is_some());
        assert!(!host.is_resolved());
    }

    #[test]
    fn protocol_is_set_once() {
        let mut connection = Connection::new(Host::unresolved());
        assert_eq!(connection.protocol(), None);

        connection.set_protocol("http");
        connection.set_protocol("other");
        assert_eq!(connection.protocol(), Some("http"));
    }
}
