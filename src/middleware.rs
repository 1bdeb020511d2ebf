//! Event-driven middleware hooks.
//!
//! Middleware observes the lifecycle of every intercepted connection and may
//! rewrite the decrypted byte streams flowing through the relay. Hooks run in
//! registration order; for the data hooks each middleware receives the output
//! of the previous one, and whatever the last middleware returns is what gets
//! written to the peer.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, warn};

use crate::core::Connection;

/// Event hooks for one intercepted connection.
///
/// All hooks have default implementations, so implementors override only the
/// events they care about. A hook that returns an error is logged and
/// skipped; it never tears down the connection. TLS handshake bytes are
/// decrypted before the data hooks run and never pass through them raw.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Called once when the listener starts accepting.
    async fn mitm_started(&self, host: &str, port: u16) -> anyhow::Result<()> {
        let _ = (host, port);
        Ok(())
    }

    /// Called when a client connection is accepted.
    async fn client_connected(&self, connection: &Connection) -> anyhow::Result<()> {
        let _ = connection;
        Ok(())
    }

    /// Called once the upstream server connection is established.
    async fn server_connected(&self, connection: &Connection) -> anyhow::Result<()> {
        let _ = connection;
        Ok(())
    }

    /// Data received from the client. The returned buffer is what the next
    /// middleware sees; the final middleware's output is written to the
    /// server.
    ///
    /// Note that rewriting the first request does not change the destination
    /// the proxy resolved for the connection.
    async fn client_data(&self, connection: &Connection, data: Bytes) -> anyhow::Result<Bytes> {
        let _ = connection;
        Ok(data)
    }

    /// Data received from the server, bound for the client.
    async fn server_data(&self, connection: &Connection, data: Bytes) -> anyhow::Result<Bytes> {
        let _ = connection;
        Ok(data)
    }

    /// Called when the client side has been closed.
    async fn client_disconnected(&self, connection: &Connection) -> anyhow::Result<()> {
        let _ = connection;
        Ok(())
    }

    /// Called when the server side has been closed. Only fires for
    /// connections whose protocol resolution succeeded.
    async fn server_disconnected(&self, connection: &Connection) -> anyhow::Result<()> {
        let _ = connection;
        Ok(())
    }
}

/// Ordered middleware pipeline.
///
/// Cheap to clone and share across connection tasks.
#[derive(Clone, Default)]
pub struct MiddlewareStack {
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewareStack {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            middlewares: Arc::new(middlewares),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub async fn mitm_started(&self, host: &str, port: u16) {
        for mw in self.middlewares.iter() {
            if let Err(error) = mw.mitm_started(host, port).await {
                warn!(%error, "mitm_started hook failed");
            }
        }
    }

    pub async fn client_connected(&self, connection: &Connection) {
        for mw in self.middlewares.iter() {
            if let Err(error) = mw.client_connected(connection).await {
                warn!(%error, "client_connected hook failed");
            }
        }
    }

    pub async fn server_connected(&self, connection: &Connection) {
        for mw in self.middlewares.iter() {
            if let Err(error) = mw.server_connected(connection).await {
                warn!(%error, "server_connected hook failed");
            }
        }
    }

    /// Threads client bytes through the chain; a failing hook is skipped and
    /// the bytes continue unchanged.
    pub async fn client_data(&self, connection: &Connection, mut data: Bytes) -> Bytes {
        for mw in self.middlewares.iter() {
            match mw.client_data(connection, data.clone()).await {
                Ok(next) => data = next,
                Err(error) => warn!(%error, "client_data hook failed, passing bytes through"),
            }
        }
        data
    }

    /// Threads server bytes through the chain; a failing hook is skipped and
    /// the bytes continue unchanged.
    pub async fn server_data(&self, connection: &Connection, mut data: Bytes) -> Bytes {
        for mw in self.middlewares.iter() {
            match mw.server_data(connection, data.clone()).await {
                Ok(next) => data = next,
                Err(error) => warn!(%error, "server_data hook failed, passing bytes through"),
            }
        }
        data
    }

    pub async fn client_disconnected(&self, connection: &Connection) {
        for mw in self.middlewares.iter() {
            if let Err(error) = mw.client_disconnected(connection).await {
                warn!(%error, "client_disconnected hook failed");
            }
        }
    }

    pub async fn server_disconnected(&self, connection: &Connection) {
        for mw in self.middlewares.iter() {
            if let Err(error) = mw.server_disconnected(connection).await {
                warn!(%error, "server_disconnected hook failed");
            }
        }
    }
}

/// Logging middleware: reports lifecycle events and relayed chunk sizes.
///
/// Installed by default so a bare proxy is observable out of the box.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMiddleware;

#[async_trait]
impl Middleware for LogMiddleware {
    async fn mitm_started(&self, host: &str, port: u16) -> anyhow::Result<()> {
        info!(%host, port, "mitm server started");
        Ok(())
    }

    async fn client_connected(&self, connection: &Connection) -> anyhow::Result<()> {
        info!(client = %connection.client, "client connected");
        Ok(())
    }

    async fn server_connected(&self, connection: &Connection) -> anyhow::Result<()> {
        info!(
            client = %connection.client,
            server = %connection.server,
            "connected to server"
        );
        Ok(())
    }

    async fn client_data(&self, connection: &Connection, data: Bytes) -> anyhow::Result<Bytes> {
        // The first chunk is addressed to the proxy itself; everything after
        // the protocol resolves is destined for the other end.
        if connection.protocol().is_some() {
            info!(
                client = %connection.client,
                server = %connection.server,
                bytes = data.len(),
                "client to server"
            );
        } else {
            info!(client = %connection.client, bytes = data.len(), "client to mitm");
        }
        Ok(data)
    }

    async fn server_data(&self, connection: &Connection, data: Bytes) -> anyhow::Result<Bytes> {
        info!(
            server = %connection.server,
            client = %connection.client,
            bytes = data.len(),
            "server to client"
        );
        Ok(data)
    }

    async fn client_disconnected(&self, connection: &Connection) -> anyhow::Result<()> {
        info!(client = %connection.client, "client disconnected");
        Ok(())
    }

    async fn server_disconnected(&self, connection: &Connection) -> anyhow::Result<()> {
        info!(server = %connection.server, "server disconnected");
        Ok(())
    }
}
