//! Connection supervisor: accept loop, protocol dispatch and the relay.
//!
//! Each accepted socket becomes an independent task that walks one
//! connection through its lifecycle: middleware hooks, prefix sniffing,
//! protocol dispatch, the bidirectional relay, and teardown. Errors stay
//! contained to their own connection; the listener keeps accepting.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::core::{Connection, Flow, Host, StreamReader, StreamWriter};
use crate::error::ProxyError;
use crate::middleware::{Middleware, MiddlewareStack};
use crate::protocol::{Protocol, ProtocolDescriptor, ProtocolRegistry};

/// Man-in-the-middle proxy server.
///
/// Owns the accept loop and supervises one task per intercepted connection.
pub struct MitmServer {
    host: String,
    port: u16,
    shutdown_grace: Duration,
    registry: Arc<ProtocolRegistry>,
    middlewares: Arc<MiddlewareStack>,
    shutdown: watch::Sender<bool>,
}

impl MitmServer {
    /// Builds a server from configuration plus ordered protocol handlers and
    /// middleware.
    pub fn new(
        config: &ProxyConfig,
        protocols: Vec<Arc<dyn Protocol>>,
        middlewares: Vec<Arc<dyn Middleware>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            host: config.host.clone(),
            port: config.port,
            shutdown_grace: config.shutdown_grace,
            registry: Arc::new(ProtocolRegistry::new(protocols)),
            middlewares: Arc::new(MiddlewareStack::new(middlewares)),
            shutdown,
        }
    }

    /// Binds the configured address and serves until [`MitmServer::stop`].
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already-bound listener.
    ///
    /// Transient accept errors are retried; a fatal listener error ends the
    /// call. After [`MitmServer::stop`], in-flight connections get the grace
    /// window to drain before being aborted.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "mitm server listening");
        self.middlewares
            .mitm_started(&local_addr.ip().to_string(), local_addr.port())
            .await;

        let mut connections = JoinSet::new();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted client connection");
                        let registry = Arc::clone(&self.registry);
                        let middlewares = Arc::clone(&self.middlewares);
                        connections.spawn(async move {
                            handle_connection(stream, peer, registry, middlewares).await;
                        });
                    }
                    Err(err) if is_transient_accept_error(&err) => {
                        warn!(error = %err, "accept failed, retrying");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(err) => {
                        error!(error = %err, "listener failed");
                        return Err(err.into());
                    }
                },
                _ = shutdown.changed() => {
                    info!("stop requested, draining in-flight connections");
                    break;
                }
            }

            // Reap finished connection tasks so the set stays bounded.
            while let Some(joined) = connections.try_join_next() {
                if let Err(err) = joined {
                    if err.is_panic() {
                        error!(error = %err, "connection task panicked");
                    }
                }
            }
        }

        drop(listener);

        let drained = timeout(self.shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                grace = ?self.shutdown_grace,
                "grace window elapsed, aborting remaining connections"
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        info!("mitm server stopped");
        Ok(())
    }

    /// Signals the accept loop to stop. Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Walks one accepted socket through the full connection lifecycle.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ProtocolRegistry>,
    middlewares: Arc<MiddlewareStack>,
) {
    let (reader, writer) = stream.into_split();
    let client = Host::new(Box::new(reader), Box::new(writer), Some(peer));
    let mut connection = Connection::new(client);

    middlewares.client_connected(&connection).await;

    if let Err(err) = drive_connection(&mut connection, &registry, &middlewares).await {
        if err.is_clean_close() {
            debug!(client = %connection.client, reason = %err, "session ended");
        } else {
            debug!(client = %connection.client, error = %err, "closing client");
        }
    }

    // Teardown order: close both sides (honoring the managed flags), client
    // disconnect hook first, then the server's if it ever resolved.
    close_host(&mut connection.client).await;
    middlewares.client_disconnected(&connection).await;
    if connection.protocol().is_some() {
        close_host(&mut connection.server).await;
        middlewares.server_disconnected(&connection).await;
    }
}

/// Sniff, dispatch, relay.
async fn drive_connection(
    connection: &mut Connection,
    registry: &ProtocolRegistry,
    middlewares: &MiddlewareStack,
) -> Result<(), ProxyError> {
    let max_prefix = registry.max_prefix_bytes();
    if max_prefix == 0 {
        return Err(ProxyError::invalid("no protocols registered"));
    }

    let prefix = {
        let reader = connection
            .client
            .reader
            .as_mut()
            .ok_or_else(|| ProxyError::invalid("client stream unavailable"))?;
        let mut buf = BytesMut::with_capacity(max_prefix);
        match timeout(registry.sniff_timeout(), reader.read_buf(&mut buf)).await {
            Err(_) => return Err(ProxyError::Timeout),
            Ok(Err(_)) => return Err(ProxyError::PeerClosed),
            Ok(Ok(0)) => return Err(ProxyError::PeerClosed),
            Ok(Ok(_)) => buf.freeze(),
        }
    };

    // The first bytes flow through the hook chain like any other client
    // data; destination resolution still uses the raw prefix.
    let payload = middlewares.client_data(connection, prefix.clone()).await;

    let protocol = registry.dispatch(connection, &prefix, payload).await?;

    middlewares.server_connected(connection).await;

    relay(connection, protocol.descriptor(), middlewares).await
}

/// Runs both relay directions to completion and hands the streams back for
/// teardown.
async fn relay(
    connection: &mut Connection,
    descriptor: ProtocolDescriptor,
    middlewares: &MiddlewareStack,
) -> Result<(), ProxyError> {
    let (mut client_reader, mut client_writer) = connection
        .client
        .take_streams()
        .ok_or_else(|| ProxyError::invalid("client stream unavailable"))?;
    let (mut server_reader, mut server_writer) = connection
        .server
        .take_streams()
        .ok_or_else(|| ProxyError::invalid("server stream unavailable"))?;

    let shared = RelayShared::new(&descriptor);
    let conn: &Connection = connection;

    let (client_to_server, server_to_client) = tokio::join!(
        relay_direction(
            &mut client_reader,
            &mut server_writer,
            Flow::ClientToServer,
            conn,
            middlewares,
            &shared,
        ),
        relay_direction(
            &mut server_reader,
            &mut client_writer,
            Flow::ServerToClient,
            conn,
            middlewares,
            &shared,
        ),
    );

    connection
        .client
        .replace_streams(client_reader, client_writer);
    connection
        .server
        .replace_streams(server_reader, server_writer);

    match (client_to_server, server_to_client) {
        (Err(ProxyError::Timeout), _) | (_, Err(ProxyError::Timeout)) => Err(ProxyError::Timeout),
        (Err(err), _) | (_, Err(err)) => Err(err),
        (Ok(()), Ok(())) => Ok(()),
    }
}

/// State shared by the two relay directions.
struct RelayShared {
    stop: watch::Sender<bool>,
    start: Instant,
    last_activity_ms: AtomicU64,
    client_sent: AtomicBool,
    idle: Duration,
    buffer_size: usize,
    keep_alive: bool,
}

impl RelayShared {
    fn new(descriptor: &ProtocolDescriptor) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            start: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            client_sent: AtomicBool::new(false),
            idle: descriptor.timeout,
            buffer_size: descriptor.buffer_size,
            keep_alive: descriptor.keep_alive,
        }
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// True when neither direction has made progress for the idle window.
    fn idle_everywhere(&self) -> bool {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        let now = self.start.elapsed().as_millis() as u64;
        now.saturating_sub(last) >= self.idle.as_millis() as u64
    }

    fn signal_stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Pumps one direction until EOF, write failure, a stop signal from the
/// other direction, or a session-wide idle timeout.
async fn relay_direction(
    reader: &mut StreamReader,
    writer: &mut StreamWriter,
    flow: Flow,
    connection: &Connection,
    middlewares: &MiddlewareStack,
    shared: &RelayShared,
) -> Result<(), ProxyError> {
    let mut stop = shared.stop.subscribe();
    let mut buf = BytesMut::with_capacity(shared.buffer_size);
    let mut outcome = Ok(());

    loop {
        if *stop.borrow() {
            break;
        }

        tokio::select! {
            _ = stop.changed() => break,
            read = timeout(shared.idle, read_chunk(reader, &mut buf, shared.buffer_size)) => {
                match read {
                    Err(_) => {
                        // This side is idle. Only end the session when the
                        // other direction has gone quiet for the full window
                        // too; otherwise keep listening.
                        if shared.idle_everywhere() {
                            outcome = Err(ProxyError::Timeout);
                            shared.signal_stop();
                            break;
                        }
                    }
                    Ok(Ok(0)) => {
                        outcome = Err(ProxyError::PeerClosed);
                        shared.signal_stop();
                        break;
                    }
                    Ok(Ok(_)) => {
                        shared.touch();
                        let data = buf.split().freeze();
                        let data = apply_hooks(flow, connection, middlewares, data).await;
                        if !data.is_empty() {
                            if let Err(err) = write_all_flush(writer, &data).await {
                                debug!(?flow, error = %err, "relay write failed");
                                outcome = Err(ProxyError::PeerClosed);
                                shared.signal_stop();
                                break;
                            }
                        }
                        match flow {
                            Flow::ClientToServer => {
                                shared.client_sent.store(true, Ordering::Relaxed);
                            }
                            Flow::ServerToClient => {
                                if !shared.keep_alive
                                    && shared.client_sent.load(Ordering::Relaxed)
                                {
                                    // One request/response cycle completed.
                                    shared.signal_stop();
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Err(err)) => {
                        debug!(?flow, error = %err, "relay read failed");
                        outcome = Err(ProxyError::PeerClosed);
                        shared.signal_stop();
                        break;
                    }
                }
            }
        }
    }

    // Push out anything buffered toward this peer before handing back.
    let _ = writer.flush().await;
    outcome
}

async fn apply_hooks(
    flow: Flow,
    connection: &Connection,
    middlewares: &MiddlewareStack,
    data: Bytes,
) -> Bytes {
    match flow {
        Flow::ClientToServer => middlewares.client_data(connection, data).await,
        Flow::ServerToClient => middlewares.server_data(connection, data).await,
    }
}

/// Reads up to `max` bytes into `buf`.
async fn read_chunk(
    reader: &mut StreamReader,
    buf: &mut BytesMut,
    max: usize,
) -> io::Result<usize> {
    buf.reserve(max);
    let mut limited = buf.limit(max);
    reader.read_buf(&mut limited).await
}

async fn write_all_flush(writer: &mut StreamWriter, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

/// Closes a host's streams, honoring its managed flag.
async fn close_host(host: &mut Host) {
    if !host.mitm_managed {
        // Teardown belongs to whoever handed the streams in; skip the
        // shutdown but stop using them.
        return;
    }
    if let Some(mut writer) = host.writer.take() {
        let _ = writer.shutdown().await;
    }
    host.reader.take();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_accept_errors_are_retried() {
        assert!(is_transient_accept_error(&io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset"
        )));
        assert!(!is_transient_accept_error(&io::Error::new(
            io::ErrorKind::AddrInUse,
            "in use"
        )));
    }

    #[tokio::test]
    async fn relay_shared_tracks_idleness() {
        let descriptor = ProtocolDescriptor {
            bytes_needed: 1,
            buffer_size: 1,
            timeout: Duration::from_millis(20),
            keep_alive: true,
        };
        let shared = RelayShared::new(&descriptor);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(shared.idle_everywhere());

        shared.touch();
        assert!(!shared.idle_everywhere());
    }
}
