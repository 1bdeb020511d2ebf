//! Built-in HTTP/1.x protocol handler.
//!
//! Implements HTTP proxy semantics: transparent pass-through for plain
//! requests, and the `CONNECT` tunnel dance for HTTPS, where the proxy
//! answers the tunnel request itself, presents a leaf minted for the
//! destination host, and opens a verified TLS session to the real server.
//! The relay then sees plaintext on both sides.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{split, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::core::{Connection, Host};
use crate::crypto::{CertificateAuthority, ClientFacingTls, UpstreamTls};
use crate::error::ProxyError;
use crate::protocol::{Protocol, ProtocolDescriptor};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";
const MAX_HEADERS: usize = 64;

/// HTTP/1.0 and HTTP/1.1 with `CONNECT` tunnelling.
///
/// `bytes_needed` is 8192 so the whole request head fits in the sniffed
/// prefix; HTTP/1.1 puts no bound on the first line, so this matches what
/// other proxies settle on.
pub struct HttpProtocol {
    ca: Arc<CertificateAuthority>,
    upstream_tls: UpstreamTls,
    descriptor: ProtocolDescriptor,
}

impl HttpProtocol {
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self {
            ca,
            upstream_tls: UpstreamTls::new(),
            descriptor: ProtocolDescriptor {
                bytes_needed: 8192,
                buffer_size: 8192,
                timeout: Duration::from_secs(5),
                keep_alive: true,
            },
        }
    }

    /// Replaces the upstream trust anchors, for destinations signed by a
    /// private CA.
    pub fn with_upstream_tls(mut self, upstream_tls: UpstreamTls) -> Self {
        self.upstream_tls = upstream_tls;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.descriptor.buffer_size = buffer_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.descriptor.keep_alive = keep_alive;
        self
    }

    /// `CONNECT` path: answer the tunnel request, impersonate the
    /// destination toward the client, then open a verified TLS session to
    /// the real destination.
    ///
    /// The sniffed prefix terminates here; it is the `CONNECT` request
    /// itself and is never forwarded upstream.
    async fn connect_tls(
        &self,
        connection: &mut Connection,
        authority: &str,
    ) -> Result<(), ProxyError> {
        let (host, port) = parse_authority(authority)?;

        let (reader, mut writer) = connection
            .client
            .take_streams()
            .ok_or_else(|| ProxyError::invalid("client stream unavailable"))?;

        writer
            .write_all(CONNECT_ESTABLISHED)
            .await
            .map_err(|e| ProxyError::invalid(format!("CONNECT reply failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| ProxyError::invalid(format!("CONNECT reply failed: {e}")))?;

        // Mint before handshaking so the acceptor presents the destination's
        // identity.
        let leaf = self
            .ca
            .leaf_for(&host)
            .await
            .map_err(|e| ProxyError::invalid(format!("leaf issuance for {host} failed: {e}")))?;
        let server_config = ClientFacingTls::for_leaf(&leaf, self.ca.ca_certificate())
            .map_err(|e| ProxyError::invalid(format!("TLS config for {host} failed: {e}")))?;
        let acceptor = TlsAcceptor::from(server_config);

        let client_stream = tokio::io::join(reader, writer);
        let client_tls = acceptor
            .accept(client_stream)
            .await
            .map_err(|e| ProxyError::invalid(format!("client TLS handshake failed: {e}")))?;
        debug!(%host, port, "client TLS handshake complete");
        let (tls_reader, tls_writer) = split(client_tls);
        connection
            .client
            .replace_streams(Box::new(tls_reader), Box::new(tls_writer));

        // Upstream: TCP, then TLS with real verification.
        let upstream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| ProxyError::unreachable(format!("{host}:{port}: {e}")))?;
        let peer_addr = upstream.peer_addr().ok();
        let server_name = UpstreamTls::server_name(&host)
            .map_err(|e| ProxyError::unreachable(e.to_string()))?;
        let connector = TlsConnector::from(self.upstream_tls.client_config());
        let upstream_tls = connector.connect(server_name, upstream).await.map_err(|e| {
            ProxyError::unreachable(format!("upstream TLS handshake with {host}:{port}: {e}"))
        })?;
        debug!(%host, port, "upstream TLS handshake complete");
        let (up_reader, up_writer) = split(upstream_tls);
        connection.server = Host::new(Box::new(up_reader), Box::new(up_writer), peer_addr);

        Ok(())
    }

    /// Plain path: the sniffed prefix is the real request, so it is
    /// forwarded (post-middleware) before the relay takes over.
    async fn connect_plain(
        &self,
        connection: &mut Connection,
        host_header: &str,
        payload: Bytes,
    ) -> Result<(), ProxyError> {
        let (host, port) = split_host_port(host_header);

        let upstream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| ProxyError::unreachable(format!("{host}:{port}: {e}")))?;
        let peer_addr = upstream.peer_addr().ok();
        debug!(%host, port, "plaintext upstream connected");
        let (reader, mut writer) = upstream.into_split();

        writer
            .write_all(&payload)
            .await
            .map_err(|e| ProxyError::unreachable(format!("initial request forward failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| ProxyError::unreachable(format!("initial request forward failed: {e}")))?;

        connection.server = Host::new(Box::new(reader), Box::new(writer), peer_addr);
        Ok(())
    }
}

#[async_trait]
impl Protocol for HttpProtocol {
    fn name(&self) -> &'static str {
        "http"
    }

    fn descriptor(&self) -> ProtocolDescriptor {
        self.descriptor
    }

    async fn connect(
        &self,
        connection: &mut Connection,
        prefix: &[u8],
        payload: Bytes,
    ) -> Result<(), ProxyError> {
        let request = parse_request(prefix)?;

        if request.method.eq_ignore_ascii_case("CONNECT") {
            debug!(target = %request.target, "CONNECT tunnel requested");
            self.connect_tls(connection, &request.target).await
        } else {
            let host = request
                .host
                .as_deref()
                .ok_or_else(|| ProxyError::invalid("missing Host header"))?
                .to_owned();
            self.connect_plain(connection, &host, payload).await
        }
    }
}

/// Minimal view of the first request. The parser collaborator yields method,
/// target and headers; this is all the handler consumes.
#[derive(Debug)]
struct SniffedRequest {
    method: String,
    target: String,
    host: Option<String>,
}

fn parse_request(prefix: &[u8]) -> Result<SniffedRequest, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(prefix) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::invalid("incomplete HTTP request head"))
        }
        Err(e) => return Err(ProxyError::invalid(format!("malformed HTTP request: {e}"))),
    }

    let method = request
        .method
        .ok_or_else(|| ProxyError::invalid("missing request method"))?
        .to_string();
    let target = request
        .path
        .ok_or_else(|| ProxyError::invalid("missing request target"))?
        .to_string();
    let host = request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(|v| v.trim().to_string());

    Ok(SniffedRequest {
        method,
        target,
        host,
    })
}

/// Splits a `CONNECT` authority into host and port. The split is on the last
/// colon so bracketed IPv6 literals survive.
fn parse_authority(authority: &str) -> Result<(String, u16), ProxyError> {
    let (host, port) = authority.rsplit_once(':').ok_or_else(|| {
        ProxyError::invalid(format!("CONNECT target {authority:?} lacks a port"))
    })?;
    if host.is_empty() {
        return Err(ProxyError::invalid("CONNECT target has an empty host"));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyError::invalid(format!("invalid CONNECT port {port:?}")))?;
    if port == 0 {
        return Err(ProxyError::invalid("CONNECT port must be between 1 and 65535"));
    }
    Ok((strip_brackets(host).to_string(), port))
}

/// Host-header value to `(host, port)`. Port 80 unless the header carries an
/// explicit one; TLS is only ever signaled through `CONNECT`.
fn split_host_port(value: &str) -> (String, u16) {
    if let Some((host, port)) = value.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            if port != 0 {
                return (strip_brackets(host).to_string(), port);
            }
        }
    }
    (strip_brackets(value).to_string(), 80)
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
