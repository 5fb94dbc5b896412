//! Relay side of the tunnel: performs the real outbound fetch.
//!
//! Each tunnel connection carries one request. The request is reduced to a
//! minimal GET or POST, sent in plaintext to the host named by its `Host`
//! header, and the raw response is streamed back without interpretation.

use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use http::uri::{Authority, PathAndQuery};
use http::Uri;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::RelaySettings;
use crate::error::{Result, TunnelError};
use crate::framing::{self, BodyFraming, MessageHead};
use crate::request::{self, ProxyRequest};
use crate::response_relay::RELAY_BUFFER_SIZE;
use crate::status::SharedSink;

pub const USER_AGENT: &str = "Mozilla/5.0 (compatible; tls-http-tunnel relay)";

/// A tunnel peer and the request it is being served.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    pub remote_addr: SocketAddr,
    pub request: ProxyRequest,
    pub target_host: String,
}

/// Request line after normalization to GET or POST in origin form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedLine {
    pub method: &'static str,
    pub path: String,
    pub version: String,
}

impl NormalizedLine {
    /// Anything other than GET or POST becomes `GET / HTTP/1.1`.
    pub fn from_request_line(line: &str) -> Self {
        let mut parts = line.split_whitespace();
        let method = match parts.next() {
            Some(m) if m.eq_ignore_ascii_case("GET") => "GET",
            Some(m) if m.eq_ignore_ascii_case("POST") => "POST",
            _ => {
                return Self {
                    method: "GET",
                    path: "/".to_string(),
                    version: "HTTP/1.1".to_string(),
                }
            }
        };

        let path = origin_form(parts.next().unwrap_or("/"));
        let version = parts
            .next()
            .filter(|v| v.starts_with("HTTP/1."))
            .unwrap_or("HTTP/1.1")
            .to_string();

        Self { method, path, version }
    }
}

/// Reduces an absolute-form target to its path and query.
pub fn origin_form(target: &str) -> String {
    let Ok(uri) = Uri::from_str(target) else {
        return "/".to_string();
    };
    match uri.path_and_query().map(PathAndQuery::as_str) {
        Some(pq) if pq.starts_with('/') => pq.to_string(),
        Some(pq) if pq.starts_with('?') => format!("/{pq}"),
        _ => "/".to_string(),
    }
}

/// Splits a `Host` header value into host name and optional port.
///
/// IPv6 literals come back without their brackets. Returns `None` for values
/// that are not a valid authority.
pub fn split_host(value: &str) -> Option<(String, Option<u16>)> {
    let authority = Authority::from_str(value).ok()?;
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    Some((host.to_string(), authority.port_u16()))
}

/// Outbound request bytes sent to the target.
pub fn outbound_request(line: &NormalizedLine, host: &str, content_type: Option<&str>, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "{} {} {}\r\nHost: {host}\r\nUser-Agent: {USER_AGENT}\r\nAccept: */*\r\n",
        line.method, line.path, line.version
    );
    if line.method == "POST" {
        if let Some(content_type) = content_type {
            out.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    out.push_str("Connection: close\r\n\r\n");

    let mut bytes = framing::latin1_encode(&out);
    if line.method == "POST" {
        bytes.extend_from_slice(body);
    }
    bytes
}

pub struct TargetFetcher {
    target_port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_head_len: usize,
    max_request_body: usize,
    sink: SharedSink,
}

impl TargetFetcher {
    pub fn new(settings: &RelaySettings, sink: SharedSink) -> Self {
        Self {
            target_port: settings.target_port,
            connect_timeout: settings.connect_timeout(),
            read_timeout: settings.read_timeout(),
            max_head_len: settings.max_head_len,
            max_request_body: settings.max_request_body,
            sink,
        }
    }

    /// Serves one request/response cycle, then closes the tunnel connection.
    pub async fn handle<S>(&self, mut tunnel: S, remote_addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let result = self.serve_one(&mut tunnel, remote_addr).await;
        if let Err(e) = tunnel.shutdown().await {
            tracing::debug!(%remote_addr, error = %e, "tunnel shutdown failed");
        }
        result
    }

    async fn serve_one<S>(&self, tunnel: &mut S, remote_addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let user = remote_addr.ip();
        let (head, prefix) = match framing::read_head(tunnel, self.max_head_len).await {
            Ok(parsed) => parsed,
            Err(TunnelError::PeerClosed) => {
                self.sink.log(&format!("Client {user} disconnected."));
                return Ok(());
            }
            Err(e @ TunnelError::HeadTooLarge(_)) => {
                request::send_error(tunnel, &e).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.sink.log(&format!("Incoming request from {user}: {}", head.start_line));
        if let Some(value) = framing::bad_content_length(&head.header_lines) {
            self.sink.log(&format!("Ignoring unparsable Content-Length {value:?} from {user}"));
        }

        let Some(host) = head.header("host").map(str::to_string) else {
            self.sink.log(&format!("No Host header found for {user}!"));
            request::send_error(tunnel, &TunnelError::MissingHost).await?;
            return Ok(());
        };
        let Some((host_name, _)) = split_host(&host) else {
            let e = TunnelError::MalformedRequest(format!("invalid Host header {host:?}"));
            self.sink.log(&format!("Rejecting request from {user}: {e}"));
            request::send_error(tunnel, &e).await?;
            return Ok(());
        };

        let body = match self.read_body(&head, prefix, tunnel).await {
            Ok(body) => body,
            Err(e) => {
                self.sink.log(&format!("Rejecting request body from {user}: {e}"));
                request::send_error(tunnel, &e).await?;
                return Ok(());
            }
        };

        let client = ConnectedClient {
            remote_addr,
            request: tunneled_request(&head, body),
            target_host: host,
        };
        self.fetch(&client, &host_name, tunnel).await
    }

    async fn read_body<S>(&self, head: &MessageHead, prefix: Bytes, tunnel: &mut S) -> Result<Bytes>
    where
        S: AsyncRead + Unpin,
    {
        match head.framing {
            BodyFraming::CloseDelimited => Ok(Bytes::new()),
            BodyFraming::Chunked => Err(TunnelError::MalformedRequest(
                "chunked request bodies are not supported".to_string(),
            )),
            BodyFraming::ContentLength(len) => {
                let len = usize::try_from(len)
                    .ok()
                    .filter(|len| *len <= self.max_request_body)
                    .ok_or_else(|| TunnelError::MalformedRequest(format!("request body of {len} bytes is too large")))?;
                let (body, _) = framing::read_sized_body(prefix, tunnel, len).await?;
                Ok(body)
            }
        }
    }

    async fn fetch<S>(&self, client: &ConnectedClient, host_name: &str, tunnel: &mut S) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let user = client.remote_addr.ip();
        let addr = format!("{host_name}:{}", self.target_port);

        let line = NormalizedLine::from_request_line(&client.request.request_line());
        let outbound = outbound_request(
            &line,
            &client.target_host,
            client.request.header("content-type"),
            &client.request.body,
        );

        self.sink.log(&format!("Forwarding request from {user} to {}", client.target_host));

        let mut target = match self.open_target(host_name, &addr, &outbound).await {
            Ok(target) => target,
            Err(e) => {
                self.sink.log(&format!("Error forwarding request for user {user}: {e}"));
                request::send_error(tunnel, &e).await?;
                return Ok(());
            }
        };

        let mut relayed = 0u64;
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = match tokio::time::timeout(self.read_timeout, target.read(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) if relayed == 0 => {
                    return self.unreachable(tunnel, user, &addr, e).await;
                }
                Err(_) if relayed == 0 => {
                    let e = io::Error::new(io::ErrorKind::TimedOut, "no response from target");
                    return self.unreachable(tunnel, user, &addr, e).await;
                }
                Ok(Err(e)) => {
                    self.sink.log(&format!("Target {addr} failed mid-response for {user}: {e}"));
                    break;
                }
                Err(_) => {
                    self.sink.log(&format!("Target {addr} stalled mid-response for {user}"));
                    break;
                }
            };
            if n == 0 {
                if relayed == 0 {
                    let e = io::Error::new(io::ErrorKind::UnexpectedEof, "target closed without responding");
                    return self.unreachable(tunnel, user, &addr, e).await;
                }
                break;
            }
            tunnel.write_all(&buf[..n]).await?;
            tunnel.flush().await?;
            relayed += n as u64;
        }

        tracing::debug!(%user, target = %addr, relayed, "target response relayed");
        Ok(())
    }

    async fn open_target(&self, host_name: &str, addr: &str, outbound: &[u8]) -> Result<TcpStream> {
        let unreachable = |source: io::Error| TunnelError::TargetUnreachable {
            addr: addr.to_string(),
            source,
        };

        let mut target = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host_name, self.target_port)))
            .await
            .map_err(|_| unreachable(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))?
            .map_err(unreachable)?;

        target.write_all(outbound).await.map_err(unreachable)?;
        target.flush().await.map_err(unreachable)?;
        Ok(target)
    }

    async fn unreachable<S>(&self, tunnel: &mut S, user: std::net::IpAddr, addr: &str, source: io::Error) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        let e = TunnelError::TargetUnreachable {
            addr: addr.to_string(),
            source,
        };
        self.sink.log(&format!("Error forwarding request for user {user}: {e}"));
        request::send_error(tunnel, &e).await?;
        Ok(())
    }
}

/// Keeps the tunneled request as received; normalization happens at fetch time.
fn tunneled_request(head: &MessageHead, body: Bytes) -> ProxyRequest {
    let mut parts = head.start_line.split_whitespace();
    ProxyRequest {
        method: parts.next().unwrap_or_default().to_string(),
        target: parts.next().unwrap_or_default().to_string(),
        version: parts.next().unwrap_or_default().to_string(),
        header_lines: head.header_lines.clone(),
        body,
    }
}
