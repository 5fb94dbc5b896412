use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::channel::{SecureChannel, TunnelStream};
use crate::error::{Result, TunnelError};
use crate::framing::{self, MAX_HEAD_LEN};
use crate::request::ProxyRequest;
use crate::response_relay::{self, RelayOutcome};
use crate::status::SharedSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Connection {
    reader: ReadHalf<TunnelStream>,
    writer: WriteHalf<TunnelStream>,
    /// Exchanges completed on this connection.
    exchanges: u64,
}

struct SessionInner {
    state: SessionState,
    conn: Option<Connection>,
    ever_connected: bool,
}

enum Liveness {
    Alive,
    Closed,
    Unsolicited(usize),
    Failed(std::io::Error),
}

/// Outcome of one attempt inside `forward`.
enum Attempt {
    Retry(TunnelError),
    Fail(TunnelError),
}

/// Client side of the tunnel: one persistent secure connection to the relay.
///
/// The tunnel carries no request identifiers, so the whole exchange
/// (send request, relay entire response) runs under a single lock. Waiters
/// acquire it in arrival order.
pub struct TunnelSession {
    channel: Arc<dyn SecureChannel>,
    relay_host: String,
    relay_port: u16,
    sink: SharedSink,
    inner: Mutex<SessionInner>,
}

impl TunnelSession {
    pub fn new(channel: Arc<dyn SecureChannel>, relay_host: String, relay_port: u16, sink: SharedSink) -> Self {
        Self {
            channel,
            relay_host,
            relay_port,
            sink,
            inner: Mutex::new(SessionInner {
                state: SessionState::Disconnected,
                conn: None,
                ever_connected: false,
            }),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Establishes the secure channel unless it is already up.
    pub async fn connect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.connect_locked(&mut inner).await
    }

    /// Sends `request` over the tunnel and streams the response to `caller`.
    ///
    /// A connection that already carried an exchange may have been closed by
    /// the relay in the meantime. If such a connection fails the send, or the
    /// relay hangs up on it before a single response byte, the session
    /// reconnects and retries once; nothing has reached `caller` at that point.
    /// A fresh connection is never retried, since the relay may already have
    /// acted on the request. Failures after the response started are wrapped
    /// in `ResponseAborted`.
    pub async fn forward<W>(&self, request: &ProxyRequest, caller: &mut W) -> Result<RelayOutcome>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut inner = self.inner.lock().await;
        let mut retried = false;

        loop {
            match self.forward_once(&mut inner, request, caller).await {
                Ok(outcome) => {
                    if !outcome.upstream_reusable() {
                        self.teardown(&mut inner).await;
                    }
                    return Ok(outcome);
                }
                Err(Attempt::Retry(e)) if !retried => {
                    self.sink.log(&format!("Tunnel unusable ({e}), reconnecting to retry request"));
                    self.teardown(&mut inner).await;
                    retried = true;
                }
                Err(Attempt::Retry(e)) | Err(Attempt::Fail(e)) => {
                    self.teardown(&mut inner).await;
                    return Err(e);
                }
            }
        }
    }

    /// Closes the tunnel: write side first, then the read side and socket.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.conn.is_some() {
            self.teardown(&mut inner).await;
            self.sink.log("Tunnel session closed");
        }
    }

    async fn forward_once<W>(
        &self,
        inner: &mut SessionInner,
        request: &ProxyRequest,
        caller: &mut W,
    ) -> std::result::Result<RelayOutcome, Attempt>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.ensure_live(inner).await.map_err(Attempt::Fail)?;
        let conn = inner
            .conn
            .as_mut()
            .ok_or_else(|| Attempt::Fail(TunnelError::PeerClosed))?;
        let reused = conn.exchanges > 0;

        if let Err(e) = send_request(&mut conn.writer, request).await {
            let e = TunnelError::Io(e);
            return Err(if reused { Attempt::Retry(e) } else { Attempt::Fail(e) });
        }
        self.sink.log(&format!("Forwarded request to relay: {}", request.request_line()));

        let (head, prefix) = match framing::read_head(&mut conn.reader, MAX_HEAD_LEN).await {
            Ok(parsed) => parsed,
            Err(TunnelError::PeerClosed) if reused => return Err(Attempt::Retry(TunnelError::PeerClosed)),
            Err(e) => return Err(Attempt::Fail(TunnelError::BadRelayResponse(Box::new(e)))),
        };
        tracing::debug!(status = %head.start_line, framing = ?head.framing, "response head from relay");
        if let Some(value) = framing::bad_content_length(&head.header_lines) {
            self.sink.log(&format!("Relay response has unparsable Content-Length {value:?}"));
        }

        let outcome = response_relay::relay_response(&head, prefix, &mut conn.reader, caller)
            .await
            .map_err(|e| {
                if let TunnelError::ChunkParseError(line) = &e {
                    self.sink.log(&format!("Error parsing chunk size {line:?}, dropping tunnel"));
                }
                Attempt::Fail(TunnelError::ResponseAborted(Box::new(e)))
            })?;
        conn.exchanges += 1;
        Ok(outcome)
    }

    async fn ensure_live(&self, inner: &mut SessionInner) -> Result<()> {
        if let Some(conn) = inner.conn.as_mut() {
            match probe(&mut conn.reader).await {
                Liveness::Alive => return Ok(()),
                Liveness::Closed => self.sink.log("Tunnel closed by relay"),
                Liveness::Unsolicited(n) => {
                    self.sink.log(&format!("Relay sent {n} unsolicited byte(s), dropping tunnel"))
                }
                Liveness::Failed(e) => self.sink.log(&format!("Tunnel read failed: {e}")),
            }
            self.teardown(inner).await;
        }

        self.connect_locked(inner).await
    }

    async fn connect_locked(&self, inner: &mut SessionInner) -> Result<()> {
        if inner.state == SessionState::Connected && inner.conn.is_some() {
            return Ok(());
        }

        if inner.ever_connected {
            self.sink.log("Reconnecting to relay...");
        }
        inner.state = SessionState::Connecting;

        match self.channel.connect(&self.relay_host, self.relay_port).await {
            Ok(stream) => {
                let (reader, writer) = tokio::io::split(stream);
                inner.conn = Some(Connection {
                    reader,
                    writer,
                    exchanges: 0,
                });
                inner.state = SessionState::Connected;
                inner.ever_connected = true;
                self.sink.log(&format!(
                    "Connected to relay at {}:{} via TLS",
                    self.relay_host, self.relay_port
                ));
                Ok(())
            }
            Err(e) => {
                inner.state = SessionState::Disconnected;
                match &e {
                    TunnelError::HandshakeFailure(msg) => self.sink.log(&format!("TLS handshake failed: {msg}")),
                    other => self.sink.log(&format!("Error connecting to relay: {other}")),
                }
                Err(e)
            }
        }
    }

    async fn teardown(&self, inner: &mut SessionInner) {
        if let Some(mut conn) = inner.conn.take() {
            if let Err(e) = conn.writer.shutdown().await {
                tracing::debug!(error = %e, "tunnel write side shutdown failed");
            }
            // Dropping both halves releases the socket.
            drop(conn.reader);
            drop(conn.writer);
        }
        inner.state = SessionState::Disconnected;
    }
}

async fn send_request<W>(writer: &mut W, request: &ProxyRequest) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&request.head_bytes()).await?;
    if !request.body.is_empty() {
        writer.write_all(&request.body).await?;
    }
    writer.flush().await
}

/// Polls the read side once without waiting.
async fn probe<R>(reader: &mut R) -> Liveness
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut byte = [0u8; 1];
    poll_fn(|cx| {
        let mut buf = ReadBuf::new(&mut byte);
        match Pin::new(&mut *reader).poll_read(cx, &mut buf) {
            Poll::Pending => Poll::Ready(Liveness::Alive),
            Poll::Ready(Ok(())) if buf.filled().is_empty() => Poll::Ready(Liveness::Closed),
            Poll::Ready(Ok(())) => Poll::Ready(Liveness::Unsolicited(buf.filled().len())),
            Poll::Ready(Err(e)) => Poll::Ready(Liveness::Failed(e)),
        }
    })
    .await
}
