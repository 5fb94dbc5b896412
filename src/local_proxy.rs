use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::config::ClientSettings;
use crate::error::{Result, TunnelError};
use crate::framing;
use crate::net;
use crate::request::{self, ProxyRequest};
use crate::session::TunnelSession;
use crate::status::SharedSink;

/// Pause after a failed accept so descriptor exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Plaintext listener local callers use as their HTTP proxy.
///
/// Each accepted connection carries exactly one request; it is parsed and
/// validated here, then handed to the shared [`TunnelSession`].
pub struct LocalProxy {
    listener: TcpListener,
    session: Arc<TunnelSession>,
    sink: SharedSink,
    max_head_len: usize,
    max_request_body: usize,
}

impl LocalProxy {
    pub async fn bind(settings: &ClientSettings, session: Arc<TunnelSession>, sink: SharedSink) -> Result<Self> {
        let listener = net::bind_reusable(&settings.bind_addr()).await?;
        Ok(Self {
            listener,
            session,
            sink,
            max_head_len: settings.max_head_len,
            max_request_body: settings.max_request_body,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts callers until `shutdown` flips or its sender goes away.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.local_addr() {
            self.sink.log(&format!("Client running as local proxy on {addr}"));
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session = self.session.clone();
                        let sink = self.sink.clone();
                        let limits = (self.max_head_len, self.max_request_body);
                        tokio::spawn(async move {
                            if let Err(e) = handle_caller(stream, peer, session, sink.clone(), limits).await {
                                sink.log(&format!("Error handling client {peer}: {e}"));
                            }
                        });
                    }
                    Err(e) => {
                        self.sink.log(&format!("Error accepting local connection: {e}"));
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        self.sink.log("Local proxy stopped accepting connections");
    }
}

async fn handle_caller(
    stream: TcpStream,
    peer: SocketAddr,
    session: Arc<TunnelSession>,
    sink: SharedSink,
    (max_head_len, max_request_body): (usize, usize),
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let request: ProxyRequest = match request::read_request(&mut reader, max_head_len, max_request_body).await {
        Ok(request) => request,
        Err(TunnelError::PeerClosed) => return Ok(()),
        Err(
            e @ (TunnelError::MalformedRequest(_)
            | TunnelError::UnsupportedMethod(_)
            | TunnelError::HeadTooLarge(_)),
        ) => {
            sink.log(&format!("Rejecting request from {peer}: {e}"));
            request::send_error(&mut writer, &e).await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    sink.log(&format!("Incoming request: {}", request.request_line()));
    if let Some(value) = framing::bad_content_length(&request.header_lines) {
        sink.log(&format!("Ignoring unparsable Content-Length {value:?} from {peer}"));
    }

    match session.forward(&request, &mut writer).await {
        Ok(outcome) => {
            tracing::debug!(%peer, body_bytes = outcome.body_bytes, "request complete");
        }
        Err(TunnelError::ResponseAborted(e)) => {
            sink.log(&format!("Error relaying response for {}: {e}", request.request_line()));
        }
        Err(e) => {
            sink.log(&format!("Error forwarding request to relay: {e}"));
            request::send_error(&mut writer, &e).await?;
        }
    }

    writer.shutdown().await?;
    Ok(())
}
