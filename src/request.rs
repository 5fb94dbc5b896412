use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TunnelError};
use crate::framing::{self, BodyFraming, MessageHead};

/// One HTTP request as received from a local caller or off the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub header_lines: Vec<String>,
    pub body: Bytes,
}

impl ProxyRequest {
    /// Validates the request line of `head`. Only GET and POST are accepted.
    pub fn from_head(head: MessageHead, body: Bytes) -> Result<Self> {
        let line = head.start_line.trim();
        if line.is_empty() {
            return Err(TunnelError::MalformedRequest("empty request line".to_string()));
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(TunnelError::MalformedRequest(line.to_string()));
        }

        let method = parts[0].to_ascii_uppercase();
        if method != "GET" && method != "POST" {
            return Err(TunnelError::UnsupportedMethod(parts[0].to_string()));
        }

        Ok(Self {
            method,
            target: parts[1].to_string(),
            version: parts[2].to_string(),
            header_lines: head.header_lines,
            body,
        })
    }

    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.target, self.version)
    }

    /// Request line, header lines verbatim, then the blank line.
    pub fn head_bytes(&self) -> Vec<u8> {
        MessageHead {
            start_line: self.request_line(),
            header_lines: self.header_lines.clone(),
            framing: BodyFraming::CloseDelimited,
        }
        .to_bytes()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_lines.iter().find_map(|line| {
            let (key, value) = framing::split_header(line)?;
            key.eq_ignore_ascii_case(name).then_some(value)
        })
    }
}

/// Reads exactly one request, body included, from a local caller.
///
/// Bodies are only accepted with `Content-Length` framing and up to `max_body` bytes.
pub async fn read_request<R>(reader: &mut R, max_head: usize, max_body: usize) -> Result<ProxyRequest>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let (head, prefix) = framing::read_head(reader, max_head).await?;
    let framing = head.framing;
    let request = ProxyRequest::from_head(head, Bytes::new())?;

    let body = match framing {
        BodyFraming::CloseDelimited => Bytes::new(),
        BodyFraming::Chunked => {
            return Err(TunnelError::MalformedRequest(
                "chunked request bodies are not supported".to_string(),
            ))
        }
        BodyFraming::ContentLength(len) => {
            let len = usize::try_from(len)
                .ok()
                .filter(|len| *len <= max_body)
                .ok_or_else(|| {
                    TunnelError::MalformedRequest(format!("request body of {len} bytes exceeds {max_body}"))
                })?;
            let (body, _) = framing::read_sized_body(prefix, reader, len).await?;
            body
        }
    };

    Ok(ProxyRequest { body, ..request })
}

/// Renders a complete plain-text error response.
pub fn error_response(code: u16, reason: &str, message: &str) -> Vec<u8> {
    let body = format!("{message}\r\n");
    format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

/// Answers `err` with the matching synthesized response and flushes it.
pub async fn send_error<W>(writer: &mut W, err: &TunnelError) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let (code, reason) = err.status();
    let message = match err {
        TunnelError::MissingHost => "Bad Request: Missing Host Header".to_string(),
        TunnelError::TargetUnreachable { .. } => "Bad Gateway: Unable to reach target host".to_string(),
        other if code == 502 => format!("Bad Gateway: {other}"),
        _ => reason.to_string(),
    };
    writer.write_all(&error_response(code, reason, &message)).await?;
    writer.flush().await
}
