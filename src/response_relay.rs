//! Streams one relayed response from the tunnel to the local caller.
//!
//! Memory use is bounded by [`RELAY_BUFFER_SIZE`] whatever the response size;
//! every slice is flushed to the caller as soon as it has been read.

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Result, TunnelError};
use crate::framing::{latin1_decode, BodyFraming, MessageHead};

pub const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// Longest chunk-size or trailer line accepted.
const MAX_CHUNK_LINE: usize = 4096;

/// What a finished relay left behind on the upstream side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayOutcome {
    /// Body bytes written to the caller, chunk framing included.
    pub body_bytes: u64,
    /// The upstream reached end-of-stream.
    pub upstream_eof: bool,
    /// Bytes read from upstream that were not part of this response.
    pub leftover: usize,
}

impl RelayOutcome {
    /// Whether the upstream can carry another message after this one.
    pub fn upstream_reusable(&self) -> bool {
        !self.upstream_eof && self.leftover == 0
    }
}

/// Writes `head` to `caller`, then streams the body according to its framing.
///
/// `prefix` holds body bytes that were read together with the header block.
pub async fn relay_response<R, W>(
    head: &MessageHead,
    prefix: Bytes,
    upstream: &mut R,
    caller: &mut W,
) -> Result<RelayOutcome>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    emit(caller, &head.to_bytes()).await?;

    let outcome = match head.framing {
        BodyFraming::ContentLength(len) => relay_sized(len, prefix, upstream, caller).await?,
        BodyFraming::Chunked => relay_chunked(prefix, upstream, caller).await?,
        BodyFraming::CloseDelimited => relay_until_eof(prefix, upstream, caller).await?,
    };

    tracing::debug!(
        framing = ?head.framing,
        body_bytes = outcome.body_bytes,
        upstream_eof = outcome.upstream_eof,
        "response relayed"
    );
    Ok(outcome)
}

async fn emit<W>(caller: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if bytes.is_empty() {
        return Ok(());
    }
    caller.write_all(bytes).await.map_err(TunnelError::CallerWrite)?;
    caller.flush().await.map_err(TunnelError::CallerWrite)
}

fn truncated(what: &str) -> TunnelError {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, format!("upstream closed inside {what}")).into()
}

async fn relay_sized<R, W>(len: u64, prefix: Bytes, upstream: &mut R, caller: &mut W) -> Result<RelayOutcome>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let from_prefix = prefix.len().min(usize::try_from(len).unwrap_or(usize::MAX));
    emit(caller, &prefix[..from_prefix]).await?;

    let mut outcome = RelayOutcome {
        body_bytes: from_prefix as u64,
        leftover: prefix.len() - from_prefix,
        ..RelayOutcome::default()
    };

    let mut remaining = len - from_prefix as u64;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = upstream.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(truncated("a sized body"));
        }
        emit(caller, &buf[..n]).await?;
        remaining -= n as u64;
        outcome.body_bytes += n as u64;
    }

    Ok(outcome)
}

async fn relay_until_eof<R, W>(prefix: Bytes, upstream: &mut R, caller: &mut W) -> Result<RelayOutcome>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    emit(caller, &prefix).await?;
    let mut outcome = RelayOutcome {
        body_bytes: prefix.len() as u64,
        upstream_eof: true,
        leftover: 0,
    };

    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = upstream.read(&mut buf).await?;
        if n == 0 {
            return Ok(outcome);
        }
        emit(caller, &buf[..n]).await?;
        outcome.body_bytes += n as u64;
    }
}

async fn relay_chunked<R, W>(prefix: Bytes, upstream: &mut R, caller: &mut W) -> Result<RelayOutcome>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut reader = BufReader::with_capacity(RELAY_BUFFER_SIZE, (&prefix[..]).chain(upstream));
    let mut outcome = RelayOutcome::default();
    let mut line = Vec::with_capacity(64);
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        read_line(&mut reader, &mut line).await?;
        emit(caller, &line).await?;
        outcome.body_bytes += line.len() as u64;

        let size = parse_chunk_size(&line)?;
        if size == 0 {
            // Trailer section, up to and including the blank line.
            loop {
                read_line(&mut reader, &mut line).await?;
                emit(caller, &line).await?;
                outcome.body_bytes += line.len() as u64;
                if line == b"\r\n" || line == b"\n" {
                    break;
                }
            }
            break;
        }

        let mut remaining = size;
        while remaining > 0 {
            let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(truncated("chunk data"));
            }
            emit(caller, &buf[..n]).await?;
            remaining -= n as u64;
            outcome.body_bytes += n as u64;
        }

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await.map_err(|_| truncated("chunk data"))?;
        if &crlf != b"\r\n" {
            return Err(TunnelError::ChunkParseError(latin1_decode(&crlf)));
        }
        emit(caller, &crlf).await?;
        outcome.body_bytes += 2;
    }

    let (rest_of_prefix, _) = reader.get_ref().get_ref();
    outcome.leftover = reader.buffer().len() + rest_of_prefix.len();
    Ok(outcome)
}

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    line.clear();
    let n = (&mut *reader).take(MAX_CHUNK_LINE as u64).read_until(b'\n', line).await?;
    if n == 0 {
        return Err(truncated("chunk framing"));
    }
    if line.last() != Some(&b'\n') {
        if n == MAX_CHUNK_LINE {
            return Err(TunnelError::ChunkParseError(latin1_decode(&line[..32])));
        }
        return Err(truncated("chunk framing"));
    }
    Ok(())
}

/// Parses a chunk-size line (`1a;ext=1\r\n`) into its size.
pub fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let text = latin1_decode(line);
    let size = text
        .trim_end_matches(['\r', '\n'])
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    u64::from_str_radix(size, 16).map_err(|_| TunnelError::ChunkParseError(text.trim_end().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn relay(raw_head: &str, prefix: &'static [u8], rest: &'static [u8]) -> (Result<RelayOutcome>, Vec<u8>) {
        let head = MessageHead::parse(raw_head.as_bytes());
        let mut upstream = Cursor::new(rest.to_vec());
        let mut caller = Vec::new();
        let outcome = relay_response(&head, Bytes::from_static(prefix), &mut upstream, &mut caller).await;
        (outcome, caller)
    }

    #[tokio::test]
    async fn sized_body_forwards_exactly_len_bytes() {
        let (outcome, out) = relay(
            "HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\n",
            b"",
            b"hello worldEXTRA",
        )
        .await;
        let outcome = outcome.unwrap();
        assert_eq!(out, b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello world".to_vec());
        assert_eq!(outcome.body_bytes, 11);
        assert!(!outcome.upstream_eof);
    }

    #[tokio::test]
    async fn sized_body_accounts_for_prefix() {
        let head = "HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\n";
        for split in [0usize, 1, 5, 11] {
            let body: &'static [u8] = b"hello world";
            let (outcome, out) = relay(head, &body[..split], &body[split..]).await;
            assert_eq!(outcome.unwrap().body_bytes, 11);
            assert!(out.ends_with(b"\r\n\r\nhello world"));
        }
    }

    #[tokio::test]
    async fn sized_body_reports_prefix_overrun() {
        let (outcome, out) = relay("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n", b"helloNEXT", b"").await;
        let outcome = outcome.unwrap();
        assert!(out.ends_with(b"\r\n\r\nhello"));
        assert_eq!(outcome.leftover, 4);
        assert!(!outcome.upstream_reusable());
    }

    #[tokio::test]
    async fn sized_body_fails_on_short_upstream() {
        let (outcome, _) = relay("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n", b"", b"abc").await;
        assert!(matches!(outcome, Err(TunnelError::Io(_))));
    }

    #[tokio::test]
    async fn chunked_body_is_forwarded_verbatim() {
        let (outcome, out) = relay(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
            b"5\r\nhel",
            b"lo\r\n0\r\n\r\nNOT-PART-OF-RESPONSE",
        )
        .await;
        let outcome = outcome.unwrap();
        assert_eq!(
            out,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n".to_vec()
        );
        assert_eq!(outcome.body_bytes, 15);
        assert_eq!(outcome.leftover, "NOT-PART-OF-RESPONSE".len());
    }

    #[tokio::test]
    async fn chunked_body_forwards_trailers_and_extensions() {
        let (outcome, out) = relay(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
            b"",
            b"3;name=v\r\nabc\r\n0\r\nX-Checksum: 1\r\n\r\n",
        )
        .await;
        assert!(outcome.unwrap().upstream_reusable());
        assert!(out.ends_with(b"3;name=v\r\nabc\r\n0\r\nX-Checksum: 1\r\n\r\n"));
    }

    #[tokio::test]
    async fn malformed_chunk_size_aborts_response() {
        let (outcome, out) = relay(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
            b"",
            b"zz\r\nwhatever\r\n",
        )
        .await;
        assert!(matches!(outcome, Err(TunnelError::ChunkParseError(line)) if line == "zz"));
        assert!(out.ends_with(b"zz\r\n"));
    }

    #[tokio::test]
    async fn close_delimited_body_runs_to_eof() {
        let (outcome, out) = relay("HTTP/1.0 200 OK\r\nServer: x\r\n\r\n", b"first ", b"and the rest").await;
        let outcome = outcome.unwrap();
        assert!(out.ends_with(b"\r\n\r\nfirst and the rest"));
        assert!(outcome.upstream_eof);
        assert_eq!(outcome.body_bytes, 18);
    }

    #[test]
    fn chunk_sizes_parse_as_hex() {
        assert_eq!(parse_chunk_size(b"1A\r\n").unwrap(), 26);
        assert_eq!(parse_chunk_size(b"ff ; ext\r\n").unwrap(), 255);
        assert!(parse_chunk_size(b"\r\n").is_err());
        assert!(parse_chunk_size(b"0x10\r\n").is_err());
    }
}
