//! HTTP/1.x message framing shared by both ends of the tunnel.
//!
//! The header block is located with a byte-wise matcher for `CR LF CR LF`
//! so detection never depends on line buffering. Any bytes that were read
//! from the source past the terminator are handed back as a body prefix;
//! they belong to the body and must be relayed before anything else is read.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, TunnelError};

/// Upper bound on a header block, terminator included.
pub const MAX_HEAD_LEN: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Progress of the header terminator matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminatorState {
    #[default]
    None,
    Cr,
    CrLf,
    CrLfCr,
    Found,
}

impl TerminatorState {
    /// Feeds one byte to the matcher.
    ///
    /// A byte that breaks the expected continuation resets to `None`, except
    /// `\r`, which always starts a new match.
    pub fn advance(self, byte: u8) -> Self {
        match (self, byte) {
            (TerminatorState::Found, _) => TerminatorState::Found,
            (TerminatorState::Cr, b'\n') => TerminatorState::CrLf,
            (TerminatorState::CrLf, b'\r') => TerminatorState::CrLfCr,
            (TerminatorState::CrLfCr, b'\n') => TerminatorState::Found,
            (_, b'\r') => TerminatorState::Cr,
            _ => TerminatorState::None,
        }
    }
}

/// How the end of a message body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

/// Start line and header lines of one HTTP message, decoded as Latin-1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHead {
    pub start_line: String,
    pub header_lines: Vec<String>,
    pub framing: BodyFraming,
}

impl MessageHead {
    /// Builds a head from raw header bytes, terminator excluded or included.
    pub fn parse(raw: &[u8]) -> Self {
        let text = latin1_decode(raw);
        let mut lines = text.split("\r\n").filter(|line| !line.is_empty());
        let start_line = lines.next().unwrap_or_default().to_string();
        let header_lines: Vec<String> = lines.map(str::to_string).collect();
        let framing = framing_of(&header_lines);

        Self {
            start_line,
            header_lines,
            framing,
        }
    }

    /// Returns the value of the first header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_lines.iter().find_map(|line| {
            let (key, value) = split_header(line)?;
            key.eq_ignore_ascii_case(name).then_some(value)
        })
    }

    /// Serializes the head back to wire form, blank line included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.start_line.len() + 64 * (self.header_lines.len() + 1));
        out.extend(latin1_encode(&self.start_line));
        out.extend_from_slice(b"\r\n");
        for line in &self.header_lines {
            out.extend(latin1_encode(line));
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Reads a header block from `reader`.
///
/// Returns the parsed head and whatever bytes followed the terminator in the
/// last read. Fails with `PeerClosed` if the stream ends (or is reset) before
/// a single byte arrives, and with `HeadTooLarge` once `max_len` bytes pass without a terminator.
pub async fn read_head<R>(reader: &mut R, max_len: usize) -> Result<(MessageHead, Bytes)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut state = TerminatorState::None;
    let mut scanned = 0;

    loop {
        while scanned < buf.len() && state != TerminatorState::Found {
            state = state.advance(buf[scanned]);
            scanned += 1;
        }

        if state == TerminatorState::Found {
            let prefix = buf.split_off(scanned).freeze();
            let head = MessageHead::parse(&buf);
            tracing::trace!(head_len = scanned, prefix_len = prefix.len(), "header block read");
            return Ok((head, prefix));
        }

        if buf.len() >= max_len {
            return Err(TunnelError::HeadTooLarge(max_len));
        }

        buf.reserve(READ_CHUNK);
        let remaining = (max_len - buf.len()) as u64;
        let n = match (&mut *reader).take(remaining).read_buf(&mut buf).await {
            Ok(n) => n,
            Err(e) if buf.is_empty() && is_hangup(&e) => return Err(TunnelError::PeerClosed),
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return if buf.is_empty() {
                Err(TunnelError::PeerClosed)
            } else {
                Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream ended inside the header block",
                )
                .into())
            };
        }
    }
}

/// Errors a peer going away produces on a stream that carried nothing yet.
fn is_hangup(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

/// Reads a body of exactly `len` bytes, starting with `prefix`.
///
/// Bytes of `prefix` beyond `len` are returned as the second element.
pub async fn read_sized_body<R>(prefix: Bytes, reader: &mut R, len: usize) -> Result<(Bytes, Bytes)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if prefix.len() >= len {
        let mut prefix = prefix;
        let rest = prefix.split_off(len);
        return Ok((prefix, rest));
    }

    let mut body = BytesMut::with_capacity(len);
    body.extend_from_slice(&prefix);
    body.resize(len, 0);
    reader.read_exact(&mut body[prefix.len()..]).await?;
    Ok((body.freeze(), Bytes::new()))
}

/// Splits `Name: value` into a trimmed name and value.
pub fn split_header(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    Some((key.trim(), value.trim()))
}

fn framing_of(header_lines: &[String]) -> BodyFraming {
    let mut content_length = None;
    let mut chunked = false;

    for line in header_lines {
        let Some((key, value)) = split_header(line) else {
            continue;
        };
        if key.eq_ignore_ascii_case("content-length") {
            match value.parse::<u64>() {
                Ok(len) => content_length = Some(len),
                Err(e) => tracing::debug!(value, error = %e, "ignoring unparsable Content-Length"),
            }
        } else if key.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            chunked = true;
        }
    }

    if chunked {
        BodyFraming::Chunked
    } else if let Some(len) = content_length {
        BodyFraming::ContentLength(len)
    } else {
        BodyFraming::CloseDelimited
    }
}

/// Value of the first `Content-Length` header that does not parse, if any.
///
/// Such a header is treated as absent when framing; callers report it.
pub fn bad_content_length(header_lines: &[String]) -> Option<&str> {
    header_lines.iter().find_map(|line| {
        let (key, value) = split_header(line)?;
        (key.eq_ignore_ascii_case("content-length") && value.parse::<u64>().is_err()).then_some(value)
    })
}

/// Decodes raw octets as ISO-8859-1; every byte maps to exactly one char.
pub fn latin1_decode(raw: &[u8]) -> String {
    raw.iter().map(|&b| b as char).collect()
}

/// Inverse of [`latin1_decode`]. Chars above U+00FF are replaced with `?`.
pub fn latin1_encode(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn head_of(raw: &str) -> MessageHead {
        MessageHead::parse(raw.as_bytes())
    }

    #[test]
    fn matcher_walks_all_states() {
        let mut state = TerminatorState::None;
        let mut seen = Vec::new();
        for &b in b"\r\n\r\n" {
            state = state.advance(b);
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                TerminatorState::Cr,
                TerminatorState::CrLf,
                TerminatorState::CrLfCr,
                TerminatorState::Found
            ]
        );
    }

    #[test]
    fn matcher_restarts_on_carriage_return() {
        assert_eq!(TerminatorState::Cr.advance(b'\r'), TerminatorState::Cr);
        assert_eq!(TerminatorState::CrLfCr.advance(b'\r'), TerminatorState::Cr);
        assert_eq!(TerminatorState::CrLf.advance(b'x'), TerminatorState::None);
        assert_eq!(TerminatorState::CrLfCr.advance(b'a'), TerminatorState::None);
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let head = head_of("HTTP/1.1 200 OK\r\nContent-Length: 10\r\nTransfer-Encoding: gzip, Chunked\r\n");
        assert_eq!(head.framing, BodyFraming::Chunked);
    }

    #[test]
    fn content_length_is_case_insensitive() {
        let head = head_of("HTTP/1.1 200 OK\r\ncOnTeNt-LeNgTh:  42 \r\n");
        assert_eq!(head.framing, BodyFraming::ContentLength(42));
    }

    #[test]
    fn bad_content_length_is_treated_as_absent() {
        let head = head_of("HTTP/1.1 200 OK\r\nContent-Length: -3\r\n");
        assert_eq!(head.framing, BodyFraming::CloseDelimited);
    }

    #[test]
    fn unparsable_content_length_is_reported() {
        let head = head_of("HTTP/1.1 200 OK\r\nServer: x\r\nContent-Length: 12abc\r\n");
        assert_eq!(bad_content_length(&head.header_lines), Some("12abc"));
        let head = head_of("HTTP/1.1 200 OK\r\nContent-Length: 12\r\n");
        assert_eq!(bad_content_length(&head.header_lines), None);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let head = head_of("HTTP/1.1 204 No Content\r\n\r\nServer: x\r\n\r\n");
        assert_eq!(head.start_line, "HTTP/1.1 204 No Content");
        assert_eq!(head.header_lines, vec!["Server: x".to_string()]);
        assert_eq!(head.header("server"), Some("x"));
    }

    #[test]
    fn latin1_round_trips_high_bytes() {
        let raw = [b'X', b':', b' ', 0xE9, 0xFF];
        let text = latin1_decode(&raw);
        assert_eq!(text.chars().count(), 5);
        assert_eq!(latin1_encode(&text), raw.to_vec());
    }

    #[tokio::test]
    async fn read_head_returns_bytes_past_terminator() {
        let mut src = Cursor::new(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec());
        let (head, prefix) = read_head(&mut src, MAX_HEAD_LEN).await.unwrap();
        assert_eq!(head.start_line, "HTTP/1.1 200 OK");
        assert_eq!(head.framing, BodyFraming::ContentLength(5));
        assert_eq!(&prefix[..], b"hello");
    }

    #[tokio::test]
    async fn read_head_never_loses_or_duplicates_bytes() {
        let message = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nbody-bytes-follow";
        // Deliver the message in small pieces so the terminator straddles reads.
        let (mut tx, mut rx) = tokio::io::duplex(3);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            tx.write_all(message).await.unwrap();
        });

        // The pipe holds three bytes, so the reader has to drain while the writer runs.
        let (head, prefix) = read_head(&mut rx, MAX_HEAD_LEN).await.unwrap();
        let mut rest = Vec::new();
        rx.read_to_end(&mut rest).await.unwrap();
        writer.await.unwrap();

        let mut reassembled = head.to_bytes();
        reassembled.extend_from_slice(&prefix);
        reassembled.extend_from_slice(&rest);
        assert_eq!(reassembled, message.to_vec());
    }

    #[tokio::test]
    async fn read_head_on_empty_stream_is_peer_closed() {
        let mut src = Cursor::new(Vec::new());
        let err = read_head(&mut src, MAX_HEAD_LEN).await.unwrap_err();
        assert!(matches!(err, TunnelError::PeerClosed));
    }

    #[tokio::test]
    async fn read_head_on_truncated_stream_is_io_error() {
        let mut src = Cursor::new(b"HTTP/1.1 200 OK\r\nServer".to_vec());
        let err = read_head(&mut src, MAX_HEAD_LEN).await.unwrap_err();
        assert!(matches!(err, TunnelError::Io(_)));
    }

    #[tokio::test]
    async fn read_head_enforces_limit() {
        let mut src = Cursor::new(vec![b'a'; 200]);
        let err = read_head(&mut src, 64).await.unwrap_err();
        assert!(matches!(err, TunnelError::HeadTooLarge(64)));
    }

    #[tokio::test]
    async fn sized_body_uses_prefix_first() {
        let mut src = Cursor::new(b"world".to_vec());
        let (body, rest) = read_sized_body(Bytes::from_static(b"hello "), &mut src, 11).await.unwrap();
        assert_eq!(&body[..], b"hello world");
        assert!(rest.is_empty());

        let mut empty = Cursor::new(Vec::new());
        let (body, rest) = read_sized_body(Bytes::from_static(b"abcdef"), &mut empty, 4).await.unwrap();
        assert_eq!(&body[..], b"abcd");
        assert_eq!(&rest[..], b"ef");
    }
}
