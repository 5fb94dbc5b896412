//! Error types shared by both ends of the tunnel.

use std::io;
use thiserror::Error;

/// Result type alias using the tunnel's Error type.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors that can occur while accepting, tunnelling or relaying a request.
#[derive(Error, Debug)]
pub enum TunnelError {
    // Secure channel errors
    #[error("TLS handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("connection to {addr} failed: {source}")]
    ConnectFailure {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid TLS configuration: {0}")]
    TlsConfig(String),

    #[error("peer closed the connection before sending anything")]
    PeerClosed,

    // Request errors
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("request has no Host header")]
    MissingHost,

    #[error("header block exceeds {0} bytes")]
    HeadTooLarge(usize),

    // Relay errors
    #[error("invalid chunk size line: {0:?}")]
    ChunkParseError(String),

    #[error("target {addr} unreachable: {source}")]
    TargetUnreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("no usable response from relay: {0}")]
    BadRelayResponse(#[source] Box<TunnelError>),

    #[error("response aborted after it started: {0}")]
    ResponseAborted(#[source] Box<TunnelError>),

    #[error("local caller went away: {0}")]
    CallerWrite(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Status code and reason phrase used when this error is answered with
    /// a synthesized HTTP response.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            TunnelError::MalformedRequest(_)
            | TunnelError::MissingHost
            | TunnelError::HeadTooLarge(_) => (400, "Bad Request"),
            TunnelError::UnsupportedMethod(_) => (405, "Method Not Allowed"),
            _ => (502, "Bad Gateway"),
        }
    }

    /// True when the failure happened before the secure channel was usable.
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            TunnelError::HandshakeFailure(_) | TunnelError::ConnectFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_errors_map_to_client_statuses() {
        assert_eq!(TunnelError::MalformedRequest("".into()).status().0, 400);
        assert_eq!(TunnelError::MissingHost.status().0, 400);
        assert_eq!(TunnelError::HeadTooLarge(10).status().0, 400);
        assert_eq!(TunnelError::UnsupportedMethod("PUT".into()).status(), (405, "Method Not Allowed"));
    }

    #[test]
    fn transport_errors_map_to_bad_gateway() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = TunnelError::TargetUnreachable { addr: "example.com:80".into(), source: refused };
        assert_eq!(err.status(), (502, "Bad Gateway"));
        assert_eq!(TunnelError::PeerClosed.status().0, 502);
        assert_eq!(TunnelError::ChunkParseError("zz".into()).status().0, 502);
        // An oversized head from the relay is not the local caller's fault.
        let relay_side = TunnelError::BadRelayResponse(Box::new(TunnelError::HeadTooLarge(10)));
        assert_eq!(relay_side.status(), (502, "Bad Gateway"));
    }

    #[test]
    fn channel_failures_are_distinguished() {
        assert!(TunnelError::HandshakeFailure("bad cert".into()).is_channel_failure());
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(TunnelError::ConnectFailure { addr: "relay:443".into(), source: refused }.is_channel_failure());
        assert!(!TunnelError::PeerClosed.is_channel_failure());
    }
}
