use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::channel::{SecureChannel, TunnelStream};
use crate::error::{Result, TunnelError};

/// Test-only channel without encryption
pub struct PlainChannel;

#[async_trait]
impl SecureChannel for PlainChannel {
    async fn connect(&self, host: &str, port: u16) -> Result<TunnelStream> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|source| TunnelError::ConnectFailure {
                addr: format!("{host}:{port}"),
                source,
            })?;
        Ok(Box::new(tcp))
    }

    async fn accept(&self, stream: TcpStream) -> Result<TunnelStream> {
        Ok(Box::new(stream))
    }
}

/// Test-only channel whose handshakes always fail
pub struct FailingChannel;

#[async_trait]
impl SecureChannel for FailingChannel {
    async fn connect(&self, _host: &str, _port: u16) -> Result<TunnelStream> {
        Err(TunnelError::HandshakeFailure("simulated handshake failure".to_string()))
    }

    async fn accept(&self, _stream: TcpStream) -> Result<TunnelStream> {
        Err(TunnelError::HandshakeFailure("simulated handshake failure".to_string()))
    }
}

/// Test-only channel handing out pre-built streams, one per `connect`.
#[derive(Default)]
pub struct ScriptedChannel {
    streams: Mutex<VecDeque<TunnelStream>>,
    connects: AtomicUsize,
}

impl ScriptedChannel {
    pub fn push(&self, stream: TunnelStream) {
        self.streams.lock().unwrap().push_back(stream);
    }

    /// Number of successful connects so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecureChannel for ScriptedChannel {
    async fn connect(&self, host: &str, port: u16) -> Result<TunnelStream> {
        let next = self.streams.lock().unwrap().pop_front();
        match next {
            Some(stream) => {
                self.connects.fetch_add(1, Ordering::SeqCst);
                Ok(stream)
            }
            None => Err(TunnelError::ConnectFailure {
                addr: format!("{host}:{port}"),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "no scripted stream left"),
            }),
        }
    }

    async fn accept(&self, stream: TcpStream) -> Result<TunnelStream> {
        Ok(Box::new(stream))
    }
}
