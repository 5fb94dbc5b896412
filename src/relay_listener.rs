use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::channel::SecureChannel;
use crate::config::RelaySettings;
use crate::error::Result;
use crate::net;
use crate::status::SharedSink;
use crate::target_fetcher::TargetFetcher;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Tunnel peers currently being served, with a connection count per address.
#[derive(Debug, Default)]
pub struct ConnectedUsers {
    inner: Mutex<BTreeMap<IpAddr, usize>>,
}

impl ConnectedUsers {
    /// Returns the number of open connections from `ip` after the add.
    pub fn add(&self, ip: IpAddr) -> usize {
        let mut users = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let count = users.entry(ip).or_insert(0);
        *count += 1;
        *count
    }

    pub fn remove(&self, ip: IpAddr) {
        let mut users = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = users.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                users.remove(&ip);
            }
        }
    }

    pub fn snapshot(&self) -> Vec<IpAddr> {
        let users = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        users.keys().copied().collect()
    }
}

/// Accepts encrypted tunnel connections and runs one handler task per connection.
pub struct RelayListener {
    listener: TcpListener,
    channel: Arc<dyn SecureChannel>,
    fetcher: Arc<TargetFetcher>,
    users: Arc<ConnectedUsers>,
    sink: SharedSink,
}

impl RelayListener {
    pub async fn bind(settings: &RelaySettings, channel: Arc<dyn SecureChannel>, sink: SharedSink) -> Result<Self> {
        let listener = net::bind_reusable(&settings.bind_addr()).await?;
        Ok(Self {
            listener,
            channel,
            fetcher: Arc::new(TargetFetcher::new(settings, sink.clone())),
            users: Arc::new(ConnectedUsers::default()),
            sink,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connected_users(&self) -> Arc<ConnectedUsers> {
        self.users.clone()
    }

    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.local_addr() {
            self.sink.log(&format!("TLS relay started on {addr}"));
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((tcp, peer)) => self.spawn_handler(tcp, peer),
                    Err(e) => {
                        self.sink.log(&format!("Error accepting connection: {e}"));
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        self.sink.log("TLS relay stopped");
    }

    fn spawn_handler(&self, tcp: tokio::net::TcpStream, peer: SocketAddr) {
        let channel = self.channel.clone();
        let fetcher = self.fetcher.clone();
        let users = self.users.clone();
        let sink = self.sink.clone();

        tokio::spawn(async move {
            let ip = peer.ip();
            users.add(ip);
            sink.log(&format!("User connected: {ip}"));
            let _registration = scopeguard::guard((users, sink.clone()), move |(users, sink)| {
                users.remove(ip);
                sink.log(&format!("User disconnected: {ip}"));
            });

            let tunnel = match channel.accept(tcp).await {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    sink.log(&format!("TLS handshake with {peer} failed: {e}"));
                    return;
                }
            };

            if let Err(e) = fetcher.handle(tunnel, peer).await {
                sink.log(&format!("Error handling user {ip}: {e}"));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::RecordingSink;
    use crate::test_channel::{FailingChannel, PlainChannel};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start(channel: Arc<dyn SecureChannel>) -> (SocketAddr, Arc<ConnectedUsers>, watch::Sender<bool>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let settings = RelaySettings {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 0,
            ..RelaySettings::default()
        };
        let relay = RelayListener::bind(&settings, channel, sink.clone()).await.unwrap();
        let addr = relay.local_addr().unwrap();
        let users = relay.connected_users();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(relay.serve(rx));
        (addr, users, tx, sink)
    }

    #[test]
    fn users_are_counted_per_address() {
        let users = ConnectedUsers::default();
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        assert_eq!(users.add(ip), 1);
        assert_eq!(users.add(ip), 2);
        users.remove(ip);
        assert_eq!(users.snapshot(), vec![ip]);
        users.remove(ip);
        assert!(users.snapshot().is_empty());
    }

    #[tokio::test]
    async fn each_connection_gets_its_own_handler() {
        let (addr, users, _tx, sink) = start(Arc::new(PlainChannel)).await;

        // Two tunnels open at once; neither blocks the other.
        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut out = Vec::new();
        second.read_to_end(&mut out).await.unwrap();
        assert!(out.starts_with(b"HTTP/1.1 400 Bad Request"));
        assert_eq!(users.snapshot(), vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);

        first.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        out.clear();
        first.read_to_end(&mut out).await.unwrap();
        assert!(out.starts_with(b"HTTP/1.1 400 Bad Request"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(users.snapshot().is_empty());
        assert!(sink.contains("User connected: 127.0.0.1"));
        assert!(sink.contains("User disconnected: 127.0.0.1"));
    }

    #[tokio::test]
    async fn failed_handshake_does_not_stop_the_listener() {
        let (addr, users, _tx, sink) = start(Arc::new(FailingChannel)).await;

        for _ in 0..2 {
            let mut tcp = TcpStream::connect(addr).await.unwrap();
            let mut out = Vec::new();
            tcp.read_to_end(&mut out).await.unwrap();
            assert!(out.is_empty());
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.contains("TLS handshake with"));
        assert!(users.snapshot().is_empty());
    }
}
