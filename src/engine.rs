//! Wires the tunnel components together for either end of the tunnel.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{self, SecureChannel, TlsChannel};
use crate::config::{ClientSettings, RelaySettings, Role, TunnelConfig};
use crate::error::Result;
use crate::local_proxy::LocalProxy;
use crate::relay_listener::{ConnectedUsers, RelayListener};
use crate::session::TunnelSession;
use crate::status::SharedSink;

/// Running client: local proxy plus its tunnel session.
pub struct ClientHandle {
    local_addr: SocketAddr,
    session: Arc<TunnelSession>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session(&self) -> Arc<TunnelSession> {
        self.session.clone()
    }

    /// Stops accepting local callers, then closes the tunnel.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "local proxy task ended abnormally");
        }
        self.session.close().await;
    }
}

/// Running relay.
pub struct RelayHandle {
    local_addr: SocketAddr,
    users: Arc<ConnectedUsers>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connected_users(&self) -> Arc<ConnectedUsers> {
        self.users.clone()
    }

    /// Stops the accept loop. Handlers already running finish on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "relay task ended abnormally");
        }
    }
}

pub enum EngineHandle {
    Client(ClientHandle),
    Relay(RelayHandle),
}

impl EngineHandle {
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            EngineHandle::Client(handle) => handle.local_addr(),
            EngineHandle::Relay(handle) => handle.local_addr(),
        }
    }

    pub async fn shutdown(self) {
        match self {
            EngineHandle::Client(handle) => handle.shutdown().await,
            EngineHandle::Relay(handle) => handle.shutdown().await,
        }
    }
}

/// Starts the local proxy. An unreachable relay is not fatal here: the
/// session retries on the first request.
pub async fn start_client(settings: &ClientSettings, channel: Arc<dyn SecureChannel>, sink: SharedSink) -> Result<ClientHandle> {
    let session = Arc::new(TunnelSession::new(
        channel,
        settings.relay_host.clone(),
        settings.relay_port,
        sink.clone(),
    ));
    if let Err(e) = session.connect().await {
        sink.log(&format!("Relay not reachable yet: {e}"));
    }

    let proxy = LocalProxy::bind(settings, session.clone(), sink).await?;
    let local_addr = proxy.local_addr()?;
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(proxy.serve(rx));

    Ok(ClientHandle {
        local_addr,
        session,
        shutdown,
        task,
    })
}

pub async fn start_relay(settings: &RelaySettings, channel: Arc<dyn SecureChannel>, sink: SharedSink) -> Result<RelayHandle> {
    let relay = RelayListener::bind(settings, channel, sink).await?;
    let local_addr = relay.local_addr()?;
    let users = relay.connected_users();
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(relay.serve(rx));

    Ok(RelayHandle {
        local_addr,
        users,
        shutdown,
        task,
    })
}

/// Builds the rustls channel a role needs from its settings.
pub fn tls_channel(role: Role, config: &TunnelConfig) -> Result<Arc<dyn SecureChannel>> {
    let channel = match role {
        Role::Originator => {
            let client = &config.client;
            let tls = channel::client_config(client.ca_file.as_deref(), client.tls13_only)?;
            TlsChannel::client(tls, client.server_name.clone())
        }
        Role::Terminator => {
            let relay = &config.relay;
            let certs = channel::load_certs(&relay.cert_file)?;
            let key = channel::load_private_key(&relay.key_file)?;
            TlsChannel::server(channel::server_config(certs, key, relay.tls13_only)?)
        }
    };
    Ok(Arc::new(channel))
}

pub async fn start(role: Role, config: &TunnelConfig, channel: Arc<dyn SecureChannel>, sink: SharedSink) -> Result<EngineHandle> {
    match role {
        Role::Originator => Ok(EngineHandle::Client(start_client(&config.client, channel, sink).await?)),
        Role::Terminator => Ok(EngineHandle::Relay(start_relay(&config.relay, channel, sink).await?)),
    }
}
