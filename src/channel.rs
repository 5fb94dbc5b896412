use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Result, TunnelError};

/// Bidirectional byte stream carried by the tunnel.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type TunnelStream = Box<dyn AsyncStream>;

/// Factory for authenticated, encrypted tunnel streams.
///
/// `connect` is used by the client role, `accept` by the relay role on a TCP
/// socket the relay listener has already accepted. TCP-level failures surface
/// as `ConnectFailure`, negotiation failures as `HandshakeFailure`.
#[async_trait]
pub trait SecureChannel: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<TunnelStream>;
    async fn accept(&self, stream: TcpStream) -> Result<TunnelStream>;
}

/// rustls-backed secure channel
pub struct TlsChannel {
    connector: Option<TlsConnector>,
    acceptor: Option<TlsAcceptor>,
    server_name: Option<String>,
}

impl TlsChannel {
    /// Client role. `server_name` overrides the name verified against the
    /// relay certificate; the connect host is used when absent.
    pub fn client(config: Arc<ClientConfig>, server_name: Option<String>) -> Self {
        Self {
            connector: Some(TlsConnector::from(config)),
            acceptor: None,
            server_name,
        }
    }

    /// Relay role.
    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self {
            connector: None,
            acceptor: Some(TlsAcceptor::from(config)),
            server_name: None,
        }
    }
}

#[async_trait]
impl SecureChannel for TlsChannel {
    async fn connect(&self, host: &str, port: u16) -> Result<TunnelStream> {
        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| TunnelError::TlsConfig("channel has no client configuration".to_string()))?;

        let connect_failure = |source: std::io::Error| TunnelError::ConnectFailure {
            addr: format!("{host}:{port}"),
            source,
        };
        let tcp = TcpStream::connect((host, port)).await.map_err(connect_failure)?;
        tcp.set_nodelay(true).map_err(connect_failure)?;

        let name = self.server_name.as_deref().unwrap_or(host);
        let name = ServerName::try_from(name)
            .map_err(|_| TunnelError::HandshakeFailure(format!("invalid server name {name:?}")))?;

        let tls = connector
            .connect(name, tcp)
            .await
            .map_err(|e| TunnelError::HandshakeFailure(e.to_string()))?;
        Ok(Box::new(tls))
    }

    async fn accept(&self, stream: TcpStream) -> Result<TunnelStream> {
        let acceptor = self
            .acceptor
            .as_ref()
            .ok_or_else(|| TunnelError::TlsConfig("channel has no server configuration".to_string()))?;

        let tls = acceptor
            .accept(stream)
            .await
            .map_err(|e| TunnelError::HandshakeFailure(e.to_string()))?;
        Ok(Box::new(tls))
    }
}

static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn protocol_versions(tls13_only: bool) -> &'static [&'static rustls::SupportedProtocolVersion] {
    if tls13_only {
        TLS13_ONLY
    } else {
        rustls::ALL_VERSIONS
    }
}

/// Client configuration trusting either `ca_file` or the platform store.
pub fn client_config(ca_file: Option<&Path>, tls13_only: bool) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(&cert)
                    .map_err(|e| TunnelError::TlsConfig(format!("{}: {e}", path.display())))?;
            }
        }
        None => {
            for cert in rustls_native_certs::load_native_certs()? {
                // Unparsable platform certificates are skipped, not fatal.
                if let Err(e) = roots.add(&Certificate(cert.0)) {
                    tracing::debug!(error = %e, "skipping native certificate");
                }
            }
        }
    }

    client_config_with_roots(roots, tls13_only)
}

pub fn client_config_with_roots(roots: RootCertStore, tls13_only: bool) -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(protocol_versions(tls13_only))
        .map_err(|e| TunnelError::TlsConfig(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Relay configuration presenting `certs` with `key`.
pub fn server_config(certs: Vec<Certificate>, key: PrivateKey, tls13_only: bool) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(protocol_versions(tls13_only))
        .map_err(|e| TunnelError::TlsConfig(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::TlsConfig(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Reads every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        return Err(TunnelError::TlsConfig(format!("no certificates in {}", path.display())));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

/// Reads the first PKCS#8, RSA or SEC1 private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::read_all(&mut reader)?
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| TunnelError::TlsConfig(format!("no private key in {}", path.display())))
}
