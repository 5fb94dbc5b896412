use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunnelError};
use crate::framing::MAX_HEAD_LEN;

/// Which end of the tunnel a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Local proxy that originates the tunnel.
    Originator,
    /// Relay that terminates the tunnel and fetches targets.
    Terminator,
}

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub client: ClientSettings,
    pub relay: RelaySettings,
}

impl TunnelConfig {
    /// Loads a TOML file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text).map_err(|e| TunnelError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| TunnelError::Config(e.to_string()))
    }
}

/// Tunnel originator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub relay_host: String,
    pub relay_port: u16,
    /// Name checked against the relay certificate, `relay_host` when unset.
    pub server_name: Option<String>,
    /// PEM bundle of trusted relay identities; the platform store when unset.
    pub ca_file: Option<PathBuf>,
    pub tls13_only: bool,
    pub bind_address: String,
    pub bind_port: u16,
    pub max_head_len: usize,
    pub max_request_body: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            relay_host: "localhost".to_string(),
            relay_port: 443,
            server_name: None,
            ca_file: None,
            tls13_only: false,
            bind_address: "127.0.0.1".to_string(),
            bind_port: 3128,
            max_head_len: MAX_HEAD_LEN,
            max_request_body: 1024 * 1024,
        }
    }
}

impl ClientSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }
}

/// Tunnel terminator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub bind_address: String,
    pub bind_port: u16,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub tls13_only: bool,
    /// Port every outbound fetch connects to.
    pub target_port: u16,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_head_len: usize,
    pub max_request_body: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 443,
            cert_file: PathBuf::from("relay-cert.pem"),
            key_file: PathBuf::from("relay-key.pem"),
            tls13_only: false,
            target_port: 80,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            max_head_len: MAX_HEAD_LEN,
            max_request_body: 1024 * 1024,
        }
    }
}

impl RelaySettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}
