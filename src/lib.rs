//! HTTP tunnel over a single persistent TLS connection.
//!
//! The client side runs a plaintext proxy for local callers and forwards each
//! request through one encrypted tunnel to the relay. The relay performs the
//! real fetch and streams the raw response back.

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod framing;
pub mod local_proxy;
pub mod net;
pub mod relay_listener;
pub mod request;
pub mod response_relay;
pub mod session;
pub mod status;
pub mod target_fetcher;

#[cfg(test)]
mod test_channel;

pub use channel::{SecureChannel, TlsChannel};
pub use config::{ClientSettings, RelaySettings, Role, TunnelConfig};
pub use engine::{start, start_client, start_relay, ClientHandle, EngineHandle, RelayHandle};
pub use error::{Result, TunnelError};
pub use session::{SessionState, TunnelSession};
pub use status::{SharedSink, StatusSink, TracingSink};
