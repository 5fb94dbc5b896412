use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tls_http_tunnel::{engine, Role, TracingSink, TunnelConfig};

#[derive(Parser)]
#[command(name = "tls-http-tunnel", version, about = "HTTP proxy tunnelled over a single TLS connection")]
struct Cli {
    /// TOML configuration file; flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the local proxy and originate the tunnel.
    Client(ClientArgs),
    /// Terminate tunnels and fetch targets.
    Server(ServerArgs),
}

#[derive(Args)]
struct ClientArgs {
    #[arg(long)]
    relay_host: Option<String>,
    #[arg(long)]
    relay_port: Option<u16>,
    /// Name verified against the relay certificate.
    #[arg(long)]
    server_name: Option<String>,
    /// PEM bundle trusted for the relay instead of the platform store.
    #[arg(long)]
    ca_file: Option<PathBuf>,
    #[arg(long)]
    bind: Option<String>,
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args)]
struct ServerArgs {
    #[arg(long)]
    cert: Option<PathBuf>,
    #[arg(long)]
    key: Option<PathBuf>,
    #[arg(long)]
    bind: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    target_port: Option<u16>,
}

impl Cli {
    fn role_and_config(self) -> anyhow::Result<(Role, TunnelConfig)> {
        let mut config = match &self.config {
            Some(path) => TunnelConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
            None => TunnelConfig::default(),
        };

        let role = match self.command {
            Command::Client(args) => {
                let client = &mut config.client;
                override_with(&mut client.relay_host, args.relay_host);
                override_with(&mut client.relay_port, args.relay_port);
                override_with(&mut client.bind_address, args.bind);
                override_with(&mut client.bind_port, args.port);
                if args.server_name.is_some() {
                    client.server_name = args.server_name;
                }
                if args.ca_file.is_some() {
                    client.ca_file = args.ca_file;
                }
                Role::Originator
            }
            Command::Server(args) => {
                let relay = &mut config.relay;
                override_with(&mut relay.cert_file, args.cert);
                override_with(&mut relay.key_file, args.key);
                override_with(&mut relay.bind_address, args.bind);
                override_with(&mut relay.bind_port, args.port);
                override_with(&mut relay.target_port, args.target_port);
                Role::Terminator
            }
        };

        Ok((role, config))
    }
}

fn override_with<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (role, config) = cli.role_and_config()?;
    let channel = engine::tls_channel(role, &config).context("building TLS configuration")?;
    let handle = engine::start(role, &config, channel, TracingSink::shared())
        .await
        .context("starting tunnel")?;
    tracing::info!(addr = %handle.local_addr(), ?role, "listening");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
