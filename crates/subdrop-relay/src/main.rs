use anyhow::Result;
use clap::Parser;
use std::net::IpAddr;
use subdrop_relay::{GuardConfig, RelayConfig, RelayServer};
use tracing_subscriber::EnvFilter;

/// LAN file-drop signaling relay.
#[derive(Debug, Parser)]
#[command(name = "subdrop-relay", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on.
    #[arg(long, env = "SUBDROP_PORT", default_value_t = subdrop_proto::DEFAULT_PORT)]
    port: u16,

    /// Signaling events allowed per connection per minute.
    #[arg(long, default_value_t = 100)]
    max_events: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = RelayConfig {
        bind_addr: (args.host, args.port).into(),
        guard: GuardConfig {
            max_events: args.max_events,
            ..GuardConfig::default()
        },
    };

    let server = RelayServer::bind(config).await?;
    server.run().await?;
    Ok(())
}
