//! Process entry point: configuration, logging, and the relay server.

use anyhow::bail;
use clap::Parser;
use sona_realtime::{DEFAULT_MODEL, DEFAULT_UPSTREAM_URL};
use sona_relay::{Relay, RelayConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "sona", about = "Realtime conversation relay", version)]
struct Args {
    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 4000)]
    port: u16,

    /// Host to bind.
    #[arg(long, env = "SONA_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Upstream API credential.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Upstream endpoint override.
    #[arg(long, env = "SONA_UPSTREAM_URL", default_value = DEFAULT_UPSTREAM_URL)]
    upstream_url: String,

    /// Model used when a connection request does not name one.
    #[arg(long, env = "SONA_DEFAULT_MODEL", default_value = DEFAULT_MODEL)]
    default_model: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sona_core::logging::init();
    let args = Args::parse();

    let Some(api_key) = args.api_key else {
        bail!("environment variable OPENAI_API_KEY is required");
    };

    let config = RelayConfig {
        api_key,
        host: args.host,
        port: args.port,
        upstream_url: args.upstream_url,
        default_model: args.default_model,
    };
    info!(host = %config.host, port = config.port, "starting relay");
    Relay::new(config).listen().await?;
    Ok(())
}
