use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use turnstile::server::{shutdown_signal, Server};
use turnstile::Config;

/// Per-client token-bucket rate limiter in front of `GET /foo`.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "TURNSTILE_CONFIG", default_value = "config/turnstile.toml")]
    config: PathBuf,

    /// Log filter, e.g. `info` or `turnstile=debug`. `RUST_LOG` wins when set.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    tracing::info!(
        clients = config.clients.len(),
        default_capacity = config.default_policy.capacity(),
        default_refill_rate = config.default_policy.refill_rate(),
        "configuration loaded"
    );

    let server = Server::bind(&config).await?;
    server.run(shutdown_signal()).await?;
    Ok(())
}
