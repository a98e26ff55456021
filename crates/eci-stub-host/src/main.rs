//! Development engine host.
//!
//! Launched by the client with `--address`, `--authkey` and `--log-dir`. It
//! connects back, proves it holds the key, then serves the engine protocol
//! with a synthetic tone generator in place of a real engine.

mod engine;
mod server;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use eci_client::auth::AuthKey;
use tokio::net::TcpStream;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::{ServeOptions, serve};

#[derive(Parser, Debug)]
#[command(name = "eci-stub-host")]
#[command(about = "Protocol-compatible engine host producing synthetic audio")]
struct Args {
    /// Client listener to connect back to
    #[arg(long)]
    address: SocketAddr,

    /// Hex-encoded launch credential
    #[arg(long)]
    authkey: String,

    /// Directory for the host log file
    #[arg(long = "log-dir")]
    log_dir: Option<PathBuf>,

    /// Milliseconds of audio per event
    #[arg(long, default_value_t = 50)]
    chunk_ms: u32,

    /// Send audio as fast as possible instead of in real time
    #[arg(long)]
    unpaced: bool,
}

fn init_tracing(log_dir: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // stderr is forwarded into the client's log.
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .compact();

    let file = log_dir.and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        let appender = tracing_appender::rolling::never(dir, "eci-stub-host.log");
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .compact(),
        )
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr)
        .with(file)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_dir.as_deref());

    let key = AuthKey::from_hex(&args.authkey).context("invalid --authkey")?;
    info!(address = %args.address, pid = std::process::id(), "Stub host starting");

    let stream = TcpStream::connect(args.address)
        .await
        .with_context(|| format!("failed to connect to {}", args.address))?;
    stream.set_nodelay(true)?;

    let options = ServeOptions {
        chunk_ms: args.chunk_ms,
        paced: !args.unpaced,
    };
    if let Err(e) = serve(stream, &key, options).await {
        error!(error = %e, "Session ended with an error");
        return Err(e);
    }
    info!("Stub host exiting");
    Ok(())
}
