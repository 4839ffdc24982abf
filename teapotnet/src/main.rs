//! Teapotnet node daemon
//!
//! Exit codes: 0 on graceful shutdown, 1 on configuration errors,
//! 2 on irrecoverable runtime errors.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use teapotnet::{Config, Node};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "teapotnet", version, about = "Friend-to-friend overlay network node")]
struct Args {
    /// Overlay listen port (stream and datagram)
    #[arg(long)]
    port: Option<u16>,

    /// Path to the JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Skip connecting to the configured bootstrap nodes
    #[arg(long)]
    no_bootstrap: bool,
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut config = match Config::load_or_default(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e:#}");
            return Ok(ExitCode::from(1));
        }
    };
    if let Some(port) = args.port {
        config.port = port;
    }

    let node = match Node::start(&config, args.no_bootstrap).await {
        Ok(node) => node,
        Err(e) => {
            error!("startup failed: {e:#}");
            return Ok(ExitCode::from(2));
        }
    };

    match node.run().await {
        Ok(()) => {
            info!("goodbye");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("runtime error: {e:#}");
            Ok(ExitCode::from(2))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();
    info!("teapotnet v{}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::from(2)
        }
    }
}
