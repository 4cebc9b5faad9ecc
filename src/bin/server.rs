//! Wispgate server
//!
//! Accepts browser proxy clients over WebSocket and multiplexes their
//! logical TCP/UDP streams out to real targets.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use wispgate::{config::Config, gateway::GatewayServer};

/// Wispgate - WebSocket tunnel gateway for browser proxy clients
#[derive(Parser, Debug)]
#[command(name = "wispgate")]
#[command(about = "WebSocket tunnel gateway multiplexing TCP/UDP streams")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Write a default configuration file and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    if args.generate_config {
        let config = Config::default();
        config
            .save(&args.config)
            .context("Failed to write default configuration")?;
        info!("Wrote default configuration to {}", args.config);
        return Ok(());
    }

    // Missing config is not an error; defaults match the stock browser
    // client bundle.
    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        info!("No config file at {}, using defaults", args.config);
        Config::default()
    };

    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    info!("Wispgate v{}", wispgate::VERSION);

    let server = GatewayServer::new(config);

    tokio::select! {
        result = server.run() => {
            result.context("Gateway server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
