//! agentmux-agent: agent side of the connection multiplexer.
//!
//! Speaks the protocol on stdin/stdout, negotiates the forwarding mode
//! requested by the gateway, and bridges logical connections to local TCP and
//! Unix sockets. Logs go to stderr.

mod config;
mod serve;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use config::AgentConfig;
use tracing::{error, info};

/// agentmux-agent: forwarding agent
#[derive(Parser, Debug)]
#[command(name = "agentmux-agent", version, about = "Connection forwarding agent")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.agentmux/agent.toml")]
    config: String,

    /// X11 display number to listen on (port 6000 + display)
    #[arg(long)]
    x11_display: Option<u32>,

    /// Grace period for open connections on shutdown, in milliseconds
    #[arg(long)]
    terminate_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // stdout carries the protocol, so logs go to stderr.
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting agentmux-agent");

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "agent failed");
        std::process::exit(1);
    }

    info!("agentmux-agent stopped");
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = PathBuf::from(&cli.config);
    let config = AgentConfig::load(
        Some(&config_path),
        cli.x11_display,
        cli.terminate_timeout_ms,
    )?;
    serve::run(tokio::io::stdin(), tokio::io::stdout(), &config).await
}
