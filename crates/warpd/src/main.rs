//! warpd: the WarpGrid host daemon.
//!
//! Runs one host's front door against an in-process registry:
//! - Host multiplexer
//! - Public ports for this host
//! - Shared vhost listener
//! - Export registrations seeded from the config file
//!
//! # Usage
//!
//! ```text
//! warpd standalone --config /etc/warpgrid/warpd.toml
//! ```

mod config;
mod standalone;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "warpd", about = "WarpGrid daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the front door for one host with an in-process registry.
    Standalone {
        /// Path to the daemon config file.
        #[arg(long, default_value = "warpd.toml")]
        config: PathBuf,

        /// Override the configured host ID.
        #[arg(long)]
        host_id: Option<String>,

        /// Override the configured bind IP.
        #[arg(long)]
        bind_ip: Option<String>,

        /// Override the configured mux port.
        #[arg(long)]
        mux_port: Option<u16>,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,warpd=debug,warpgrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Standalone {
            config,
            host_id,
            bind_ip,
            mux_port,
        } => {
            let mut config = DaemonConfig::load(&config)?;
            if let Some(host_id) = host_id {
                config.host_id = host_id;
            }
            if let Some(bind_ip) = bind_ip {
                config.bind_ip = bind_ip;
            }
            if let Some(mux_port) = mux_port {
                config.mux_port = mux_port;
            }
            config.validate()?;
            standalone::run(config).await
        }
    }
}
