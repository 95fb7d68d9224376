//! CLI entry point for ded-monitor.
//!
//! `ded-monitor serve` runs the backend: it binds the TCP front end,
//! spawns the persistence task, and waits for Ctrl-C. Acquisition itself
//! is started by clients (or `--autostart`).
//!
//! ```bash
//! ded-monitor serve --config config/monitor.toml
//! ded-monitor check --config config/monitor.toml
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use ded_monitor::net::Server;
use ded_monitor::{telemetry, Config, Monitor};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "ded-monitor")]
#[command(about = "Process monitor backend for DED machines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backend server
    Serve {
        /// Path to the TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the listen address
        #[arg(long)]
        bind: Option<String>,

        /// Start acquisition immediately instead of waiting for a client
        #[arg(long)]
        autostart: bool,
    },

    /// Validate a configuration file and print the effective settings
    Check {
        /// Path to the TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    Ok(match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            autostart,
        } => {
            let mut config = load_config(config)?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            telemetry::init_from_config(&config)?;
            serve(config, autostart).await
        }
        Commands::Check { config } => {
            let config = load_config(config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(config: Config, autostart: bool) -> Result<()> {
    info!(name = %config.application.name, "starting");
    let bind = config.server.bind.clone();
    let monitor = Monitor::new(config);

    let server = Server::spawn(monitor.clone(), &bind).await?;
    if autostart {
        monitor.start_acquisition().await?;
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    server.shutdown(Duration::from_secs(2)).await;
    monitor.shutdown().await;
    Ok(())
}
