//! FileVault Server Binary
//!
//! Main entry point for the FileVault TCP server

use clap::Parser;
use filevault::{FileVaultServer, Result, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "filevault-server")]
#[command(about = "FileVault - stores one record file per account number")]
struct Args {
    /// JSON configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    bind: Option<String>,

    /// Directory holding the record files
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Per-connection read timeout in milliseconds
    #[arg(long)]
    read_timeout_ms: Option<u64>,

    /// Maximum number of connections handled at once
    #[arg(long)]
    max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(read_timeout_ms) = self.read_timeout_ms {
            config.read_timeout_ms = read_timeout_ms;
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = max_connections;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.into_config()?;
    tracing::debug!(?config, "Configuration loaded");

    // Socket or data directory problems abort here with the failing step
    let server = match FileVaultServer::bind(config).await {
        Ok(server) => Arc::new(server),
        Err(e) => {
            tracing::error!(error = %e, "Server failed to start");
            return Err(e);
        }
    };

    // Setup graceful shutdown on SIGINT (Ctrl+C)
    let server_clone = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }

        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        if let Err(e) = server_clone.shutdown() {
            tracing::error!(error = %e, "Failed to initiate shutdown");
        }
    });

    server.run().await
}
