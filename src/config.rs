//! Server configuration
//!
//! Values come from defaults, optionally overlaid by a JSON file; the server
//! binary applies command-line overrides on top.

use crate::error::{FileVaultError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port the service has always listened on
pub const DEFAULT_PORT: u16 = 3490;

/// FileVault server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_addr: String,
    /// Directory holding the `<key>.txt` record files
    pub data_dir: PathBuf,
    /// Live connection handlers allowed before the acceptor pauses
    pub max_connections: usize,
    /// Pending-connection queue length passed to listen(2)
    pub backlog: u32,
    /// How long a client may take to deliver its request
    pub read_timeout_ms: u64,
    /// Upper bound on a request line, terminator included
    pub max_request_bytes: usize,
    /// Pause after which received bytes count as a whole request even
    /// without a trailing newline
    pub message_idle_ms: u64,
    /// How long shutdown waits for live handlers before aborting them
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            data_dir: PathBuf::from("."),
            max_connections: 1000,
            backlog: 10,
            read_timeout_ms: 5_000,
            max_request_bytes: 300,
            message_idle_ms: 100,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl ServerConfig {
    /// Load a configuration from a JSON file. Missing fields keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(FileVaultError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.read_timeout_ms == 0 {
            return Err(FileVaultError::Config(
                "read_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.message_idle_ms == 0 {
            return Err(FileVaultError::Config(
                "message_idle_ms must be at least 1".to_string(),
            ));
        }
        if self.max_request_bytes == 0 {
            return Err(FileVaultError::Config(
                "max_request_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn message_idle(&self) -> Duration {
        Duration::from_millis(self.message_idle_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
