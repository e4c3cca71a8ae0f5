//! FileVault - a one-command-per-connection record server
//!
//! This library provides a TCP service that stores each record as a plain
//! file named after its account number:
//! - Text protocol: `INSERT <key> <payload>` / `SELECT <key>`
//! - One isolated task per connection, reaped by the acceptor
//! - Per-key serialized writes with atomic replace
//! - Bounded request size and read timeout per connection

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod server;
pub mod store;

pub use client::Client;
pub use config::ServerConfig;
pub use error::{FileVaultError, Result};
pub use protocol::{Command, ErrorCode, Response};
pub use server::{FileVaultServer, ServerStats};
pub use store::{FileStore, Store};
