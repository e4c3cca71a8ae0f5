//! Error types for FileVault

use crate::protocol::ErrorCode;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for FileVault operations
pub type Result<T> = std::result::Result<T, FileVaultError>;

/// Top-level error type for FileVault
#[derive(Error, Debug)]
pub enum FileVaultError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to read configuration file: {0}")]
    ConfigFile(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Server rejected request: {code} {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("Client error: {0}")]
    Client(String),
}

/// Socket-level failures, both at startup and within a single connection.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to create socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to set {option}: {source}")]
    SetOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen: {0}")]
    Listen(#[source] io::Error),

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to read from peer: {0}")]
    Read(#[source] io::Error),

    #[error("failed to write to peer: {0}")]
    Write(#[source] io::Error),
}

/// The request could not be split into a verb and a key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed command: {0}")]
    Malformed(&'static str),
}

/// The request split cleanly but does not describe a runnable command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    // Debug formatting escapes CR/LF so a client token cannot break the reply line
    #[error("unknown verb {0:?}")]
    UnknownVerb(String),

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[error("INSERT requires a payload")]
    MissingPayload,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no record for key '{0}'")]
    NotFound(String),

    #[error("storage failure for key '{key}': {source}")]
    IoFailure {
        key: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("no complete request within {0:?}")]
    Timeout(Duration),

    #[error("request exceeds {0} bytes")]
    RequestTooLarge(usize),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ParseError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::Malformed
    }
}

impl ValidationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ValidationError::UnknownVerb(_) => ErrorCode::UnknownVerb,
            ValidationError::InvalidKey(_) => ErrorCode::InvalidKey,
            ValidationError::MissingPayload => ErrorCode::MissingPayload,
        }
    }
}

impl ConnectionError {
    /// Wire code for errors the client is told about. Transport failures
    /// have none: the peer is unreachable anyway.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ConnectionError::Timeout(_) => Some(ErrorCode::Timeout),
            ConnectionError::RequestTooLarge(_) => Some(ErrorCode::TooLarge),
            ConnectionError::Transport(_) => None,
        }
    }
}
