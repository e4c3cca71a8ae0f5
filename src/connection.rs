//! Connection handler
//!
//! Each accepted client gets exactly one request and one response:
//!
//! ```text
//! Accepted -> Reading -> Parsing -> Validating -> Executing -> Responding -> Closed
//!                |           |           |                        ^
//!                |           +-----------+--- error response -----+
//!                +--- timeout / too large -------------------------+
//! ```
//!
//! The socket is owned by the handler and dropped when it finishes, on every
//! path.

use crate::config::ServerConfig;
use crate::error::{ConnectionError, StoreError, TransportError};
use crate::protocol::{parse_command, validate_command, Command, Response};
use crate::store::Store;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 512;

/// Lifecycle stages of a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Reading,
    Parsing,
    Validating,
    Executing,
    Responding,
    Closed,
}

/// Per-connection bounds
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub read_timeout: Duration,
    pub max_request_bytes: usize,
    pub message_idle: Duration,
}

impl From<&ServerConfig> for ConnectionLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            read_timeout: config.read_timeout(),
            max_request_bytes: config.max_request_bytes,
            message_idle: config.message_idle(),
        }
    }
}

/// Serves one request on one client socket.
pub struct ConnectionHandler<S> {
    stream: TcpStream,
    peer: SocketAddr,
    store: Arc<S>,
    limits: ConnectionLimits,
    state: ConnectionState,
}

impl<S: Store> ConnectionHandler<S> {
    pub fn new(stream: TcpStream, peer: SocketAddr, store: Arc<S>, limits: ConnectionLimits) -> Self {
        Self {
            stream,
            peer,
            store,
            limits,
            state: ConnectionState::Accepted,
        }
    }

    /// Read the request, run it and send back one response.
    ///
    /// Returns the response that was sent. Errors only when the socket
    /// itself failed, in which case the client may not have been told
    /// anything.
    pub async fn run(mut self) -> Result<Response, ConnectionError> {
        let response = match self.receive().await {
            Ok(request) => self.process(&request).await,
            Err(err) => match err.code() {
                Some(code) => {
                    debug!(peer = %self.peer, error = %err, "Request not received");
                    Response::error(code, err)
                }
                None => {
                    self.transition(ConnectionState::Closed);
                    return Err(err);
                }
            },
        };

        let sent = self.respond(&response).await;
        self.transition(ConnectionState::Closed);
        sent.map(|()| response)
    }

    async fn receive(&mut self) -> Result<Vec<u8>, ConnectionError> {
        self.transition(ConnectionState::Reading);
        let read_timeout = self.limits.read_timeout;
        match timeout(read_timeout, self.read_request()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(read_timeout)),
        }
    }

    /// Read up to the first newline, until the peer half-closes, or until
    /// the peer goes quiet for `message_idle` after sending something.
    async fn read_request(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let max = self.limits.max_request_bytes;
        let idle = self.limits.message_idle;
        let mut buf = Vec::with_capacity(max.min(READ_CHUNK));
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let read = self.stream.read(&mut chunk);
            let n = if buf.is_empty() {
                read.await.map_err(TransportError::Read)?
            } else {
                match timeout(idle, read).await {
                    Ok(result) => result.map_err(TransportError::Read)?,
                    Err(_) => break,
                }
            };
            if n == 0 {
                break;
            }

            let scanned = buf.len();
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf[scanned..].iter().position(|&b| b == b'\n') {
                buf.truncate(scanned + pos + 1);
                break;
            }
            if buf.len() > max {
                return Err(ConnectionError::RequestTooLarge(max));
            }
        }

        if buf.len() > max {
            return Err(ConnectionError::RequestTooLarge(max));
        }
        trace!(peer = %self.peer, bytes = buf.len(), "Request received");
        Ok(buf)
    }

    async fn process(&mut self, request: &[u8]) -> Response {
        self.transition(ConnectionState::Parsing);
        let raw = match parse_command(request) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(peer = %self.peer, error = %err, "Rejected request");
                return err.into();
            }
        };

        self.transition(ConnectionState::Validating);
        let command = match validate_command(raw) {
            Ok(command) => command,
            Err(err) => {
                debug!(peer = %self.peer, error = %err, "Rejected command");
                return err.into();
            }
        };

        self.transition(ConnectionState::Executing);
        self.execute(command).await
    }

    async fn execute(&self, command: Command) -> Response {
        let verb = command.verb().as_str();
        let result = match &command {
            Command::Insert { key, content } => {
                self.store.insert(key, content).await.map(|()| Response::Ok)
            }
            Command::Select { key } => self.store.select(key).await.map(Response::Value),
        };

        match result {
            Ok(response) => {
                debug!(peer = %self.peer, verb, key = command.key(), "Command executed");
                response
            }
            Err(err) => {
                if let StoreError::IoFailure { .. } = &err {
                    warn!(peer = %self.peer, verb, error = %err, "Store failure");
                }
                err.into()
            }
        }
    }

    async fn respond(&mut self, response: &Response) -> Result<(), ConnectionError> {
        self.transition(ConnectionState::Responding);
        self.stream
            .write_all(&response.to_bytes())
            .await
            .map_err(TransportError::Write)?;
        self.stream.shutdown().await.map_err(TransportError::Write)?;
        Ok(())
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }
}
