//! Client library for talking to a FileVault server
//!
//! The server answers one command per connection, so every call opens a
//! fresh connection, sends its line, half-closes and reads until the server
//! hangs up.

use crate::error::{FileVaultError, Result};
use crate::protocol::{Response, Verb};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Client for a FileVault server
#[derive(Debug, Clone)]
pub struct Client {
    addr: String,
}

impl Client {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one raw request and decode the reply
    pub async fn send_raw(&self, request: &[u8]) -> Result<Response> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        stream.write_all(request).await?;
        stream.shutdown().await?;

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        Response::parse(&reply)
    }

    /// Store `payload` under `key`, replacing any earlier record
    pub async fn insert(&self, key: &str, payload: &[u8]) -> Result<()> {
        if payload.contains(&b'\n') {
            return Err(FileVaultError::Client(
                "payload cannot contain a newline".to_string(),
            ));
        }

        let mut request = format!("{} {} ", Verb::Insert.as_str(), key).into_bytes();
        request.extend_from_slice(payload);
        request.push(b'\n');

        match self.send_raw(&request).await? {
            Response::Ok => Ok(()),
            Response::Error { code, message } => Err(FileVaultError::Rejected { code, message }),
            other => Err(FileVaultError::Protocol(format!(
                "Unexpected response for INSERT: {:?}",
                other
            ))),
        }
    }

    /// Fetch the record for `key`, `None` if it was never inserted
    pub async fn select(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let request = format!("{} {}\n", Verb::Select.as_str(), key);

        match self.send_raw(request.as_bytes()).await? {
            Response::Value(content) => Ok(Some(content)),
            Response::NotFound => Ok(None),
            Response::Error { code, message } => Err(FileVaultError::Rejected { code, message }),
            Response::Ok => Err(FileVaultError::Protocol(
                "Unexpected response for SELECT: Ok".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_rejects_multiline_payload() {
        // Never connects: the payload is refused before any I/O.
        let client = Client::new("127.0.0.1:1");
        let err = client.insert("1", b"two\nlines").await.unwrap_err();
        assert!(matches!(err, FileVaultError::Client(_)));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let client = Client::new("127.0.0.1:1");
        assert!(matches!(
            client.select("1").await,
            Err(FileVaultError::Io(_))
        ));
    }
}
