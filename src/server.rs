//! FileVault TCP server
//!
//! Owns the listening socket and runs every accepted connection in its own
//! task. Finished tasks are reaped from a `JoinSet` as the accept loop runs,
//! so a panicking handler is logged and dropped without touching the loop or
//! any other connection.

use crate::{
    config::ServerConfig,
    connection::{ConnectionHandler, ConnectionLimits},
    error::{FileVaultError, Result, TransportError},
    store::{FileStore, Store},
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    net::{lookup_host, TcpListener, TcpSocket, TcpStream},
    sync::broadcast,
    task::{JoinError, JoinSet},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept, so a persistent failure (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Connection counters shared with every handler task
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total connections accepted
    pub accepted: AtomicU64,
    /// Handlers currently running
    pub active: AtomicU64,
    /// Handlers reaped after finishing normally
    pub completed: AtomicU64,
    /// Handlers reaped after a panic or abort
    pub failed: AtomicU64,
}

impl ServerStats {
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    fn connection_opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_reaped(&self, ok: bool) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        if ok {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// FileVault TCP server
pub struct FileVaultServer<S = FileStore> {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    store: Arc<S>,
    stats: Arc<ServerStats>,
    shutdown_tx: broadcast::Sender<()>,
}

impl FileVaultServer<FileStore> {
    /// Open the record directory and bind the listening socket.
    ///
    /// Any failure here is fatal: the server cannot do anything useful
    /// without its socket or its data directory.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let store = FileStore::open(&config.data_dir).await?;
        info!(dir = %store.root().display(), "Serving records");

        Self::bind_with_store(config, Arc::new(store)).await
    }
}

impl<S: Store + 'static> FileVaultServer<S> {
    /// Bind the listening socket in front of an already opened store.
    pub async fn bind_with_store(config: ServerConfig, store: Arc<S>) -> Result<Self> {
        config.validate()?;

        let addr = lookup_host(&config.bind_addr)
            .await?
            .next()
            .ok_or_else(|| {
                FileVaultError::Config(format!("{} did not resolve", config.bind_addr))
            })?;
        let listener = listen(addr, config.backlog)?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            listener,
            local_addr,
            store,
            stats: Arc::new(ServerStats::default()),
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until [`FileVaultServer::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        info!(addr = %self.local_addr, "FileVault server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();
        let max_connections = self.config.max_connections;

        loop {
            tokio::select! {
                // Accept new connections while below the limit
                result = self.listener.accept(), if connections.len() < max_connections => {
                    match result {
                        Ok((stream, peer)) => self.dispatch(&mut connections, stream, peer),
                        Err(e) => {
                            error!(error = %TransportError::Accept(e), "Accept failed, retrying");
                            sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }

                // Reap finished handlers
                Some(joined) = connections.join_next() => self.reap(joined),

                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server...");
                    break;
                }
            }
        }

        self.drain(connections).await;
        info!("Server stopped");
        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send(()).map_err(|_| {
            FileVaultError::Server("Server is not running".to_string())
        })?;
        Ok(())
    }

    fn dispatch(&self, connections: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "Connection accepted");
        self.stats.connection_opened();

        let handler = ConnectionHandler::new(
            stream,
            peer,
            Arc::clone(&self.store),
            ConnectionLimits::from(&self.config),
        );
        // The stream now belongs to the task; the acceptor keeps nothing.
        connections.spawn(async move {
            match handler.run().await {
                Ok(response) => debug!(%peer, ?response, "Connection closed"),
                Err(e) => warn!(%peer, error = %e, "Connection failed"),
            }
        });
    }

    fn reap(&self, joined: std::result::Result<(), JoinError>) {
        match joined {
            Ok(()) => self.stats.connection_reaped(true),
            Err(e) => {
                self.stats.connection_reaped(false);
                if e.is_panic() {
                    error!(error = %e, "Connection handler panicked");
                } else {
                    debug!(error = %e, "Connection handler cancelled");
                }
            }
        }
    }

    /// Give live handlers the grace period, then abort the rest.
    async fn drain(&self, mut connections: JoinSet<()>) {
        if connections.is_empty() {
            return;
        }
        info!(live = connections.len(), "Waiting for open connections");

        let grace = self.config.shutdown_grace();
        let finished = timeout(grace, async {
            while let Some(joined) = connections.join_next().await {
                self.reap(joined);
            }
        })
        .await;

        if finished.is_err() {
            warn!(live = connections.len(), "Grace period over, aborting connections");
            connections.abort_all();
            while let Some(joined) = connections.join_next().await {
                self.reap(joined);
            }
        }
    }
}

/// Create, configure, bind and listen, reporting exactly which step failed.
fn listen(addr: SocketAddr, backlog: u32) -> std::result::Result<TcpListener, TransportError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(TransportError::Socket)?;
    debug!("Socket created");

    socket
        .set_reuseaddr(true)
        .map_err(|source| TransportError::SetOption {
            option: "SO_REUSEADDR",
            source,
        })?;
    debug!("SO_REUSEADDR set");

    socket
        .bind(addr)
        .map_err(|source| TransportError::Bind { addr, source })?;
    debug!(%addr, "Socket bound");

    let listener = socket.listen(backlog).map_err(TransportError::Listen)?;
    debug!(backlog, "Socket listening");
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config(dir: &TempDir) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            data_dir: dir.path().to_path_buf(),
            read_timeout_ms: 200,
            shutdown_grace_ms: 200,
            ..ServerConfig::default()
        }
    }

    async fn request(addr: SocketAddr, line: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(line).await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let dir = TempDir::new().unwrap();
        let first = FileVaultServer::bind(test_config(&dir)).await.unwrap();

        let config = ServerConfig {
            bind_addr: first.local_addr().to_string(),
            ..test_config(&dir)
        };
        let err = FileVaultServer::bind(config).await.err().unwrap();
        assert!(matches!(
            err,
            FileVaultError::Transport(TransportError::Bind { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            max_connections: 0,
            ..test_config(&dir)
        };
        assert!(matches!(
            FileVaultServer::bind(config).await,
            Err(FileVaultError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_handlers_are_reaped_and_shutdown_stops_loop() {
        let dir = TempDir::new().unwrap();
        let server = Arc::new(FileVaultServer::bind(test_config(&dir)).await.unwrap());
        let addr = server.local_addr();
        let stats = server.stats();

        let runner = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };

        for i in 0..5 {
            let reply = request(addr, format!("INSERT {} v{}\n", i, i).as_bytes()).await;
            assert_eq!(reply, b"OK\r\n");
        }

        // Reaping happens on the accept loop; give it a moment.
        for _ in 0..50 {
            if stats.completed.load(Ordering::Relaxed) == 5 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(stats.accepted.load(Ordering::Relaxed), 5);
        assert_eq!(stats.completed.load(Ordering::Relaxed), 5);
        assert_eq!(stats.active(), 0);

        server.shutdown().unwrap();
        runner.await.unwrap().unwrap();
    }

    /// Store whose handler blows up on one particular key
    struct PanicOnKey {
        inner: FileStore,
    }

    impl Store for PanicOnKey {
        async fn insert(
            &self,
            key: &str,
            content: &[u8],
        ) -> std::result::Result<(), StoreError> {
            if key == "boom" {
                panic!("record store exploded on {}", key);
            }
            self.inner.insert(key, content).await
        }

        async fn select(&self, key: &str) -> std::result::Result<Vec<u8>, StoreError> {
            self.inner.select(key).await
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(PanicOnKey {
            inner: FileStore::open(dir.path()).await.unwrap(),
        });
        let server = Arc::new(
            FileVaultServer::bind_with_store(test_config(&dir), store)
                .await
                .unwrap(),
        );
        let addr = server.local_addr();
        let stats = server.stats();

        let runner = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };

        // The panicking task drops its socket: the client just sees it close
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"INSERT boom x\n").await.unwrap();
        let mut reply = Vec::new();
        let read = stream.read_to_end(&mut reply).await;
        assert!(read.is_err() || reply.is_empty(), "unexpected reply {:?}", reply);

        for _ in 0..50 {
            if stats.failed.load(Ordering::Relaxed) == 1 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(stats.failed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active(), 0);

        // The accept loop and later connections are unaffected
        assert_eq!(request(addr, b"INSERT 1 survivor\n").await, b"OK\r\n");
        assert_eq!(request(addr, b"SELECT 1\n").await, b"VALUE survivor\r\n");
        assert_eq!(stats.failed.load(Ordering::Relaxed), 1);

        server.shutdown().unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stuck_connections() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            read_timeout_ms: 60_000,
            ..test_config(&dir)
        };
        let server = Arc::new(FileVaultServer::bind(config).await.unwrap());
        let addr = server.local_addr();
        let stats = server.stats();

        let runner = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };

        let _silent = TcpStream::connect(addr).await.unwrap();
        for _ in 0..50 {
            if stats.active() == 1 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(stats.active(), 1);

        server.shutdown().unwrap();
        runner.await.unwrap().unwrap();
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.failed.load(Ordering::Relaxed), 1);
    }
}
