// ADB server connection management
//
// Produces connected sockets for the device tracker, restarting the server
// when connects keep failing, and guarantees no socket is handed out once a
// stop has been requested.

use crate::protocol::{AdbError, AdbResult};
use crate::server::ServerControl;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Any bidirectional byte stream the bridge can speak ADB over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type AdbStream = Box<dyn AsyncStream>;

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = io::Result<AdbStream>> + Send + 'a>>;

/// Opens new connections to the ADB server
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> ConnectFuture<'_>;
}

/// TCP connector for a server on a fixed address
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            let stream = TcpStream::connect(&self.addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as AdbStream)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// Diagnostic view of the reconnect loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub phase: ConnectionPhase,
    pub failed_attempts: u32,
    pub restart_attempts: u32,
    pub stop_requested: bool,
}

#[derive(Debug)]
struct ConnectionState {
    phase: ConnectionPhase,
    failed_attempts: u32,
    restart_attempts: u32,
}

/// Owns the reconnect policy of one tracking connection.
///
/// The stream itself is owned by the worker that reads it; the manager only
/// fills the worker's empty slot. `request_stop` and `ensure_connected`
/// serialize on the same state lock, and the stop flag is published before
/// that lock is taken so an in-flight connect sees it on completion.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    server: Arc<dyn ServerControl>,
    backoff: Duration,
    state: Mutex<ConnectionState>,
    stop_tx: watch::Sender<bool>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, server: Arc<dyn ServerControl>, backoff: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);

        Self {
            connector,
            server,
            backoff,
            state: Mutex::new(ConnectionState {
                phase: ConnectionPhase::Disconnected,
                failed_attempts: 0,
                restart_attempts: 0,
            }),
            stop_tx,
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Receiver that flips to `true` when a stop is requested
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Make sure `slot` holds a connected stream.
    ///
    /// Returns `Ok(true)` when a new connection was established (the caller
    /// must redo its service request), `Ok(false)` when the existing stream is
    /// kept, and `Err(Stopped)` once a stop has been requested.
    pub async fn ensure_connected(&self, slot: &mut Option<AdbStream>) -> AdbResult<bool> {
        let mut stop_rx = self.stop_signal();
        let mut state = self.state.lock().await;

        loop {
            if self.is_stop_requested() {
                state.phase = ConnectionPhase::Disconnected;
                *slot = None;
                return Err(AdbError::Stopped);
            }

            if slot.is_some() && state.phase == ConnectionPhase::Connected {
                return Ok(false);
            }

            // Stale handle from a dropped session
            *slot = None;
            state.phase = ConnectionPhase::Connecting;

            let connected = tokio::select! {
                result = self.connector.connect() => Some(result),
                _ = wait_for_stop(&mut stop_rx) => None,
            };

            let Some(connected) = connected else {
                debug!("Connect abandoned after stop");
                state.phase = ConnectionPhase::Disconnected;
                return Err(AdbError::Stopped);
            };

            match connected {
                Ok(stream) => {
                    if self.is_stop_requested() {
                        debug!("Discarding connection that completed after stop");
                        drop(stream);
                        state.phase = ConnectionPhase::Disconnected;
                        return Err(AdbError::Stopped);
                    }

                    if state.failed_attempts > 0 {
                        info!(
                            "Connected to ADB server after {} failed attempts",
                            state.failed_attempts
                        );
                    } else {
                        info!("Connected to ADB server");
                    }

                    state.failed_attempts = 0;
                    state.restart_attempts = 0;
                    state.phase = ConnectionPhase::Connected;
                    *slot = Some(stream);
                    return Ok(true);
                }
                Err(e) => {
                    state.phase = ConnectionPhase::Disconnected;
                    state.failed_attempts += 1;
                    warn!(
                        attempt = state.failed_attempts,
                        "Failed to connect to ADB server: {}", e
                    );

                    // Only the first failure of a run restarts the server
                    if state.failed_attempts == 1 {
                        match self.restart_server().await {
                            Ok(true) => continue,
                            Ok(false) => state.restart_attempts += 1,
                            Err(_) => continue,
                        }
                    }

                    // Never sleep with the lock held
                    drop(state);
                    debug!("Backing off for {:?}", self.backoff);
                    tokio::select! {
                        _ = tokio::time::sleep(self.backoff) => {}
                        _ = wait_for_stop(&mut stop_rx) => {}
                    }
                    state = self.state.lock().await;
                }
            }
        }
    }

    /// Record that the owning worker dropped its stream
    pub async fn mark_disconnected(&self) {
        let mut state = self.state.lock().await;
        state.phase = ConnectionPhase::Disconnected;
    }

    /// Stop handing out connections.
    ///
    /// Workers select on `stop_signal` and drop their stream when it fires,
    /// which is what unblocks a pending read. Never fails.
    pub async fn request_stop(&self) {
        self.stop_tx.send_replace(true);

        let mut state = self.state.lock().await;
        state.phase = ConnectionPhase::Disconnected;
        debug!("Connection stop requested");
    }

    /// Stop-aware sleep for retry loops
    pub async fn backoff(&self) {
        let mut stop_rx = self.stop_signal();
        tokio::select! {
            _ = tokio::time::sleep(self.backoff) => {}
            _ = wait_for_stop(&mut stop_rx) => {}
        }
    }

    pub async fn stats(&self) -> ConnectionStats {
        let state = self.state.lock().await;
        ConnectionStats {
            phase: state.phase,
            failed_attempts: state.failed_attempts,
            restart_attempts: state.restart_attempts,
            stop_requested: self.is_stop_requested(),
        }
    }

    /// Kill then restart the server. Returns whether the server came up, or
    /// `Stopped` if a stop landed at any step.
    async fn restart_server(&self) -> AdbResult<bool> {
        if self.is_stop_requested() {
            return Err(AdbError::Stopped);
        }

        info!("Restarting ADB server");
        let server = self.server.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || server.kill_server()).await {
            warn!("kill_server task failed: {}", e);
        }

        if self.is_stop_requested() {
            return Err(AdbError::Stopped);
        }

        let server = self.server.clone();
        let started = tokio::task::spawn_blocking(move || server.ensure_server_started())
            .await
            .unwrap_or_else(|e| {
                warn!("ensure_server_started task failed: {}", e);
                false
            });

        if self.is_stop_requested() {
            return Err(AdbError::Stopped);
        }

        if !started {
            warn!("ADB server did not start");
        }
        Ok(started)
    }
}

/// Resolves once a stop is signalled on `stop_rx` or its sender is gone
pub(crate) async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}
