//! Unix Socket Server
//!
//! This module provides the socket transport for the SITH daemon:
//! - Accepts connections on a Unix socket
//! - Spawns one [`Session`] task per connection
//! - Tracks active connections for status dumps
//! - Supports graceful shutdown
//!
//! All sessions share one [`SithCore`], so a sequence started from one client
//! can be paused from another.
//!
//! ```text
//!                      SocketServer
//!                           │
//!           ┌───────────────┼───────────────┐
//!           │               │               │
//!       Session         Session         Session
//!       (conn-1)        (conn-2)        (conn-3)
//!           │               │               │
//!           └───────────────┴───────────────┘
//!                           │
//!                       SithCore
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn, Instrument};

use sith_core::SithCore;

use crate::session::Session;

/// Identifier of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Remote peer UID (from `SO_PEERCRED`)
    peer_uid: Option<u32>,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the socket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Echo each frame before its reply
    pub echo: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            echo: false,
        }
    }
}

/// Statistics for a single connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    /// Peer UID
    pub peer_uid: Option<u32>,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

/// The Unix socket server
pub struct SocketServer {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Shared protocol engine
    core: Arc<SithCore>,
    /// Server configuration
    server_config: ServerConfig,
    /// Active connection state (task handles, peer info)
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
    next_connection: AtomicU64,
}

impl SocketServer {
    /// Create a new socket server
    pub fn new(socket_path: PathBuf, core: Arc<SithCore>, server_config: ServerConfig) -> Self {
        Self {
            socket_path,
            core,
            server_config,
            connection_states: Arc::new(DashMap::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Socket path this server binds
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Get peer credentials from Unix socket
    #[cfg(target_os = "linux")]
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        // SAFETY: ucred is plain old data; getsockopt fills at most `len` bytes
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        #[allow(clippy::cast_possible_truncation)]
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: fd is a live socket owned by `stream`; cred and len outlive the call
        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if result == 0 {
            Some(cred.uid)
        } else {
            None
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn get_peer_uid(_stream: &UnixStream) -> Option<u32> {
        None
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Bind the socket (owner-only permissions)
    ///
    /// # Errors
    ///
    /// Socket directory, stale socket removal or bind failures.
    pub fn bind(&self) -> Result<UnixListener> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.socket_path, perms)?;
        }

        info!(path = ?self.socket_path, "Listening for connections");
        Ok(listener)
    }

    /// Accept connections until `shutdown` turns true
    ///
    /// # Errors
    ///
    /// Bind failures, or failure to remove the socket on shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await
    }

    /// Accept loop over an already bound listener
    ///
    /// # Errors
    ///
    /// Failure to remove the socket on shutdown.
    pub async fn serve(
        &self,
        listener: UnixListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        // SAFETY: getuid has no preconditions and cannot fail
        let our_uid = unsafe { libc::getuid() };

        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            let stream = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed, stopping accept loop");
                        break;
                    }
                    continue;
                }
            };

            if self.connection_states.len() >= self.server_config.max_connections {
                warn!("Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            // Same user as the daemon, or root
            let peer_uid = Self::get_peer_uid(&stream);
            if let Some(uid) = peer_uid {
                if uid != our_uid && uid != 0 {
                    warn!(
                        peer_uid = uid,
                        our_uid = our_uid,
                        "Rejecting connection from different user"
                    );
                    drop(stream);
                    continue;
                }
            }

            let conn_id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
            info!(
                conn_id = %conn_id,
                peer_uid = ?peer_uid,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            // The handler may only deregister after it has been registered
            let (registered_tx, registered_rx) = oneshot::channel();
            let task_handle = tokio::spawn(
                Self::handle_connection(
                    conn_id,
                    stream,
                    Arc::clone(&self.core),
                    self.server_config.echo,
                    Arc::clone(&self.connection_states),
                    registered_rx,
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );

            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer_uid,
                    abort_handle: task_handle.abort_handle(),
                },
            );
            let _ = registered_tx.send(());
        }

        self.shutdown().await
    }

    /// Handle a single client connection
    async fn handle_connection(
        conn_id: ConnectionId,
        stream: UnixStream,
        core: Arc<SithCore>,
        echo: bool,
        connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
        registered: oneshot::Receiver<()>,
    ) {
        let _ = registered.await;
        info!("Connection handler started");

        match Session::new(core, stream, echo).run().await {
            Ok(stats) => info!(
                frames = stats.frames,
                ok = stats.ok,
                errors = stats.errors,
                "Session ended"
            ),
            Err(e) => warn!(error = %e, "Session ended with I/O error"),
        }

        connection_states.remove(&conn_id);
        info!(
            active_connections = connection_states.len(),
            "Connection handler finished"
        );
    }

    /// Graceful shutdown
    async fn shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<ConnectionId> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, conn_state)) = self.connection_states.remove(&conn_id) {
                info!(conn_id = %conn_id, "Aborting connection");
                conn_state.abort_handle.abort();
            }
        }

        // Let aborted handlers unwind
        tokio::task::yield_now().await;

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove socket: {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "Socket file removed");
        }

        info!("Socket server stopped");
        Ok(())
    }

    /// Get number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }

    /// Get connection statistics
    pub fn connection_stats(&self) -> HashMap<ConnectionId, ConnectionStats> {
        self.connection_states
            .iter()
            .map(|r| {
                let conn_state = r.value();
                (
                    *r.key(),
                    ConnectionStats {
                        peer_uid: conn_state.peer_uid,
                        uptime_secs: conn_state.connected_at.elapsed().as_secs(),
                    },
                )
            })
            .collect()
    }
}
