//! Connection layer for host communication.
//!
//! This module provides a unified interface for executing commands, moving
//! files, and spawning gate processes across transports. Two transports
//! exist: SSH (via `russh`, pure Rust) and local (subprocess + std::fs).
//! "local"-connection hosts never touch SSH.
//!
//! Connections are pooled by `(host, port, user)`; a gate session keeps its
//! pooled connection alive for its lifetime via the shared `Arc`.

pub mod config;
pub mod local;
pub mod ssh;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tracing::debug;

pub use config::ConnectionConfig;

use crate::inventory::Host;

/// What failed, independent of which host it failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// TCP connect did not complete within the timeout.
    ConnectTimeout,
    /// The remote actively refused the connection.
    ConnectRefused,
    /// No route to the host or name resolution failed.
    HostUnreachable,
    /// All authentication methods were rejected.
    AuthFailed,
    /// A remote command could not be started or its channel broke.
    RemoteExecFailed,
    /// An SFTP operation failed.
    SftpFailed,
    /// The connection was closed underneath an operation.
    Closed,
    /// A command exceeded its wall-clock timeout.
    Timeout,
}

impl std::fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ConnectTimeout => "Connection timeout",
            Self::ConnectRefused => "Connection refused",
            Self::HostUnreachable => "Host unreachable",
            Self::AuthFailed => "Authentication failed",
            Self::RemoteExecFailed => "Remote execution failed",
            Self::SftpFailed => "SFTP operation failed",
            Self::Closed => "Connection closed",
            Self::Timeout => "Operation timed out",
        };
        write!(f, "{name}")
    }
}

/// A transport failure, carrying everything a user needs to act on it.
#[derive(Error, Debug, Clone)]
#[error("{kind} for {user}@{address}:{port} (host '{host}'): {message}")]
pub struct ConnectionError {
    /// Classification of the failure.
    pub kind: ConnectionErrorKind,
    /// Inventory host name.
    pub host: String,
    /// Address that was dialed.
    pub address: String,
    /// Port that was dialed.
    pub port: u16,
    /// User the connection was made as.
    pub user: String,
    /// Attempt number when retries are in play.
    pub attempt: Option<u32>,
    /// Underlying error text.
    pub message: String,
}

impl ConnectionError {
    /// Build an error from an endpoint description.
    pub fn new(kind: ConnectionErrorKind, endpoint: &Endpoint, message: impl Into<String>) -> Self {
        Self {
            kind,
            host: endpoint.host.clone(),
            address: endpoint.address.clone(),
            port: endpoint.port,
            user: endpoint.user.clone(),
            attempt: None,
            message: message.into(),
        }
    }

    /// Attach the attempt number this failure occurred on.
    pub fn on_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Whether a fresh attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ConnectionErrorKind::ConnectTimeout
                | ConnectionErrorKind::ConnectRefused
                | ConnectionErrorKind::HostUnreachable
                | ConnectionErrorKind::Closed
        )
    }

    /// Human-directed suggestions templated for the failure kind.
    pub fn suggestions(&self) -> Vec<String> {
        match self.kind {
            ConnectionErrorKind::ConnectTimeout | ConnectionErrorKind::ConnectRefused => vec![
                format!("Check reachability: nc -zv {} {}", self.address, self.port),
                "Verify the host is up and sshd is listening".to_string(),
            ],
            ConnectionErrorKind::HostUnreachable => vec![
                format!("Check DNS/route: ping {}", self.address),
                "Verify the address in your inventory".to_string(),
            ],
            ConnectionErrorKind::AuthFailed => vec![
                format!("Install your key: ssh-copy-id {}@{}", self.user, self.address),
                "Verify ansible_user and key/password settings for this host".to_string(),
            ],
            ConnectionErrorKind::Timeout => {
                vec!["Raise the module timeout or check load on the host".to_string()]
            }
            _ => vec![format!(
                "Try manually: ssh {}@{} -p {}",
                self.user, self.address, self.port
            )],
        }
    }
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Where a connection points: inventory name plus dialing coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Inventory host name.
    pub host: String,
    /// Address that gets dialed.
    pub address: String,
    /// Port that gets dialed.
    pub port: u16,
    /// User to authenticate as.
    pub user: String,
}

impl Endpoint {
    /// Build the endpoint for an inventory host, falling back to the current
    /// user when none is configured.
    pub fn for_host(host: &Host) -> Self {
        Self {
            host: host.name.clone(),
            address: host.address().to_string(),
            port: host.port,
            user: host.user.clone().unwrap_or_else(whoami),
        }
    }

    /// Pool key: `user@address:port`.
    pub fn pool_key(&self) -> String {
        format!("{}@{}:{}", self.user, self.address, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.address, self.port)
    }
}

/// The result of executing a command on a connection.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit code of the command.
    pub exit_code: i32,
    /// Content written to standard output.
    pub stdout: String,
    /// Content written to standard error.
    pub stderr: String,
}

impl CommandResult {
    /// Convenience flag: `true` if `exit_code == 0`.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Options for command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Bytes to feed the command on stdin.
    pub stdin: Option<Vec<u8>>,
    /// Wall-clock timeout.
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    /// Create empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the command bytes on stdin.
    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Bound the command's wall-clock runtime.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// File statistics from `stat`.
#[derive(Debug, Clone, Default)]
pub struct FileStat {
    /// File size in bytes.
    pub size: u64,
    /// File mode (permissions).
    pub mode: u32,
    /// Owner UID.
    pub uid: u32,
    /// Group GID.
    pub gid: u32,
    /// Last modification time (Unix timestamp).
    pub mtime: i64,
    /// Is this a directory?
    pub is_dir: bool,
    /// Is this a regular file?
    pub is_file: bool,
}

/// The stdio of a spawned gate process.
///
/// Streams are independently readable and writable; `exit` resolves when the
/// process finishes.
pub struct GatePipes {
    /// Write side of the process stdin.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Read side of the process stdout.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Read side of the process stderr.
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves with the exit code once the process terminates.
    pub exit: oneshot::Receiver<i32>,
}

/// The transport trait both SSH and local connections implement.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Stable identifier (pool key).
    fn identifier(&self) -> &str;

    /// Endpoint this connection serves.
    fn endpoint(&self) -> &Endpoint;

    /// Whether the connection is believed usable.
    async fn is_alive(&self) -> bool;

    /// Run a command, optionally feeding stdin, with an optional timeout.
    async fn execute(&self, command: &str, options: ExecuteOptions)
        -> ConnectionResult<CommandResult>;

    /// Spawn a long-lived process and hand back its pipes.
    async fn open_pipes(&self, command: &str) -> ConnectionResult<GatePipes>;

    /// Write bytes to a file on the target.
    async fn upload_content(&self, content: &[u8], remote_path: &Path) -> ConnectionResult<()>;

    /// Read a file on the target.
    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>>;

    /// Whether a path exists on the target.
    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool>;

    /// Stat a path on the target.
    async fn stat(&self, path: &Path) -> ConnectionResult<FileStat>;

    /// Change file mode.
    async fn chmod(&self, path: &Path, mode: u32) -> ConnectionResult<()>;

    /// Change file ownership by name.
    async fn chown(
        &self,
        path: &Path,
        owner: Option<&str>,
        group: Option<&str>,
    ) -> ConnectionResult<()>;

    /// Atomically rename a file on the target.
    async fn rename(&self, src: &Path, dst: &Path) -> ConnectionResult<()>;

    /// Create a directory and its parents on the target.
    async fn mkdirs(&self, path: &Path) -> ConnectionResult<()>;

    /// Close the connection.
    async fn close(&self) -> ConnectionResult<()>;
}

/// A shared connection handle.
pub type SharedConnection = Arc<dyn Connection>;

/// Pool of live connections keyed by `user@address:port`.
pub struct ConnectionPool {
    config: ConnectionConfig,
    connections: RwLock<HashMap<String, SharedConnection>>,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Return a live connection for the host, creating one if needed.
    ///
    /// Local hosts get a [`local::LocalConnection`]; everything else gets an
    /// SSH connection.
    pub async fn get(&self, host: &Host) -> ConnectionResult<SharedConnection> {
        let endpoint = Endpoint::for_host(host);
        let key = if host.is_local() {
            "local".to_string()
        } else {
            endpoint.pool_key()
        };

        let existing = self.connections.read().get(&key).cloned();
        if let Some(conn) = existing {
            if conn.is_alive().await {
                return Ok(conn);
            }
            debug!(key = %key, "Pooled connection is dead, reconnecting");
            self.connections.write().remove(&key);
        }

        let conn: SharedConnection = if host.is_local() {
            Arc::new(local::LocalConnection::new(endpoint))
        } else {
            Arc::new(ssh::SshConnection::connect(host, endpoint, &self.config).await?)
        };

        self.connections.write().insert(key, conn.clone());
        Ok(conn)
    }

    /// Drop a connection from the pool (it may stay alive while sessions
    /// hold their `Arc`).
    pub fn evict(&self, key: &str) {
        self.connections.write().remove(key);
    }

    /// Number of pooled connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Close every pooled connection, draining in bounded parallelism.
    ///
    /// The pool owns all sockets; leaking descriptors on shutdown is not
    /// acceptable even when individual closes fail.
    pub async fn close_all(&self) {
        use futures::stream::{self, StreamExt};

        let connections: Vec<_> = {
            let mut pool = self.connections.write();
            pool.drain().map(|(_, conn)| conn).collect()
        };

        stream::iter(connections)
            .for_each_concurrent(8, |conn| async move {
                if let Err(e) = conn.close().await {
                    debug!(connection = %conn.identifier(), error = %e, "Error closing connection");
                }
            })
            .await;
    }
}

/// The current username, used when a host does not configure one.
fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}
