//! SSH transport built on russh.
//!
//! Russh is async-native and pure Rust, which keeps the controller free of C
//! dependencies and integrates directly with the Tokio runtime. One
//! connection serves command execution, SFTP, and gate process pipes; the
//! pool hands out a shared `Arc` per `(host, port, user)`.

use async_trait::async_trait;
use regex::Regex;
use russh::client::{Handle, Handler};
use russh::ChannelMsg;
use russh_keys::key::PublicKey;
use russh_keys::load_secret_key;
use russh_sftp::client::SftpSession;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, trace, warn};

use super::config::{default_identity_files, expand_path, ConnectionConfig};
use super::{
    CommandResult, Connection, ConnectionError, ConnectionErrorKind, ConnectionResult, Endpoint,
    ExecuteOptions, FileStat, GatePipes,
};
use crate::inventory::Host;

/// Buffer size for gate pipe plumbing.
const PIPE_BUFFER: usize = 64 * 1024;

/// Wrapper so russh errors satisfy the `Handler::Error` bound.
#[derive(Debug)]
pub struct SshHandlerError(pub russh::Error);

impl From<russh::Error> for SshHandlerError {
    fn from(err: russh::Error) -> Self {
        SshHandlerError(err)
    }
}

impl std::fmt::Display for SshHandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH error: {}", self.0)
    }
}

impl std::error::Error for SshHandlerError {}

/// Verdict from checking a server key against the known_hosts database.
#[derive(Debug, Clone, Copy, PartialEq)]
enum KeyVerdict {
    /// Key matches a recorded entry for this endpoint.
    Trusted,
    /// No entry covers this endpoint.
    Unknown,
    /// An entry covers this endpoint but records a different key.
    Mismatch,
}

/// One comma-separated known_hosts pattern, compiled to the port it names
/// and an anchored regex over the hostname.
#[derive(Debug, Clone)]
struct HostMatcher {
    port: u16,
    hostname: Regex,
}

impl HostMatcher {
    /// Compile a pattern. `[host]:port` names a non-standard port; a bare
    /// pattern implies 22. Hashed (`|1|...`) patterns cannot be matched
    /// structurally and yield `None`.
    fn compile(pattern: &str) -> Option<Self> {
        if pattern.starts_with('|') {
            return None;
        }
        let (host_glob, port) = match pattern.strip_prefix('[').and_then(|p| p.split_once("]:")) {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (pattern, 22),
        };
        Some(Self {
            port,
            hostname: glob_regex(host_glob)?,
        })
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        self.port == port && self.hostname.is_match(host)
    }
}

/// Translate a known_hosts glob into an anchored, case-insensitive regex:
/// `*` matches any run, `?` a single character, everything else literally.
fn glob_regex(glob: &str) -> Option<Regex> {
    let mut pattern = String::from("(?i)^");
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            ch => pattern.push_str(&regex::escape(&ch.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).ok()
}

/// A public key recorded for some set of host patterns.
#[derive(Debug, Clone)]
struct TrustedKey {
    matchers: Vec<HostMatcher>,
    key: PublicKey,
}

/// The known_hosts database consulted during the SSH handshake.
#[derive(Debug, Clone, Default)]
struct KnownHosts {
    keys: Vec<TrustedKey>,
}

impl KnownHosts {
    /// Load `~/.ssh/known_hosts`; a missing or unreadable file is an empty
    /// database.
    fn load_default() -> Self {
        let path = match dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts")) {
            Some(p) if p.exists() => p,
            _ => return Self::default(),
        };
        match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                debug!(error = %e, "Failed to read known_hosts file");
                Self::default()
            }
        }
    }

    /// Parse known_hosts text: `patterns keytype base64key [comment]` per
    /// line. Comments, `@`-marker lines (cert-authority, revoked), hashed
    /// patterns, and unparseable keys are skipped.
    fn parse(content: &str) -> Self {
        let mut keys = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(patterns), Some(_keytype), Some(key_b64)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };

            let matchers: Vec<HostMatcher> =
                patterns.split(',').filter_map(HostMatcher::compile).collect();
            if matchers.is_empty() {
                continue;
            }
            let Ok(key_bytes) =
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, key_b64)
            else {
                continue;
            };
            let Ok(key) = russh_keys::key::parse_public_key(&key_bytes, None) else {
                continue;
            };
            keys.push(TrustedKey { matchers, key });
        }
        debug!(entry_count = %keys.len(), "Loaded known_hosts entries");
        Self { keys }
    }

    /// Judge a server key for an endpoint. The first entry covering the
    /// endpoint decides.
    fn verdict(&self, host: &str, port: u16, server_key: &PublicKey) -> KeyVerdict {
        for trusted in &self.keys {
            if trusted.matchers.iter().any(|m| m.matches(host, port)) {
                if trusted.key.fingerprint() == server_key.fingerprint() {
                    return KeyVerdict::Trusted;
                }
                return KeyVerdict::Mismatch;
            }
        }
        KeyVerdict::Unknown
    }
}

/// Client handler that verifies the server key against known_hosts.
struct VerifyingHandler {
    host: String,
    port: u16,
    known_hosts: KnownHosts,
    accept_unknown: bool,
}

impl VerifyingHandler {
    fn new(host: &str, port: u16, accept_unknown: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            known_hosts: KnownHosts::load_default(),
            accept_unknown,
        }
    }
}

#[async_trait]
impl Handler for VerifyingHandler {
    type Error = SshHandlerError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self
            .known_hosts
            .verdict(&self.host, self.port, server_public_key)
        {
            KeyVerdict::Trusted => {
                debug!(host = %self.host, "Host key verified against known_hosts");
                Ok(true)
            }
            KeyVerdict::Unknown => {
                if self.accept_unknown {
                    warn!(
                        host = %self.host,
                        "Host not found in known_hosts, accepting (first connection)"
                    );
                    Ok(true)
                } else {
                    warn!(host = %self.host, "Host not found in known_hosts, rejecting");
                    Ok(false)
                }
            }
            KeyVerdict::Mismatch => {
                warn!(
                    host = %self.host,
                    "Host key mismatch! The server's key differs from known_hosts"
                );
                Ok(false)
            }
        }
    }
}

/// SSH connection to one endpoint.
pub struct SshConnection {
    identifier: String,
    endpoint: Endpoint,
    /// Read lock: channel operations. Write lock: close only.
    handle: Arc<RwLock<Option<Handle<VerifyingHandler>>>>,
    connected: Arc<AtomicBool>,
}

impl SshConnection {
    /// Connect and authenticate to a host.
    ///
    /// Idempotence lives at the pool: asking the pool again for an open
    /// endpoint returns the existing connection without dialing.
    pub async fn connect(
        host: &Host,
        endpoint: Endpoint,
        config: &ConnectionConfig,
    ) -> ConnectionResult<Self> {
        debug!(endpoint = %endpoint, "Connecting via SSH");

        let mut client_config = russh::client::Config::default();
        // Gate sessions idle between requests; an inactivity timeout would
        // sever them mid-run.
        client_config.inactivity_timeout = None;
        let client_config = Arc::new(client_config);

        let addr = format!("{}:{}", endpoint.address, endpoint.port);
        let socket = tokio::time::timeout(
            config.connect_timeout,
            tokio::net::TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| {
            ConnectionError::new(
                ConnectionErrorKind::ConnectTimeout,
                &endpoint,
                format!("no TCP connection within {}s", config.connect_timeout.as_secs()),
            )
        })?
        .map_err(|e| {
            let kind = match e.kind() {
                std::io::ErrorKind::ConnectionRefused => ConnectionErrorKind::ConnectRefused,
                _ => ConnectionErrorKind::HostUnreachable,
            };
            ConnectionError::new(kind, &endpoint, e.to_string())
        })?;

        socket.set_nodelay(true).ok();

        let handler = VerifyingHandler::new(
            &endpoint.address,
            endpoint.port,
            config.accept_unknown_hosts,
        );
        let mut session = russh::client::connect_stream(client_config, socket, handler)
            .await
            .map_err(|e| {
                ConnectionError::new(
                    ConnectionErrorKind::HostUnreachable,
                    &endpoint,
                    format!("SSH handshake failed: {e}"),
                )
            })?;

        Self::authenticate(&mut session, host, &endpoint, config).await?;

        debug!(endpoint = %endpoint, "SSH connection established");
        Ok(Self {
            identifier: endpoint.pool_key(),
            endpoint,
            handle: Arc::new(RwLock::new(Some(session))),
            connected: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Try each authentication method in order: the host's identity file,
    /// configured identity files, standard identity files, then password.
    async fn authenticate(
        session: &mut Handle<VerifyingHandler>,
        host: &Host,
        endpoint: &Endpoint,
        config: &ConnectionConfig,
    ) -> ConnectionResult<()> {
        let mut key_paths: Vec<PathBuf> = Vec::new();
        if let Some(identity_file) = &host.private_key_file {
            key_paths.push(expand_path(identity_file));
        }
        key_paths.extend(config.identity_files.iter().cloned());
        key_paths.extend(default_identity_files());

        for key_path in &key_paths {
            if Self::try_key_auth(session, &endpoint.user, key_path)
                .await
                .is_ok()
            {
                debug!(key = %key_path.display(), "Authenticated using key");
                return Ok(());
            }
        }

        if let Some(password) = &host.password {
            let authenticated = session
                .authenticate_password(&endpoint.user, password)
                .await
                .map_err(|e| {
                    ConnectionError::new(
                        ConnectionErrorKind::AuthFailed,
                        endpoint,
                        format!("password authentication failed: {e}"),
                    )
                })?;
            if authenticated {
                debug!("Authenticated using password");
                return Ok(());
            }
        }

        Err(ConnectionError::new(
            ConnectionErrorKind::AuthFailed,
            endpoint,
            "all authentication methods failed",
        ))
    }

    async fn try_key_auth(
        session: &mut Handle<VerifyingHandler>,
        user: &str,
        key_path: &Path,
    ) -> Result<(), String> {
        if !key_path.exists() {
            return Err(format!("key file not found: {}", key_path.display()));
        }
        let key_pair = load_secret_key(key_path, None)
            .map_err(|e| format!("failed to load key {}: {e}", key_path.display()))?;
        let authenticated = session
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|e| format!("key auth failed: {e}"))?;
        if authenticated {
            Ok(())
        } else {
            Err("key rejected".to_string())
        }
    }

    fn closed_error(&self) -> ConnectionError {
        ConnectionError::new(
            ConnectionErrorKind::Closed,
            &self.endpoint,
            "connection is closed",
        )
    }

    fn exec_error(&self, message: impl Into<String>) -> ConnectionError {
        ConnectionError::new(
            ConnectionErrorKind::RemoteExecFailed,
            &self.endpoint,
            message,
        )
    }

    fn sftp_error(&self, message: impl Into<String>) -> ConnectionError {
        ConnectionError::new(ConnectionErrorKind::SftpFailed, &self.endpoint, message)
    }

    /// Open an SFTP session on a fresh channel.
    async fn open_sftp(&self) -> ConnectionResult<SftpSession> {
        let handle_guard = self.handle.read().await;
        let handle = handle_guard.as_ref().ok_or_else(|| self.closed_error())?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| self.sftp_error(format!("failed to open channel: {e}")))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| self.sftp_error(format!("failed to request SFTP subsystem: {e}")))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| self.sftp_error(format!("failed to create SFTP session: {e}")))
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn is_alive(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.handle.read().await.is_some()
    }

    async fn execute(
        &self,
        command: &str,
        options: ExecuteOptions,
    ) -> ConnectionResult<CommandResult> {
        trace!(command = %command, "Executing remote command");

        let execute_future = async {
            let handle_guard = self.handle.read().await;
            let handle = handle_guard.as_ref().ok_or_else(|| self.closed_error())?;
            let mut channel = handle
                .channel_open_session()
                .await
                .map_err(|e| self.exec_error(format!("failed to open channel: {e}")))?;
            drop(handle_guard);

            channel
                .exec(true, command)
                .await
                .map_err(|e| self.exec_error(format!("failed to execute command: {e}")))?;

            if let Some(input) = &options.stdin {
                channel
                    .data(&input[..])
                    .await
                    .map_err(|e| self.exec_error(format!("failed to write stdin: {e}")))?;
            }
            channel
                .eof()
                .await
                .map_err(|e| self.exec_error(format!("failed to send EOF: {e}")))?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut exit_code = None;

            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        stderr.extend_from_slice(data)
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        exit_code = Some(exit_status as i32)
                    }
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }

            Ok(CommandResult {
                exit_code: exit_code.unwrap_or(i32::MAX),
                stdout: String::from_utf8_lossy(&stdout).to_string(),
                stderr: String::from_utf8_lossy(&stderr).to_string(),
            })
        };

        match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, execute_future)
                .await
                .map_err(|_| {
                    ConnectionError::new(
                        ConnectionErrorKind::Timeout,
                        &self.endpoint,
                        format!("command exceeded {}s", timeout.as_secs()),
                    )
                })?,
            None => execute_future.await,
        }
    }

    async fn open_pipes(&self, command: &str) -> ConnectionResult<GatePipes> {
        debug!(command = %command, endpoint = %self.endpoint, "Spawning remote gate process");

        let handle_guard = self.handle.read().await;
        let handle = handle_guard.as_ref().ok_or_else(|| self.closed_error())?;
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| self.exec_error(format!("failed to open channel: {e}")))?;
        drop(handle_guard);

        channel
            .exec(true, command)
            .await
            .map_err(|e| self.exec_error(format!("failed to execute command: {e}")))?;

        // The pump task owns the channel: bytes written to `stdin` flow to
        // the remote process, Data/ExtendedData flow back out the readers.
        let (stdin_writer, mut stdin_reader) = tokio::io::duplex(PIPE_BUFFER);
        let (mut stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_BUFFER);
        let (mut stderr_writer, stderr_reader) = tokio::io::duplex(PIPE_BUFFER);
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut buf = vec![0u8; PIPE_BUFFER];
            let mut stdin_open = true;
            let mut exit_code: i32 = -1;

            loop {
                tokio::select! {
                    read = stdin_reader.read(&mut buf), if stdin_open => match read {
                        Ok(0) | Err(_) => {
                            stdin_open = false;
                            let _ = channel.eof().await;
                        }
                        Ok(n) => {
                            if channel.data(&buf[..n]).await.is_err() {
                                stdin_open = false;
                            }
                        }
                    },
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { ref data }) => {
                            if stdout_writer.write_all(data).await.is_err() {
                                // Reader side dropped; keep draining for exit status.
                            }
                        }
                        Some(ChannelMsg::ExtendedData { ref data, ext }) if ext == 1 => {
                            let _ = stderr_writer.write_all(data).await;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            exit_code = exit_status as i32;
                        }
                        Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    },
                }
            }

            let _ = exit_tx.send(exit_code);
        });

        Ok(GatePipes {
            stdin: Box::new(stdin_writer),
            stdout: Box::new(stdout_reader),
            stderr: Box::new(stderr_reader),
            exit: exit_rx,
        })
    }

    async fn upload_content(&self, content: &[u8], remote_path: &Path) -> ConnectionResult<()> {
        trace!(remote = %remote_path.display(), size = %content.len(), "Uploading content via SFTP");
        let sftp = self.open_sftp().await?;
        let path_str = remote_path.to_string_lossy().to_string();

        let mut remote_file = sftp
            .create(&path_str)
            .await
            .map_err(|e| self.sftp_error(format!("failed to create {path_str}: {e}")))?;
        remote_file
            .write_all(content)
            .await
            .map_err(|e| self.sftp_error(format!("failed to write {path_str}: {e}")))?;
        remote_file
            .shutdown()
            .await
            .map_err(|e| self.sftp_error(format!("failed to flush {path_str}: {e}")))?;
        Ok(())
    }

    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
        trace!(remote = %remote_path.display(), "Downloading content via SFTP");
        let sftp = self.open_sftp().await?;
        let path_str = remote_path.to_string_lossy().to_string();

        let mut remote_file = sftp
            .open(&path_str)
            .await
            .map_err(|e| self.sftp_error(format!("failed to open {path_str}: {e}")))?;
        let mut content = Vec::new();
        remote_file
            .read_to_end(&mut content)
            .await
            .map_err(|e| self.sftp_error(format!("failed to read {path_str}: {e}")))?;
        Ok(content)
    }

    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool> {
        let sftp = self.open_sftp().await?;
        match sftp.try_exists(path.to_string_lossy().to_string()).await {
            Ok(exists) => Ok(exists),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Error checking path existence");
                Ok(false)
            }
        }
    }

    async fn stat(&self, path: &Path) -> ConnectionResult<FileStat> {
        let sftp = self.open_sftp().await?;
        let attrs = sftp
            .metadata(path.to_string_lossy().to_string())
            .await
            .map_err(|e| self.sftp_error(format!("failed to stat {}: {e}", path.display())))?;

        Ok(FileStat {
            size: attrs.size.unwrap_or(0),
            mode: attrs.permissions.unwrap_or(0),
            uid: attrs.uid.unwrap_or(0),
            gid: attrs.gid.unwrap_or(0),
            mtime: attrs.mtime.map(i64::from).unwrap_or(0),
            is_dir: attrs.is_dir(),
            is_file: attrs.is_regular(),
        })
    }

    async fn chmod(&self, path: &Path, mode: u32) -> ConnectionResult<()> {
        let sftp = self.open_sftp().await?;
        let mut attrs = russh_sftp::protocol::FileAttributes::default();
        attrs.permissions = Some(mode);
        sftp.set_metadata(path.to_string_lossy().to_string(), attrs)
            .await
            .map_err(|e| self.sftp_error(format!("failed to chmod {}: {e}", path.display())))
    }

    async fn chown(
        &self,
        path: &Path,
        owner: Option<&str>,
        group: Option<&str>,
    ) -> ConnectionResult<()> {
        let ownership = match (owner, group) {
            (Some(o), Some(g)) => format!("{o}:{g}"),
            (Some(o), None) => o.to_string(),
            (None, Some(g)) => format!(":{g}"),
            (None, None) => return Ok(()),
        };
        let command = format!(
            "chown {} {}",
            ownership,
            shell_words::quote(&path.to_string_lossy())
        );
        let result = self.execute(&command, ExecuteOptions::new()).await?;
        if !result.success() {
            return Err(self.sftp_error(format!("chown failed: {}", result.stderr.trim())));
        }
        Ok(())
    }

    async fn rename(&self, src: &Path, dst: &Path) -> ConnectionResult<()> {
        let sftp = self.open_sftp().await?;
        let src_str = src.to_string_lossy().to_string();
        let dst_str = dst.to_string_lossy().to_string();

        // SFTP rename refuses to clobber on many servers; fall back to mv -f.
        if sftp.rename(&src_str, &dst_str).await.is_ok() {
            return Ok(());
        }
        let command = format!(
            "mv -f {} {}",
            shell_words::quote(&src_str),
            shell_words::quote(&dst_str)
        );
        let result = self.execute(&command, ExecuteOptions::new()).await?;
        if !result.success() {
            return Err(self.sftp_error(format!(
                "rename {} -> {} failed: {}",
                src.display(),
                dst.display(),
                result.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn mkdirs(&self, path: &Path) -> ConnectionResult<()> {
        let sftp = self.open_sftp().await?;
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            if current.to_string_lossy() == "/" {
                continue;
            }
            // Ignore failures for directories that already exist.
            let _ = sftp
                .create_dir(current.to_string_lossy().to_string())
                .await;
        }
        Ok(())
    }

    async fn close(&self) -> ConnectionResult<()> {
        debug!(endpoint = %self.endpoint, "Closing SSH connection");
        self.connected.store(false, Ordering::SeqCst);

        let handle = { self.handle.write().await.take() };
        if let Some(handle) = handle {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
        Ok(())
    }
}
