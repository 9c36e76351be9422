//! Local connection: execute on the controller without any network transport.

use async_trait::async_trait;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::{
    CommandResult, Connection, ConnectionError, ConnectionErrorKind, ConnectionResult, Endpoint,
    ExecuteOptions, FileStat, GatePipes,
};

/// Connection that runs commands and file operations on the current host.
#[derive(Debug, Clone)]
pub struct LocalConnection {
    identifier: String,
    endpoint: Endpoint,
}

impl LocalConnection {
    /// Create a local connection for the given endpoint.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            identifier: "local".to_string(),
            endpoint,
        }
    }

    /// A standalone local connection for one-off use.
    pub fn standalone() -> Self {
        Self::new(Endpoint {
            host: "localhost".to_string(),
            address: "127.0.0.1".to_string(),
            port: 22,
            user: super::whoami(),
        })
    }

    fn exec_error(&self, message: impl Into<String>) -> ConnectionError {
        ConnectionError::new(ConnectionErrorKind::RemoteExecFailed, &self.endpoint, message)
    }

    fn fs_error(&self, message: impl Into<String>) -> ConnectionError {
        ConnectionError::new(ConnectionErrorKind::SftpFailed, &self.endpoint, message)
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        command: &str,
        options: ExecuteOptions,
    ) -> ConnectionResult<CommandResult> {
        debug!(command = %command, "Executing local command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| self.exec_error(format!("Failed to spawn process: {e}")))?;

        if let Some(input) = &options.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input)
                    .await
                    .map_err(|e| self.exec_error(format!("Failed to write stdin: {e}")))?;
            }
        } else {
            drop(child.stdin.take());
        }

        let wait = child.wait_with_output();
        let output = match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.map_err(|_| {
                ConnectionError::new(
                    ConnectionErrorKind::Timeout,
                    &self.endpoint,
                    format!("command exceeded {}s", timeout.as_secs()),
                )
            })?,
            None => wait.await,
        }
        .map_err(|e| self.exec_error(format!("Failed to wait for process: {e}")))?;

        let exit_code = output.status.code().unwrap_or(-1);
        trace!(exit_code = %exit_code, "Local command completed");

        Ok(CommandResult {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn open_pipes(&self, command: &str) -> ConnectionResult<GatePipes> {
        debug!(command = %command, "Spawning local gate process");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.exec_error(format!("Failed to spawn process: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.exec_error("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.exec_error("child stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.exec_error("child stderr unavailable"))?;

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            let _ = exit_tx.send(code);
        });

        Ok(GatePipes {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit: exit_rx,
        })
    }

    async fn upload_content(&self, content: &[u8], remote_path: &Path) -> ConnectionResult<()> {
        if let Some(parent) = remote_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.fs_error(format!("create {}: {e}", parent.display())))?;
            }
        }
        tokio::fs::write(remote_path, content)
            .await
            .map_err(|e| self.fs_error(format!("write {}: {e}", remote_path.display())))
    }

    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
        tokio::fs::read(remote_path)
            .await
            .map_err(|e| self.fs_error(format!("read {}: {e}", remote_path.display())))
    }

    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool> {
        Ok(path.exists())
    }

    async fn stat(&self, path: &Path) -> ConnectionResult<FileStat> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| self.fs_error(format!("stat {}: {e}", path.display())))?;
        Ok(FileStat {
            size: metadata.len(),
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            mtime: metadata.mtime(),
            is_dir: metadata.is_dir(),
            is_file: metadata.is_file(),
        })
    }

    async fn chmod(&self, path: &Path, mode: u32) -> ConnectionResult<()> {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| self.fs_error(format!("chmod {}: {e}", path.display())))
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
            return Err(self.fs_error(format!("chown failed: {}", result.stderr.trim())));
        }
        Ok(())
    }

    async fn rename(&self, src: &Path, dst: &Path) -> ConnectionResult<()> {
        tokio::fs::rename(src, dst).await.map_err(|e| {
            self.fs_error(format!("rename {} -> {}: {e}", src.display(), dst.display()))
        })
    }

    async fn mkdirs(&self, path: &Path) -> ConnectionResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| self.fs_error(format!("mkdir {}: {e}", path.display())))
    }

    async fn close(&self) -> ConnectionResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn conn() -> LocalConnection {
        LocalConnection::standalone()
    }

    #[tokio::test]
    async fn test_execute() {
        let result = conn()
            .execute("echo 'hello world'", ExecuteOptions::new())
            .await
            .unwrap();
        assert!(result.success());
        assert!(result.stdout.contains("hello world"));
    }

    #[tokio::test]
    async fn test_execute_with_stdin() {
        let result = conn()
            .execute("cat", ExecuteOptions::new().with_stdin(&b"fed via stdin"[..]))
            .await
            .unwrap();
        assert_eq!(result.stdout, "fed via stdin");
    }

    #[tokio::test]
    async fn test_execute_failure() {
        let result = conn().execute("exit 42", ExecuteOptions::new()).await.unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 42);
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let result = conn()
            .execute(
                "sleep 10",
                ExecuteOptions::new().with_timeout(std::time::Duration::from_millis(100)),
            )
            .await;
        assert!(matches!(
            result,
            Err(ConnectionError {
                kind: ConnectionErrorKind::Timeout,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_open_pipes_round_trip() {
        let mut pipes = conn().open_pipes("cat").await.unwrap();
        pipes.stdin.write_all(b"ping\n").await.unwrap();
        pipes.stdin.shutdown().await.unwrap();
        drop(pipes.stdin);

        let mut line = String::new();
        let mut reader = BufReader::new(pipes.stdout);
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "ping\n");

        let code = pipes.exit.await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_file_operations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/file.txt");
        let c = conn();

        c.upload_content(b"content", &path).await.unwrap();
        assert!(c.path_exists(&path).await.unwrap());
        assert_eq!(c.download_content(&path).await.unwrap(), b"content");

        c.chmod(&path, 0o600).await.unwrap();
        let stat = c.stat(&path).await.unwrap();
        assert_eq!(stat.mode & 0o777, 0o600);
        assert_eq!(stat.size, 7);
        assert!(stat.is_file);

        let renamed = dir.path().join("renamed.txt");
        c.rename(&path, &renamed).await.unwrap();
        assert!(!c.path_exists(&path).await.unwrap());
        assert!(c.path_exists(&renamed).await.unwrap());
    }
}
