//! Connection configuration and identity file discovery.

use std::path::PathBuf;
use std::time::Duration;

/// Global connection tunables shared by the pool.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// TCP connect + handshake timeout.
    pub connect_timeout: Duration,
    /// SSH keepalive interval; zero disables keepalive.
    pub keepalive_interval: Duration,
    /// Extra identity files to try before the standard locations.
    pub identity_files: Vec<PathBuf>,
    /// Accept hosts missing from known_hosts (StrictHostKeyChecking=accept-new).
    pub accept_unknown_hosts: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
            identity_files: Vec::new(),
            accept_unknown_hosts: true,
        }
    }
}

/// Expand `~` in a user-provided path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Standard identity files tried when a host names none.
pub fn default_identity_files() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let ssh_dir = home.join(".ssh");
    ["id_ed25519", "id_rsa", "id_ecdsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_path("~/.ssh/id_rsa");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.ends_with(".ssh/id_rsa"));
    }

    #[test]
    fn test_default_identity_files_order() {
        let files = default_identity_files();
        if !files.is_empty() {
            assert!(files[0].ends_with(".ssh/id_ed25519"));
            assert_eq!(files.len(), 3);
        }
    }
}
