//! Host definition for the FTL inventory.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// How a host is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// SSH connection (default)
    #[default]
    Ssh,
    /// Execute directly on the controller; never touches SSH
    Local,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionKind::Ssh => write!(f, "ssh"),
            ConnectionKind::Local => write!(f, "local"),
        }
    }
}

/// A managed host in the inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Host name, unique within the inventory.
    pub name: String,

    /// Address to connect to when it differs from the name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// SSH port.
    pub port: u16,

    /// SSH user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Connection kind.
    pub connection: ConnectionKind,

    /// Interpreter hint for gate archives shipped to this host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,

    /// SSH private key file path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<String>,

    /// SSH password (discouraged, use keys).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Host-specific variables.
    #[serde(default)]
    pub vars: IndexMap<String, Value>,

    /// Groups this host belongs to.
    #[serde(skip)]
    pub groups: HashSet<String>,
}

impl Host {
    /// Create a new SSH host with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
            port: 22,
            user: None,
            connection: ConnectionKind::Ssh,
            interpreter: None,
            private_key_file: None,
            password: None,
            vars: IndexMap::new(),
            groups: HashSet::new(),
        }
    }

    /// The synthetic local host used for `local`/`localhost` targets.
    pub fn local() -> Self {
        let mut host = Self::new("localhost");
        host.address = Some("127.0.0.1".to_string());
        host.connection = ConnectionKind::Local;
        host
    }

    /// The address to connect to.
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }

    /// Whether this host executes on the controller.
    pub fn is_local(&self) -> bool {
        self.connection == ConnectionKind::Local
    }

    /// Interpreter to run gate archives with, defaulting to the standard
    /// system path.
    pub fn interpreter(&self) -> &str {
        self.interpreter.as_deref().unwrap_or("/usr/bin/python3")
    }

    /// Set a variable on this host.
    pub fn set_var(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    /// Get a variable from this host.
    pub fn get_var(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Check if host belongs to a specific group.
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Host {}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(addr) = &self.address {
            write!(f, " ({addr})")?;
        }
        Ok(())
    }
}
