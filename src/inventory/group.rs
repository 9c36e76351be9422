//! Group definition for the FTL inventory.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named set of hosts with its own variables.
///
/// Groups may nest via `children`; membership is the transitive closure.
/// Group variables are lower-precedence than host variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Group {
    /// Group name.
    pub name: String,

    /// Direct member host names.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Child group names.
    #[serde(default)]
    pub children: Vec<String>,

    /// Group variables.
    #[serde(default)]
    pub vars: IndexMap<String, Value>,
}

impl Group {
    /// Create an empty group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a host to this group if not already present.
    pub fn add_host(&mut self, host: impl Into<String>) {
        let host = host.into();
        if !self.hosts.contains(&host) {
            self.hosts.push(host);
        }
    }

    /// Whether the group directly contains the host.
    pub fn contains(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h == host)
    }
}
