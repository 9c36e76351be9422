//! Host and group inventory management.
//!
//! The inventory is the declared set of hosts and groups targetable by the
//! engine, with a distinguished pseudo-group `all`. Target resolution selects
//! a single host (exact name match, dash/underscore normalized) or the union
//! of hosts of a named group; a name that matches both resolves to the host.

pub mod group;
pub mod host;
pub mod loader;

pub use group::Group;
pub use host::{ConnectionKind, Host};

use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashSet;

use crate::error::{Error, Result};

/// The transitive closure of groups and their hosts.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: IndexMap<String, Host>,
    groups: IndexMap<String, Group>,
}

/// Normalize a target name: hostnames commonly use dashes where language
/// identifiers use underscores.
fn normalize(name: &str) -> String {
    name.replace('_', "-")
}

impl Inventory {
    /// Create an empty inventory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load an inventory from a YAML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        loader::load_file(path.as_ref())
    }

    /// Load an inventory from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        loader::load_str(text, std::path::Path::new("<inline>"))
    }

    /// Number of hosts.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether the inventory has no hosts.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// All hosts in insertion order.
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    /// All groups in insertion order.
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Look up a host by exact name, then dash/underscore normalized.
    pub fn get_host(&self, name: &str) -> Option<&Host> {
        if let Some(host) = self.hosts.get(name) {
            return Some(host);
        }
        let normalized = normalize(name);
        if normalized != name {
            return self.hosts.get(&normalized);
        }
        None
    }

    /// Look up a group by exact name, then dash/underscore normalized.
    pub fn get_group(&self, name: &str) -> Option<&Group> {
        if let Some(group) = self.groups.get(name) {
            return Some(group);
        }
        let normalized = normalize(name);
        if normalized != name {
            return self.groups.get(&normalized);
        }
        None
    }

    /// Whether a name resolves to a host or a group.
    pub fn knows(&self, name: &str) -> bool {
        self.get_host(name).is_some() || self.get_group(name).is_some()
    }

    /// Add a host, registering it with the given groups (created as needed).
    pub fn add_host(&mut self, mut host: Host, groups: &[String]) {
        for group_name in groups {
            host.groups.insert(group_name.clone());
            self.groups
                .entry(group_name.clone())
                .or_insert_with(|| Group::new(group_name.clone()))
                .add_host(host.name.clone());
        }
        self.hosts.insert(host.name.clone(), host);
    }

    /// Add an empty group if it does not exist yet.
    pub fn add_group(&mut self, group: Group) {
        for host_name in &group.hosts {
            if let Some(host) = self.hosts.get_mut(host_name) {
                host.groups.insert(group.name.clone());
            }
        }
        self.groups.insert(group.name.clone(), group);
    }

    /// The transitive member hosts of a group, children included.
    pub fn group_hosts(&self, name: &str) -> Vec<&Host> {
        let mut seen_groups = HashSet::new();
        let mut member_names = Vec::new();
        self.collect_group_hosts(name, &mut seen_groups, &mut member_names);

        let mut seen_hosts = HashSet::new();
        member_names
            .into_iter()
            .filter(|n| seen_hosts.insert(n.clone()))
            .filter_map(|n| self.hosts.get(&n))
            .collect()
    }

    fn collect_group_hosts(
        &self,
        name: &str,
        seen: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) {
        if !seen.insert(name.to_string()) {
            return;
        }
        let Some(group) = self.get_group(name) else {
            return;
        };
        out.extend(group.hosts.iter().cloned());
        for child in &group.children {
            self.collect_group_hosts(child, seen, out);
        }
    }

    /// Groups a host belongs to, in inventory order.
    pub fn host_groups(&self, host_name: &str) -> Vec<&Group> {
        self.groups
            .values()
            .filter(|g| g.contains(host_name))
            .collect()
    }

    /// Resolve a target name to a set of hosts.
    ///
    /// `local`/`localhost` yields the synthetic local host even on an empty
    /// inventory. `all` selects every host. A name matching both a host and
    /// a group resolves to the host.
    pub fn resolve_target(&self, target: &str) -> Result<Vec<Host>> {
        if target == "local" || target == "localhost" {
            if let Some(host) = self.get_host(target) {
                return Ok(vec![host.clone()]);
            }
            return Ok(vec![Host::local()]);
        }

        if target == "all" {
            return Ok(self.hosts.values().cloned().collect());
        }

        if let Some(host) = self.get_host(target) {
            return Ok(vec![host.clone()]);
        }

        if self.get_group(target).is_some() {
            return Ok(self
                .group_hosts(target)
                .into_iter()
                .cloned()
                .collect());
        }

        Err(Error::TargetNotFound(target.to_string()))
    }

    /// The effective variable mapping for a host: connection builtins, then
    /// group variables in inventory order, then host variables on top.
    pub fn effective_vars(&self, host: &Host) -> IndexMap<String, Value> {
        let mut vars = IndexMap::new();

        vars.insert(
            "ansible_host".to_string(),
            Value::String(host.address().to_string()),
        );
        vars.insert("ansible_port".to_string(), Value::Number(host.port.into()));
        if let Some(user) = &host.user {
            vars.insert("ansible_user".to_string(), Value::String(user.clone()));
        }
        vars.insert(
            "ansible_connection".to_string(),
            Value::String(host.connection.to_string()),
        );

        for group in self.host_groups(&host.name) {
            for (k, v) in &group.vars {
                vars.insert(k.clone(), v.clone());
            }
        }

        for (k, v) in &host.vars {
            vars.insert(k.clone(), v.clone());
        }

        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Inventory {
        let mut inv = Inventory::new();
        let mut web1 = Host::new("web-1");
        web1.set_var("role", json!("frontend"));
        inv.add_host(web1, &["webservers".to_string()]);
        inv.add_host(Host::new("web-2"), &["webservers".to_string()]);
        inv.add_host(Host::new("db-1"), &["databases".to_string()]);
        inv
    }

    #[test]
    fn test_resolve_group() {
        let inv = sample();
        let hosts = inv.resolve_target("webservers").unwrap();
        let names: Vec<_> = hosts.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["web-1", "web-2"]);
    }

    #[test]
    fn test_resolve_all() {
        let inv = sample();
        assert_eq!(inv.resolve_target("all").unwrap().len(), 3);
    }

    #[test]
    fn test_resolve_host_normalized() {
        let inv = sample();
        let hosts = inv.resolve_target("web_1").unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name, "web-1");
    }

    #[test]
    fn test_host_wins_over_group() {
        let mut inv = sample();
        // A host named like an existing group.
        inv.add_host(Host::new("webservers"), &[]);
        let hosts = inv.resolve_target("webservers").unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name, "webservers");
    }

    #[test]
    fn test_localhost_on_empty_inventory() {
        let inv = Inventory::new();
        let hosts = inv.resolve_target("localhost").unwrap();
        assert_eq!(hosts.len(), 1);
        assert!(hosts[0].is_local());
    }

    #[test]
    fn test_unknown_target() {
        let inv = sample();
        assert!(matches!(
            inv.resolve_target("nope"),
            Err(Error::TargetNotFound(_))
        ));
    }

    #[test]
    fn test_nested_group_hosts() {
        let mut inv = sample();
        let mut parent = Group::new("site");
        parent.children.push("webservers".to_string());
        parent.children.push("databases".to_string());
        inv.add_group(parent);

        let hosts = inv.group_hosts("site");
        assert_eq!(hosts.len(), 3);
    }

    #[test]
    fn test_group_cycle_terminates() {
        let mut inv = sample();
        let mut a = Group::new("a");
        a.children.push("b".to_string());
        let mut b = Group::new("b");
        b.children.push("a".to_string());
        b.add_host("web-1");
        inv.add_group(a);
        inv.add_group(b);

        let hosts = inv.group_hosts("a");
        assert_eq!(hosts.len(), 1);
    }

    #[test]
    fn test_effective_vars_precedence() {
        let mut inv = Inventory::new();
        let mut group = Group::new("web");
        group.vars.insert("color".to_string(), json!("blue"));
        group.vars.insert("tier".to_string(), json!("front"));
        let mut host = Host::new("h1");
        host.set_var("color", json!("green"));
        inv.add_host(host, &["web".to_string()]);
        if let Some(g) = inv.groups.get_mut("web") {
            g.vars = group.vars.clone();
        }

        let host = inv.get_host("h1").unwrap().clone();
        let vars = inv.effective_vars(&host);
        // Host var wins over group var.
        assert_eq!(vars["color"], json!("green"));
        assert_eq!(vars["tier"], json!("front"));
        assert_eq!(vars["ansible_host"], json!("h1"));
    }
}
