//! Persistent state for dynamically-added hosts and provisioned resources.
//!
//! The store mirrors a JSON document in memory and persists every mutation
//! via tempfile + fsync + rename, so the on-disk file is never partial. A
//! corrupt existing file is logged and replaced with empty state on the next
//! successful mutation; until then the bad file is left untouched.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Current state document schema version.
const STATE_VERSION: u32 = 1;

/// Errors raised by the state store.
#[derive(Error, Debug)]
pub enum StateError {
    /// The state file could not be written or renamed into place.
    #[error("Failed to write state file '{path}': {message}")]
    WriteFailed {
        /// Path to the state file
        path: PathBuf,
        /// What went wrong
        message: String,
    },
}

/// Result type for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// The on-disk state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    /// Schema version for future locking/migration work.
    pub version: u32,
    /// When this document was first created.
    pub created_at: DateTime<Utc>,
    /// Advanced on every write.
    pub updated_at: DateTime<Utc>,
    /// Dynamically-added hosts by name.
    #[serde(default)]
    pub hosts: IndexMap<String, Map<String, Value>>,
    /// Provisioned resources by name.
    #[serde(default)]
    pub resources: IndexMap<String, Map<String, Value>>,
}

impl StateDocument {
    fn empty() -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            created_at: now,
            updated_at: now,
            hosts: IndexMap::new(),
            resources: IndexMap::new(),
        }
    }
}

/// A host record as stored in state.
#[derive(Debug, Clone, Default)]
pub struct HostRecord {
    /// Address to connect to.
    pub address: Option<String>,
    /// SSH username.
    pub user: Option<String>,
    /// SSH port.
    pub port: u16,
    /// Groups the host belongs to.
    pub groups: Vec<String>,
    /// Additional free-form variables.
    pub extras: Map<String, Value>,
}

/// Persistent store of hosts and resources.
///
/// Single-writer within one process; cross-process writers are not supported
/// (the document carries a version field for future advisory locking).
pub struct StateStore {
    path: PathBuf,
    data: StateDocument,
}

impl StateStore {
    /// Load state from a file, starting empty if it is missing or corrupt.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = Self::read_document(&path);
        Self { path, data }
    }

    fn read_document(path: &Path) -> StateDocument {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return StateDocument::empty();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read state file; starting with empty state");
                return StateDocument::empty();
            }
        };
        if content.trim().is_empty() {
            return StateDocument::empty();
        }
        match serde_json::from_str(&content) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "State file is corrupt; starting with empty state");
                StateDocument::empty()
            }
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the current document atomically.
    ///
    /// Writes pretty-printed 2-space JSON with a trailing newline to a
    /// sibling tempfile, fsyncs, and renames over the target.
    fn save(&mut self) -> StateResult<()> {
        self.data.updated_at = Utc::now();

        let write = |path: &Path, data: &StateDocument| -> std::io::Result<()> {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            if let Some(dir) = dir {
                std::fs::create_dir_all(dir)?;
            }
            let mut tmp = tempfile::Builder::new()
                .prefix(".ftl-state-")
                .suffix(".tmp")
                .tempfile_in(dir.unwrap_or_else(|| Path::new(".")))?;
            let content = serde_json::to_string_pretty(data)?;
            tmp.write_all(content.as_bytes())?;
            tmp.write_all(b"\n")?;
            tmp.flush()?;
            tmp.as_file().sync_all()?;
            tmp.persist(path).map_err(|e| e.error)?;
            Ok(())
        };

        write(&self.path, &self.data).map_err(|e| StateError::WriteFailed {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        debug!(path = %self.path.display(), "State persisted");
        Ok(())
    }

    fn now_string() -> Value {
        Value::String(Utc::now().to_rfc3339())
    }

    // ========================================================================
    // Host operations
    // ========================================================================

    /// Check if a host exists in state.
    pub fn has_host(&self, name: &str) -> bool {
        self.data.hosts.contains_key(name)
    }

    /// Get a host record from state.
    pub fn get_host(&self, name: &str) -> Option<&Map<String, Value>> {
        self.data.hosts.get(name)
    }

    /// Add a host to state and persist.
    pub fn add_host(&mut self, name: &str, record: HostRecord) -> StateResult<()> {
        let mut data = Map::new();
        data.insert(
            "address".to_string(),
            Value::String(record.address.unwrap_or_else(|| name.to_string())),
        );
        data.insert("port".to_string(), Value::Number(record.port.into()));
        data.insert(
            "groups".to_string(),
            Value::Array(record.groups.into_iter().map(Value::String).collect()),
        );
        data.insert("added_at".to_string(), Self::now_string());
        if let Some(user) = record.user {
            data.insert("user".to_string(), Value::String(user));
        }
        for (k, v) in record.extras {
            data.insert(k, v);
        }
        self.data.hosts.insert(name.to_string(), data);
        self.save()
    }

    /// Remove a host from state, persisting if anything changed.
    pub fn remove_host(&mut self, name: &str) -> StateResult<bool> {
        if self.data.hosts.shift_remove(name).is_some() {
            self.save()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Names of all hosts in state.
    pub fn hosts(&self) -> Vec<String> {
        self.data.hosts.keys().cloned().collect()
    }

    /// Iterate host records.
    pub fn host_records(&self) -> impl Iterator<Item = (&String, &Map<String, Value>)> {
        self.data.hosts.iter()
    }

    // ========================================================================
    // Resource operations
    // ========================================================================

    /// Check if a resource exists in state.
    pub fn has_resource(&self, name: &str) -> bool {
        self.data.resources.contains_key(name)
    }

    /// Get a resource record from state.
    pub fn get_resource(&self, name: &str) -> Option<&Map<String, Value>> {
        self.data.resources.get(name)
    }

    /// Add a resource to state and persist. Sets `created_at`.
    pub fn add_resource(&mut self, name: &str, data: Map<String, Value>) -> StateResult<()> {
        let mut record = Map::new();
        record.insert("created_at".to_string(), Self::now_string());
        for (k, v) in data {
            record.insert(k, v);
        }
        self.data.resources.insert(name.to_string(), record);
        self.save()
    }

    /// Shallow-merge a patch into an existing resource. Sets `last_seen`.
    pub fn update_resource(&mut self, name: &str, patch: Map<String, Value>) -> StateResult<bool> {
        let Some(record) = self.data.resources.get_mut(name) else {
            return Ok(false);
        };
        for (k, v) in patch {
            record.insert(k, v);
        }
        record.insert("last_seen".to_string(), Self::now_string());
        self.save()?;
        Ok(true)
    }

    /// Remove a resource from state, persisting if anything changed.
    pub fn remove_resource(&mut self, name: &str) -> StateResult<bool> {
        if self.data.resources.shift_remove(name).is_some() {
            self.save()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// All resources, optionally filtered by `provider` field.
    pub fn resources(&self, provider: Option<&str>) -> IndexMap<String, Map<String, Value>> {
        self.data
            .resources
            .iter()
            .filter(|(_, data)| match provider {
                None => true,
                Some(p) => data.get("provider").and_then(Value::as_str) == Some(p),
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // ========================================================================
    // Unified interface
    // ========================================================================

    /// Check if a name exists as either host or resource.
    pub fn has(&self, name: &str) -> bool {
        self.has_host(name) || self.has_resource(name)
    }

    /// Get a record by name, resources first, then hosts.
    pub fn get(&self, name: &str) -> Option<&Map<String, Value>> {
        self.get_resource(name).or_else(|| self.get_host(name))
    }

    /// Remove a name from both maps.
    pub fn remove(&mut self, name: &str) -> StateResult<bool> {
        let removed_host = self.data.hosts.shift_remove(name).is_some();
        let removed_resource = self.data.resources.shift_remove(name).is_some();
        if removed_host || removed_resource {
            self.save()?;
        }
        Ok(removed_host || removed_resource)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("path", &self.path)
            .field("hosts", &self.data.hosts.len())
            .field("resources", &self.data.resources.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        (dir, path)
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let (_dir, path) = scratch();
        let store = StateStore::load(&path);
        assert!(store.hosts().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_add_host_persists_and_reloads() {
        let (_dir, path) = scratch();
        let mut store = StateStore::load(&path);
        store
            .add_host(
                "web1",
                HostRecord {
                    address: Some("10.0.0.5".to_string()),
                    user: Some("admin".to_string()),
                    port: 2222,
                    groups: vec!["web".to_string()],
                    extras: Map::new(),
                },
            )
            .unwrap();

        let reloaded = StateStore::load(&path);
        let host = reloaded.get_host("web1").unwrap();
        assert_eq!(host["address"], json!("10.0.0.5"));
        assert_eq!(host["port"], json!(2222));
        assert_eq!(host["user"], json!("admin"));
        assert_eq!(host["groups"], json!(["web"]));
        assert!(host.contains_key("added_at"));
    }

    #[test]
    fn test_file_is_pretty_with_trailing_newline() {
        let (_dir, path) = scratch();
        let mut store = StateStore::load(&path);
        store.add_resource("r1", Map::new()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with('\n'));
        assert!(content.contains("  \"version\": 1"));
    }

    #[test]
    fn test_update_resource_merges_and_sets_last_seen() {
        let (_dir, path) = scratch();
        let mut store = StateStore::load(&path);
        let mut data = Map::new();
        data.insert("provider".to_string(), json!("linode"));
        data.insert("status".to_string(), json!("provisioning"));
        store.add_resource("vm1", data).unwrap();

        let mut patch = Map::new();
        patch.insert("status".to_string(), json!("running"));
        assert!(store.update_resource("vm1", patch).unwrap());

        let record = store.get_resource("vm1").unwrap();
        assert_eq!(record["provider"], json!("linode"));
        assert_eq!(record["status"], json!("running"));
        assert!(record.contains_key("last_seen"));
        assert!(record.contains_key("created_at"));
    }

    #[test]
    fn test_update_missing_resource_returns_false() {
        let (_dir, path) = scratch();
        let mut store = StateStore::load(&path);
        assert!(!store.update_resource("ghost", Map::new()).unwrap());
    }

    #[test]
    fn test_get_prefers_resources() {
        let (_dir, path) = scratch();
        let mut store = StateStore::load(&path);
        store.add_host("dual", HostRecord::default()).unwrap();
        let mut data = Map::new();
        data.insert("provider".to_string(), json!("aws"));
        store.add_resource("dual", data).unwrap();

        let record = store.get("dual").unwrap();
        assert_eq!(record["provider"], json!("aws"));
    }

    #[test]
    fn test_remove_clears_both() {
        let (_dir, path) = scratch();
        let mut store = StateStore::load(&path);
        store.add_host("x", HostRecord::default()).unwrap();
        store.add_resource("x", Map::new()).unwrap();
        assert!(store.remove("x").unwrap());
        assert!(!store.has("x"));
        assert!(!store.remove("x").unwrap());
    }

    #[test]
    fn test_corrupt_file_recovers_empty_without_overwrite() {
        let (_dir, path) = scratch();
        std::fs::write(&path, "{ this is not json").unwrap();

        let store = StateStore::load(&path);
        assert!(store.hosts().is_empty());
        // The corrupt file is preserved until the next successful mutation.
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "{ this is not json"
        );

        let mut store = store;
        store.add_resource("fresh", Map::new()).unwrap();
        let reloaded = StateStore::load(&path);
        assert!(reloaded.has_resource("fresh"));
    }

    #[test]
    fn test_resources_filter_by_provider() {
        let (_dir, path) = scratch();
        let mut store = StateStore::load(&path);
        let mut a = Map::new();
        a.insert("provider".to_string(), json!("linode"));
        store.add_resource("a", a).unwrap();
        let mut b = Map::new();
        b.insert("provider".to_string(), json!("aws"));
        store.add_resource("b", b).unwrap();

        assert_eq!(store.resources(None).len(), 2);
        let linode = store.resources(Some("linode"));
        assert_eq!(linode.len(), 1);
        assert!(linode.contains_key("a"));
    }

    #[test]
    fn test_updated_at_advances() {
        let (_dir, path) = scratch();
        let mut store = StateStore::load(&path);
        store.add_resource("one", Map::new()).unwrap();
        let first: StateDocument =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        store.add_resource("two", Map::new()).unwrap();
        let second: StateDocument =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.created_at, first.created_at);
    }
}
