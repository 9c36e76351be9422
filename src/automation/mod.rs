//! The automation context: the scope that owns everything.
//!
//! A context owns an inventory, an optional state store, the gate cache, a
//! results accumulator, and a progress sink. Entry (`build`) establishes
//! resources and merges persisted hosts into the inventory; exit (`close`)
//! drains in-flight gate sessions, closes the connection pool, and emits a
//! final `execution_complete` event exactly once.

pub mod proxy;
pub mod results;

pub use proxy::{ModuleCall, Target};
pub use results::{Results, RunSummary};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::connection::{ConnectionConfig, ConnectionPool};
use crate::dispatch::{
    self, ArgumentConfig, DispatchConfig, Dispatcher, ExecuteResult, DEFAULT_FORKS, MAX_FORKS,
};
use crate::error::{Error, Result};
use crate::events::{Event, NullSink, SharedSink};
use crate::inventory::{Group, Host, Inventory};
use crate::retry::RetryPolicy;
use crate::safety;
use crate::state::{HostRecord, StateError, StateStore};

/// Grace period for draining sessions on exit.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Configures and constructs an [`AutomationContext`].
pub struct ContextBuilder {
    inventory: Option<Inventory>,
    inventory_path: Option<PathBuf>,
    state_path: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    module_dirs: Vec<PathBuf>,
    forks: usize,
    sink: Option<SharedSink>,
    allow_destructive: bool,
    retry: RetryPolicy,
    module_timeout: Option<Duration>,
    connection: ConnectionConfig,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            inventory: None,
            inventory_path: None,
            state_path: None,
            cache_dir: None,
            module_dirs: Vec::new(),
            forks: DEFAULT_FORKS,
            sink: None,
            allow_destructive: false,
            retry: RetryPolicy::default(),
            module_timeout: None,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ContextBuilder {
    /// Use an already-constructed inventory.
    pub fn inventory(mut self, inventory: Inventory) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Load the inventory from a YAML file at build time.
    pub fn inventory_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.inventory_path = Some(path.into());
        self
    }

    /// Enable the persistent state store.
    pub fn state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Override the gate cache directory.
    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Add a classic module search directory.
    pub fn module_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.module_dirs.push(path.into());
        self
    }

    /// Fan-out width (clamped to 1..=100).
    pub fn forks(mut self, forks: usize) -> Self {
        self.forks = forks;
        self
    }

    /// Progress sink for execution events.
    pub fn sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Allow destructive commands through the safety scan.
    pub fn allow_destructive(mut self, allow: bool) -> Self {
        self.allow_destructive = allow;
        self
    }

    /// Retry policy for transient transport failures.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Wall-clock cap per module execution.
    pub fn module_timeout(mut self, timeout: Duration) -> Self {
        self.module_timeout = Some(timeout);
        self
    }

    /// Connection tunables.
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    /// Enter the context: load inventory, merge state, wire everything up.
    pub fn build(self) -> Result<AutomationContext> {
        let mut inventory = match (self.inventory, &self.inventory_path) {
            (Some(inv), _) => inv,
            (None, Some(path)) => Inventory::from_file(path)?,
            (None, None) => Inventory::new(),
        };

        let state = match &self.state_path {
            Some(path) => {
                let store = StateStore::load(path);
                merge_state_hosts(&mut inventory, &store);
                Some(parking_lot::Mutex::new(store))
            }
            None => None,
        };

        let forks = self.forks.clamp(1, MAX_FORKS);
        let sink: SharedSink = self.sink.unwrap_or_else(|| Arc::new(NullSink));
        let pool = Arc::new(ConnectionPool::new(self.connection));

        let dispatch_config = DispatchConfig {
            module_dirs: self.module_dirs,
            collection_roots: Vec::new(),
            cache_dir: self.cache_dir.unwrap_or_else(crate::gate::default_cache_dir),
            retry: self.retry,
            allow_destructive: self.allow_destructive,
            module_timeout: self.module_timeout,
        };
        let dispatcher = Arc::new(Dispatcher::new(dispatch_config, pool, sink.clone()));

        Ok(AutomationContext {
            inventory: RwLock::new(inventory),
            state,
            state_errors: parking_lot::Mutex::new(Vec::new()),
            dispatcher,
            results: Arc::new(Results::new()),
            sink,
            fan_out: Arc::new(Semaphore::new(forks)),
            started: Instant::now(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Merge persisted hosts into the inventory, creating groups as needed.
fn merge_state_hosts(inventory: &mut Inventory, store: &StateStore) {
    for (name, record) in store.host_records() {
        if inventory.get_host(name).is_some() {
            continue;
        }
        let mut host = Host::new(name.clone());
        host.address = record
            .get("address")
            .and_then(Value::as_str)
            .map(str::to_string);
        host.user = record.get("user").and_then(Value::as_str).map(str::to_string);
        host.port = record
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(22);
        for (k, v) in record {
            if !matches!(k.as_str(), "address" | "user" | "port" | "groups" | "added_at") {
                host.set_var(k.clone(), v.clone());
            }
        }
        let groups: Vec<String> = record
            .get("groups")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        inventory.add_host(host, &groups);
        debug!(host = %name, "Merged host from state");
    }
}

/// A host to register at runtime.
#[derive(Debug, Clone, Default)]
pub struct NewHost {
    /// Host name.
    pub name: String,
    /// Address to connect to; defaults to the name.
    pub address: Option<String>,
    /// SSH user.
    pub user: Option<String>,
    /// SSH port; 0 means the default of 22.
    pub port: u16,
    /// Groups to place the host in.
    pub groups: Vec<String>,
    /// Additional host variables.
    pub vars: Map<String, Value>,
}

impl NewHost {
    /// A new host entry with just a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// The user-facing façade over inventory, dispatch, state, and events.
pub struct AutomationContext {
    inventory: RwLock<Inventory>,
    state: Option<parking_lot::Mutex<StateStore>>,
    /// State write failures held for surfacing at exit; they never abort a
    /// run.
    state_errors: parking_lot::Mutex<Vec<StateError>>,
    dispatcher: Arc<Dispatcher>,
    results: Arc<Results>,
    sink: SharedSink,
    fan_out: Arc<Semaphore>,
    started: Instant,
    closed: AtomicBool,
}

impl AutomationContext {
    /// Start configuring a context.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// A handle for a host, group, or module namespace. Resolution happens
    /// at call time, host-first.
    pub fn target(&self, name: impl Into<String>) -> Target<'_> {
        Target::new(self, name)
    }

    /// Names of all inventory hosts.
    pub fn host_names(&self) -> Vec<String> {
        self.inventory
            .read()
            .hosts()
            .map(|h| h.name.clone())
            .collect()
    }

    /// Names of all inventory groups.
    pub fn group_names(&self) -> Vec<String> {
        self.inventory
            .read()
            .groups()
            .map(|g| g.name.clone())
            .collect()
    }

    /// Whether the inventory knows a host or group by this name.
    pub fn knows(&self, name: &str) -> bool {
        self.inventory.read().knows(name)
    }

    /// The accumulated results.
    pub fn results(&self) -> &Results {
        &self.results
    }

    /// Register a host at runtime, persisting it when state is enabled.
    pub fn add_host(&self, new: NewHost) -> Result<()> {
        let port = if new.port == 0 { 22 } else { new.port };

        let mut host = Host::new(new.name.clone());
        host.address = new.address.clone();
        host.user = new.user.clone();
        host.port = port;
        for (k, v) in &new.vars {
            host.set_var(k.clone(), v.clone());
        }
        self.inventory.write().add_host(host, &new.groups);

        if let Some(state) = &self.state {
            let record = HostRecord {
                address: new.address,
                user: new.user,
                port,
                groups: new.groups,
                extras: new.vars,
            };
            if let Err(e) = state.lock().add_host(&new.name, record) {
                warn!(host = %new.name, error = %e, "State write failed; run continues");
                self.state_errors.lock().push(e);
            }
        }
        Ok(())
    }

    /// Add a named group if absent.
    pub fn add_group(&self, name: impl Into<String>) {
        self.inventory.write().add_group(Group::new(name));
    }

    /// Record a provisioned resource, when state is enabled.
    pub fn add_resource(&self, name: &str, data: Map<String, Value>) {
        if let Some(state) = &self.state {
            if let Err(e) = state.lock().add_resource(name, data) {
                warn!(resource = %name, error = %e, "State write failed; run continues");
                self.state_errors.lock().push(e);
            }
        }
    }

    /// Shallow-merge a patch into a recorded resource.
    pub fn update_resource(&self, name: &str, patch: Map<String, Value>) -> bool {
        let Some(state) = &self.state else {
            return false;
        };
        match state.lock().update_resource(name, patch) {
            Ok(updated) => updated,
            Err(e) => {
                warn!(resource = %name, error = %e, "State write failed; run continues");
                self.state_errors.lock().push(e);
                true
            }
        }
    }

    /// Look up a state record, resources first.
    pub fn state_get(&self, name: &str) -> Option<Map<String, Value>> {
        self.state
            .as_ref()
            .and_then(|s| s.lock().get(name).cloned())
    }

    /// Whether a name exists in state.
    pub fn state_has(&self, name: &str) -> bool {
        self.state
            .as_ref()
            .map(|s| s.lock().has(name))
            .unwrap_or(false)
    }

    /// Execute a module on localhost and return its single result.
    pub async fn execute(&self, module: &str, args: Map<String, Value>) -> Result<ExecuteResult> {
        let mut config = ArgumentConfig::new();
        for (k, v) in args {
            config.module_args.insert(k, v.into());
        }
        let mut results = self.run_module("localhost", module, config).await?;
        if results.is_empty() {
            return Err(Error::TargetNotFound("localhost".to_string()));
        }
        Ok(results.remove(0))
    }

    /// Fan out a module over a target's hosts with bounded parallelism.
    ///
    /// Each host is an independent failure domain: per-host failures become
    /// failed results, never errors of the fan-out itself. Results come back
    /// in target order.
    pub async fn run_module(
        &self,
        target: &str,
        module: &str,
        args: ArgumentConfig,
    ) -> Result<Vec<ExecuteResult>> {
        // Resolve under the read lock, then release before any await.
        let host_vars: Vec<(Host, IndexMap<String, Value>)> = {
            let inventory = self.inventory.read();
            let hosts = inventory.resolve_target(target)?;
            hosts
                .into_iter()
                .map(|h| {
                    let vars = inventory.effective_vars(&h);
                    (h, vars)
                })
                .collect()
        };

        self.sink.emit(&Event::ExecutionStart {
            timestamp: crate::events::now(),
            target: target.to_string(),
            module: module.to_string(),
            host_count: host_vars.len(),
        });

        let args = Arc::new(args);
        let module = Arc::new(module.to_string());

        let mut handles = Vec::with_capacity(host_vars.len());
        for (host, vars) in host_vars {
            let dispatcher = self.dispatcher.clone();
            let results = self.results.clone();
            let sink = self.sink.clone();
            let fan_out = self.fan_out.clone();
            let args = args.clone();
            let module = module.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match fan_out.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return ExecuteResult::failure(
                            &host.name,
                            &module,
                            "fan-out closed during shutdown",
                        )
                    }
                };

                sink.emit(&Event::HostStart {
                    timestamp: crate::events::now(),
                    host: host.name.clone(),
                });

                let result = run_one_host(&dispatcher, &host, &vars, &module, &args).await;

                sink.emit(&Event::HostComplete {
                    timestamp: crate::events::now(),
                    host: host.name.clone(),
                    success: result.success,
                    changed: result.changed,
                });
                results.push(result.clone());
                result
            }));
        }

        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => out.push(result),
                Err(e) => {
                    // A cancelled host task ends cleanly; others continue.
                    warn!(error = %e, "Host task aborted");
                }
            }
        }
        Ok(out)
    }

    /// Exit the context: drain sessions, close the pool, emit the final
    /// summary event. Idempotent; only the first call does the work.
    pub async fn close(&self) -> Result<RunSummary> {
        let summary = self.results.summarize(self.started.elapsed());
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(summary);
        }

        self.dispatcher.close(CLOSE_GRACE).await;

        self.sink.emit(&Event::ExecutionComplete {
            timestamp: crate::events::now(),
            total: summary.total,
            successful: summary.successful,
            failed: summary.failed,
            duration_secs: summary.duration.as_secs_f64(),
        });

        let mut state_errors = self.state_errors.lock();
        if let Some(first) = state_errors.drain(..).next() {
            return Err(Error::State(first));
        }
        Ok(summary)
    }
}

/// Pre-flight, merge, dispatch: the per-host pipeline inside the fan-out.
async fn run_one_host(
    dispatcher: &Dispatcher,
    host: &Host,
    vars: &IndexMap<String, Value>,
    module: &str,
    args: &ArgumentConfig,
) -> ExecuteResult {
    if let Err(e) = safety::preflight_host(host) {
        return ExecuteResult::failure(&host.name, module, e.to_string());
    }

    let merged = match dispatch::merge(&host.name, vars, args) {
        Ok(merged) => merged,
        Err(e) => return ExecuteResult::failure(&host.name, module, e.to_string()),
    };

    dispatcher.execute_module(host, vars, module, merged).await
}
