//! Module dispatch: classify, ship, invoke, synthesize.
//!
//! Given a host, a module name, and merged arguments, the dispatcher picks
//! the execution shape (native shadow action, FTL-native in-process, or a
//! classic module file), runs it locally or through a gate session, and
//! turns whatever came back into an [`ExecuteResult`].
//!
//! Transient transport failures retry with exponential backoff; failures a
//! module reports about itself never do. Each host is an independent
//! failure domain.

pub mod args;
pub mod ftl_modules;
pub mod shadow;
pub mod shape;

pub use args::{deref, merge, ArgValue, ArgumentConfig, SymbolicRef};
pub use shape::ModuleShape;

use base64::Engine;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::codec::{ErrorReply, FtlModuleRequest, Message, ModuleRequest};
use crate::connection::{ConnectionPool, ExecuteOptions, SharedConnection};
use crate::error::{Error, Result};
use crate::events::{Event, SharedSink};
use crate::gate::{find_module, GateBuildConfig, GateBuilder, GateSession};
use crate::inventory::Host;
use crate::retry::RetryPolicy;
use crate::safety;

/// Default fan-out width.
pub const DEFAULT_FORKS: usize = 10;

/// Hard ceiling on fan-out width.
pub const MAX_FORKS: usize = 100;

/// The outcome of one module execution on one host.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecuteResult {
    /// Host the module ran against.
    pub host: String,
    /// Module name as dispatched.
    pub module: String,
    /// Whether the execution succeeded.
    pub success: bool,
    /// Whether the module reported a change.
    pub changed: bool,
    /// The module's output mapping.
    pub output: Map<String, Value>,
    /// Error text when the execution failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecuteResult {
    /// Synthesize a result from a module's output mapping.
    ///
    /// The module failed only if it said so (`failed: true`); `changed`
    /// defaults to false.
    pub fn from_output(host: &str, module: &str, output: Map<String, Value>) -> Self {
        let failed = output
            .get("failed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let changed = output
            .get("changed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let error = failed.then(|| {
            output
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("module reported failure")
                .to_string()
        });
        Self {
            host: host.to_string(),
            module: module.to_string(),
            success: !failed,
            changed,
            output,
            error,
        }
    }

    /// A failed result carrying an error message.
    pub fn failure(host: &str, module: &str, error: impl Into<String>) -> Self {
        Self {
            host: host.to_string(),
            module: module.to_string(),
            success: false,
            changed: false,
            output: Map::new(),
            error: Some(error.into()),
        }
    }
}

/// Wrap non-JSON module stdout per the dispatch contract.
pub fn parse_module_stdout(stdout: &str) -> Map<String, Value> {
    let trimmed = stdout.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        return map;
    }
    // The first parseable JSON object line wins.
    for line in trimmed.lines() {
        let line = line.trim();
        if line.starts_with('{') {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(line) {
                return map;
            }
        }
    }
    let mut map = Map::new();
    map.insert("stdout".to_string(), Value::String(stdout.to_string()));
    map
}

/// Tunables for a dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Directories searched for classic module files.
    pub module_dirs: Vec<PathBuf>,
    /// Extra collection search roots (`ANSIBLE_COLLECTIONS_PATH` is added).
    pub collection_roots: Vec<PathBuf>,
    /// Controller-side gate cache directory.
    pub cache_dir: PathBuf,
    /// Retry policy for transient transport failures.
    pub retry: RetryPolicy,
    /// Allow destructive commands through the safety scan.
    pub allow_destructive: bool,
    /// Wall-clock cap per module execution.
    pub module_timeout: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            module_dirs: Vec::new(),
            collection_roots: Vec::new(),
            cache_dir: crate::gate::default_cache_dir(),
            retry: RetryPolicy::default(),
            allow_destructive: false,
            module_timeout: None,
        }
    }
}

/// Executes modules on hosts, owning gate sessions and the connection pool.
pub struct Dispatcher {
    config: DispatchConfig,
    pool: Arc<ConnectionPool>,
    builder: Arc<GateBuilder>,
    /// Sessions keyed by `host/gate-hash`, checked out while in use. The
    /// checkout itself enforces one request in flight per session.
    sessions: Mutex<HashMap<String, GateSession>>,
    /// One permit per host: dispatch within a host is serial by default.
    host_slots: parking_lot::Mutex<HashMap<String, Arc<Semaphore>>>,
    sink: SharedSink,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(config: DispatchConfig, pool: Arc<ConnectionPool>, sink: SharedSink) -> Self {
        let builder = Arc::new(GateBuilder::new(config.cache_dir.clone()));
        Self {
            config,
            pool,
            builder,
            sessions: Mutex::new(HashMap::new()),
            host_slots: parking_lot::Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// The connection pool this dispatcher draws from.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Per-host serialization permit.
    fn host_slot(&self, host: &str) -> Arc<Semaphore> {
        self.host_slots
            .lock()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Execute a module on one host: the full classification pipeline.
    pub async fn execute_module(
        &self,
        host: &Host,
        vars: &IndexMap<String, Value>,
        module_name: &str,
        module_args: Map<String, Value>,
    ) -> ExecuteResult {
        // Native shadow actions replace their classic counterparts outright.
        if shadow::is_shadowed(module_name) {
            let slot = self.host_slot(&host.name);
            let _permit = match slot.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    return ExecuteResult::failure(
                        &host.name,
                        module_name,
                        "host slot closed during shutdown",
                    )
                }
            };
            return shadow::run(self, host, vars, module_name, module_args).await;
        }

        if let Some(reason) = ftl_modules::excluded_reason(module_name) {
            return ExecuteResult::failure(
                &host.name,
                module_name,
                Error::ExcludedModule {
                    name: module_name.to_string(),
                    reason: reason.to_string(),
                }
                .to_string(),
            );
        }

        // Safety gate: refused executions never reach the wire.
        if let Err(e) =
            safety::check_module_args(module_name, &module_args, self.config.allow_destructive)
        {
            return ExecuteResult::failure(&host.name, module_name, e.to_string());
        }

        let slot = self.host_slot(&host.name);
        let _permit = match slot.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return ExecuteResult::failure(
                    &host.name,
                    module_name,
                    "host slot closed during shutdown",
                )
            }
        };
        self.dispatch_with_retry(host, module_name, module_args)
            .await
    }

    /// Retry loop around a single dispatch. Only transient transport errors
    /// retry; module-reported failures and timeouts do not.
    pub(crate) async fn dispatch_with_retry(
        &self,
        host: &Host,
        module_name: &str,
        module_args: Map<String, Value>,
    ) -> ExecuteResult {
        let policy = self.config.retry;
        let mut attempt = 1u32;

        loop {
            match self
                .dispatch_once(host, module_name, module_args.clone())
                .await
            {
                Ok(result) => return result,
                Err(e) if e.is_transient() && policy.should_retry(attempt) => {
                    self.sink.emit(&Event::HostRetry {
                        timestamp: crate::events::now(),
                        host: host.name.clone(),
                        attempt,
                        max_attempts: policy.max_attempts,
                        error: e.to_string(),
                    });
                    let delay = policy.delay_after(attempt);
                    debug!(host = %host.name, attempt = %attempt, delay = ?delay, "Retrying after transient error");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return ExecuteResult::failure(
                        &host.name,
                        module_name,
                        describe_failure(&e, attempt, policy.max_attempts),
                    );
                }
            }
        }
    }

    /// One dispatch attempt with no retry handling.
    async fn dispatch_once(
        &self,
        host: &Host,
        module_name: &str,
        module_args: Map<String, Value>,
    ) -> Result<ExecuteResult> {
        if let Some(ftl) = ftl_modules::get(module_name) {
            if host.is_local() {
                let invocation = (ftl.local)(&module_args);
                let value = match self.config.module_timeout {
                    Some(timeout) => tokio::time::timeout(timeout, invocation)
                        .await
                        .map_err(|_| Error::ModuleTimeout {
                            module: module_name.to_string(),
                            host: host.name.clone(),
                            timeout_secs: timeout.as_secs(),
                        })?,
                    None => invocation.await,
                };
                let output = match value {
                    Value::Object(map) => map,
                    other => {
                        let mut map = Map::new();
                        map.insert("result".to_string(), other);
                        map
                    }
                };
                return Ok(ExecuteResult::from_output(&host.name, module_name, output));
            }
            return self
                .dispatch_ftl_remote(host, module_name, ftl.remote_source, module_args)
                .await;
        }

        let module_path = self.resolve_classic(module_name)?;

        if host.is_local() {
            return self
                .run_classic_local(host, module_name, &module_path, module_args)
                .await;
        }

        self.dispatch_classic_remote(host, module_name, &module_path, module_args)
            .await
    }

    /// Resolve a classic module name to a file: search roots first, then
    /// collection roots for fully qualified names.
    fn resolve_classic(&self, module_name: &str) -> Result<PathBuf> {
        if let Some(path) = find_module(&self.config.module_dirs, module_name) {
            return Ok(path);
        }

        let parts: Vec<&str> = module_name.split('.').collect();
        if parts.len() == 3 {
            let (ns, coll, name) = (parts[0], parts[1], parts[2]);
            let mut roots = self.config.collection_roots.clone();
            roots.extend(crate::gate::deps::collection_search_roots());
            for root in roots {
                let candidate = root
                    .join("ansible_collections")
                    .join(ns)
                    .join(coll)
                    .join("plugins")
                    .join("modules")
                    .join(format!("{name}.py"));
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }

        Err(Error::ModuleNotFound {
            name: module_name.to_string(),
            searched: self.config.module_dirs.clone(),
        })
    }

    // ========================================================================
    // Local execution
    // ========================================================================

    /// Run a classic module on the controller with its shape's calling
    /// convention.
    async fn run_classic_local(
        &self,
        host: &Host,
        module_name: &str,
        module_path: &std::path::Path,
        module_args: Map<String, Value>,
    ) -> Result<ExecuteResult> {
        let content = std::fs::read(module_path)?;
        let shape = ModuleShape::detect(&content);
        debug!(module = %module_name, shape = %shape, "Running classic module locally");

        let workdir = tempfile::tempdir()?;
        let interpreter = host.interpreter();
        let mut stdin: Option<Vec<u8>> = None;

        let command = match shape {
            ModuleShape::Binary => {
                let args_path = workdir.path().join("args.json");
                std::fs::write(&args_path, serde_json::to_vec(&module_args)?)?;
                format!(
                    "{} {}",
                    shell_words::quote(&module_path.to_string_lossy()),
                    shell_words::quote(&args_path.to_string_lossy())
                )
            }
            ModuleShape::NewStyle => {
                let wrapped = serde_json::json!({ "ANSIBLE_MODULE_ARGS": module_args });
                stdin = Some(serde_json::to_vec(&wrapped)?);
                format!(
                    "{} {}",
                    interpreter,
                    shell_words::quote(&module_path.to_string_lossy())
                )
            }
            ModuleShape::WantJson => {
                let args_path = workdir.path().join("args.json");
                std::fs::write(&args_path, serde_json::to_vec(&module_args)?)?;
                format!(
                    "{} {} {}",
                    interpreter,
                    shell_words::quote(&module_path.to_string_lossy()),
                    shell_words::quote(&args_path.to_string_lossy())
                )
            }
            ModuleShape::OldStyle => {
                let args_path = workdir.path().join("args");
                std::fs::write(&args_path, old_style_args(&module_args))?;
                format!(
                    "{} {} {}",
                    interpreter,
                    shell_words::quote(&module_path.to_string_lossy()),
                    shell_words::quote(&args_path.to_string_lossy())
                )
            }
        };

        let conn = self.pool.get(host).await?;
        let mut options = ExecuteOptions::new();
        if let Some(input) = stdin {
            options = options.with_stdin(input);
        }
        if let Some(timeout) = self.config.module_timeout {
            options = options.with_timeout(timeout);
        }

        let result = conn.execute(&command, options).await.map_err(|e| {
            if e.kind == crate::connection::ConnectionErrorKind::Timeout {
                Error::ModuleTimeout {
                    module: module_name.to_string(),
                    host: host.name.clone(),
                    timeout_secs: self
                        .config
                        .module_timeout
                        .map(|t| t.as_secs())
                        .unwrap_or(0),
                }
            } else {
                Error::Connection(e)
            }
        })?;

        // Incremental events ride on stderr as JSON lines; the rest is log
        // text.
        let (module_events, stderr_text) =
            crate::events::parse_module_events(&host.name, &result.stderr);
        for event in &module_events {
            self.sink.emit(event);
        }

        let trimmed = result.stdout.trim();
        let has_json = trimmed.starts_with('{')
            || trimmed.lines().any(|l| {
                serde_json::from_str::<Value>(l.trim())
                    .map(|v| v.is_object())
                    .unwrap_or(false)
            });
        if !has_json && !result.success() {
            return Err(Error::ModuleCrash {
                module: module_name.to_string(),
                host: host.name.clone(),
                exit_code: result.exit_code,
                stderr: stderr_text,
            });
        }

        let output = parse_module_stdout(&result.stdout);
        Ok(ExecuteResult::from_output(&host.name, module_name, output))
    }

    // ========================================================================
    // Remote execution
    // ========================================================================

    /// Run an FTL-native module on a remote host through a gate session.
    async fn dispatch_ftl_remote(
        &self,
        host: &Host,
        module_name: &str,
        source: &str,
        module_args: Map<String, Value>,
    ) -> Result<ExecuteResult> {
        let request = Message::FtlModule(FtlModuleRequest {
            module_name: module_name.to_string(),
            module: base64::engine::general_purpose::STANDARD.encode(source),
            module_args,
        });
        let mut gate_config = GateBuildConfig::new(Vec::new(), Vec::new());
        gate_config.interpreter = host.interpreter().to_string();
        let reply = self.round_trip(host, gate_config, request).await?;
        self.interpret_reply(host, module_name, reply)
    }

    /// Run a classic module on a remote host through a gate session.
    ///
    /// Modules resolvable on the configured search roots are bundled into the
    /// gate (covered by its content hash); anything else ships inline.
    async fn dispatch_classic_remote(
        &self,
        host: &Host,
        module_name: &str,
        module_path: &std::path::Path,
        module_args: Map<String, Value>,
    ) -> Result<ExecuteResult> {
        let bundled = find_module(&self.config.module_dirs, module_name).is_some();
        let mut gate_config = GateBuildConfig::new(
            if bundled {
                vec![module_name.to_string()]
            } else {
                Vec::new()
            },
            self.config.module_dirs.clone(),
        );
        gate_config.interpreter = host.interpreter().to_string();

        let inline = if bundled {
            None
        } else {
            let bytes = std::fs::read(module_path)?;
            Some(base64::engine::general_purpose::STANDARD.encode(bytes))
        };

        let request = Message::Module(ModuleRequest {
            module_name: module_name.to_string(),
            module: inline,
            module_args,
        });
        let reply = self.round_trip(host, gate_config, request).await?;
        self.interpret_reply(host, module_name, reply)
    }

    /// Turn a gate reply into a result or error.
    fn interpret_reply(
        &self,
        host: &Host,
        module_name: &str,
        reply: Message,
    ) -> Result<ExecuteResult> {
        match reply {
            Message::ModuleResult { stdout, stderr } => {
                let (module_events, stderr_text) =
                    crate::events::parse_module_events(&host.name, &stderr);
                for event in &module_events {
                    self.sink.emit(event);
                }
                let mut output = parse_module_stdout(&stdout);
                if !stderr_text.trim().is_empty() && !output.contains_key("stderr") {
                    output.insert("stderr".to_string(), Value::String(stderr_text));
                }
                Ok(ExecuteResult::from_output(&host.name, module_name, output))
            }
            Message::FtlModuleResult { result } => {
                let output = match result {
                    Value::Object(map) => map,
                    other => {
                        let mut map = Map::new();
                        map.insert("result".to_string(), other);
                        map
                    }
                };
                Ok(ExecuteResult::from_output(&host.name, module_name, output))
            }
            Message::ModuleNotFound { message } => Err(Error::ModuleNotFound {
                name: format!("{module_name} ({message})"),
                searched: self.config.module_dirs.clone(),
            }),
            Message::Error(ErrorReply { message, .. }) => Ok(ExecuteResult::failure(
                &host.name,
                module_name,
                message,
            )),
            Message::GateSystemError(ErrorReply { message, .. }) => Ok(ExecuteResult::failure(
                &host.name,
                module_name,
                format!("gate system error: {message}"),
            )),
            other => Err(Error::UnexpectedMessage {
                got: other.kind().to_string(),
                expected: "a result frame".to_string(),
            }),
        }
    }

    /// Check out (or create) a session for `(host, gate-hash)`, send one
    /// request, and return the session to its slot if it stayed healthy.
    async fn round_trip(
        &self,
        host: &Host,
        gate_config: GateBuildConfig,
        request: Message,
    ) -> Result<Message> {
        let builder = self.builder.clone();
        let config_for_build = gate_config.clone();
        // Archive assembly and hashing are CPU + disk work.
        let gate = tokio::task::spawn_blocking(move || builder.build(&config_for_build))
            .await
            .map_err(|e| Error::Config(format!("gate build task failed: {e}")))??;

        let key = format!("{}/{}", host.name, gate.hash);
        let mut session = {
            let existing = self.sessions.lock().await.remove(&key);
            match existing {
                Some(session) if session.is_ready() => session,
                _ => self.open_session(host, &gate).await?,
            }
        };

        let module_name = match &request {
            Message::Module(req) => req.module_name.clone(),
            Message::FtlModule(req) => req.module_name.clone(),
            _ => String::new(),
        };

        let reply = match self.config.module_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, session.call(request)).await {
                Ok(reply) => reply,
                Err(_) => {
                    // An abandoned request poisons the session; it is never
                    // returned to the slot.
                    session.poison();
                    warn!(host = %host.name, "Module timed out; session poisoned");
                    return Err(Error::ModuleTimeout {
                        module: module_name,
                        host: host.name.clone(),
                        timeout_secs: timeout.as_secs(),
                    });
                }
            },
            None => session.call(request).await,
        };

        if session.is_ready() {
            self.sessions.lock().await.insert(key, session);
        }
        reply
    }

    /// Stage the gate archive on the host if absent, spawn it, handshake.
    async fn open_session(
        &self,
        host: &Host,
        gate: &crate::gate::BuiltGate,
    ) -> Result<GateSession> {
        let conn: SharedConnection = self.pool.get(host).await?;

        let remote_dir = PathBuf::from(".ftl");
        let remote_path = remote_dir.join(format!("gate_{}.pyz", gate.hash));

        if !conn.path_exists(&remote_path).await.unwrap_or(false) {
            debug!(host = %host.name, path = %remote_path.display(), "Staging gate archive");
            let bytes = tokio::fs::read(&gate.path).await?;
            conn.mkdirs(&remote_dir).await?;
            conn.upload_content(&bytes, &remote_path).await?;
            conn.chmod(&remote_path, 0o700).await?;
        }

        let command = format!(
            "{} {}",
            host.interpreter(),
            shell_words::quote(&remote_path.to_string_lossy())
        );
        GateSession::spawn(conn, &command, host.name.clone(), gate.hash.clone()).await
    }

    /// Drain every live session with a shutdown grace period, then close the
    /// connection pool.
    pub async fn close(&self, grace: Duration) {
        let sessions: Vec<GateSession> = {
            let mut map = self.sessions.lock().await;
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            let host = session.host().to_string();
            if tokio::time::timeout(grace, session.shutdown()).await.is_err() {
                warn!(host = %host, "Session did not shut down within grace; force-closing");
            }
        }
        self.pool.close_all().await;
    }
}

/// Render one error into the user-visible failure text, attempt counts and
/// suggestions included.
fn describe_failure(error: &Error, attempt: u32, max_attempts: u32) -> String {
    let mut text = error.to_string();
    if let Error::Connection(ce) = error {
        if ce.is_transient() {
            text.push_str(&format!(" (attempt {attempt}/{max_attempts})"));
        }
        for suggestion in ce.suggestions() {
            text.push_str(&format!("\n  hint: {suggestion}"));
        }
    }
    text
}

/// Format arguments for an old-style module: space-separated `key=value`.
fn old_style_args(args: &Map<String, Value>) -> String {
    args.iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k}={s}"),
            other => format!("{k}={other}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
