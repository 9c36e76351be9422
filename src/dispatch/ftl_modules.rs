//! FTL-native module registry.
//!
//! FTL-native modules run in-process on the controller for local targets and
//! ship a portable source to the gate for remote targets. They skip the
//! subprocess-per-task cost of classic modules entirely.

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use crate::safety;

/// Portable source for the `command` module, shipped to gates.
pub const COMMAND_SOURCE: &str = include_str!("ftl_modules/command.py");

/// Portable source for the `pip` module, shipped to gates.
pub const PIP_SOURCE: &str = include_str!("ftl_modules/pip.py");

/// Modules the engine refuses to dispatch, with an explanation.
///
/// Async task plumbing assumes Ansible's fork-per-task runner; a persistent
/// gate makes it meaningless.
const EXCLUDED: &[(&str, &str)] = &[
    (
        "async_status",
        "async task plumbing is not supported; gates keep a live session instead",
    ),
    (
        "async_wrapper",
        "async task plumbing is not supported; gates keep a live session instead",
    ),
];

/// Why a module may not be dispatched, if it is excluded.
pub fn excluded_reason(name: &str) -> Option<&'static str> {
    let short = name.rsplit('.').next().unwrap_or(name);
    EXCLUDED
        .iter()
        .find(|(excluded, _)| *excluded == short)
        .map(|(_, reason)| *reason)
}

type LocalFn = for<'a> fn(&'a Map<String, Value>) -> BoxFuture<'a, Value>;

/// An FTL-native module: an in-process function plus its portable source.
pub struct FtlModule {
    /// Short module name.
    pub name: &'static str,
    /// In-process implementation for local targets.
    pub local: LocalFn,
    /// Source shipped base64-encoded in `FTLModule` frames for remote
    /// targets.
    pub remote_source: &'static str,
}

/// The built-in FTL-native modules.
static REGISTRY: &[FtlModule] = &[
    FtlModule {
        name: "command",
        local: |args| Box::pin(run_command(args)),
        remote_source: COMMAND_SOURCE,
    },
    FtlModule {
        name: "pip",
        local: |args| Box::pin(run_pip(args)),
        remote_source: PIP_SOURCE,
    },
];

/// Look up an FTL-native module by short name or `ftl.builtin.<name>` FQCN.
pub fn get(name: &str) -> Option<&'static FtlModule> {
    let short = name.strip_prefix("ftl.builtin.").unwrap_or(name);
    if short.contains('.') {
        // Some other collection's FQCN; never ours.
        return None;
    }
    REGISTRY.iter().find(|m| m.name == short)
}

/// Names of all registered FTL-native modules.
pub fn names() -> Vec<&'static str> {
    REGISTRY.iter().map(|m| m.name).collect()
}

fn string_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

/// Run a shell command on the controller.
async fn run_command(args: &Map<String, Value>) -> Value {
    let Some(cmd) = string_arg(args, "cmd").or_else(|| string_arg(args, "_raw_params")) else {
        return json!({"failed": true, "msg": "cmd is required"});
    };

    // The same scan the dispatcher applies also guards direct invocation.
    let check = safety::check_command(cmd);
    if let Some(reason) = check.blocked {
        return json!({"failed": true, "msg": format!("command blocked for safety: {reason}")});
    }

    let mut builder = tokio::process::Command::new("sh");
    builder.arg("-c").arg(cmd).kill_on_drop(true);
    if let Some(chdir) = string_arg(args, "chdir") {
        builder.current_dir(chdir);
    }

    match builder.output().await {
        Ok(output) => {
            let rc = output.status.code().unwrap_or(-1);
            json!({
                "cmd": cmd,
                "rc": rc,
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr),
                "changed": true,
                "failed": rc != 0,
            })
        }
        Err(e) => json!({"failed": true, "msg": format!("failed to spawn: {e}")}),
    }
}

/// Install or remove Python packages with pip on the controller.
async fn run_pip(args: &Map<String, Value>) -> Value {
    let names: Vec<String> = match args.get("name") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => return json!({"failed": true, "msg": "name is required"}),
    };
    let state = string_arg(args, "state").unwrap_or("present");
    let executable = string_arg(args, "executable").unwrap_or("python3");

    let mut builder = tokio::process::Command::new(executable);
    builder.arg("-m").arg("pip");
    if state == "absent" {
        builder.arg("uninstall").arg("-y");
    } else {
        builder.arg("install");
    }
    builder.args(&names);

    match builder.output().await {
        Ok(output) => {
            let rc = output.status.code().unwrap_or(-1);
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let changed = stdout.contains("Successfully installed")
                || stdout.contains("Successfully uninstalled");
            json!({
                "name": names,
                "state": state,
                "rc": rc,
                "stdout": stdout,
                "stderr": String::from_utf8_lossy(&output.stderr),
                "changed": changed,
                "failed": rc != 0,
            })
        }
        Err(e) => json!({"failed": true, "msg": format!("failed to spawn pip: {e}")}),
    }
}
