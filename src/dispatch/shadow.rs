//! Native shadow actions.
//!
//! Some actions must run controller-side because they read local files
//! (`copy`, `template` sources) or write to the controller (`fetch`). These
//! transparently replace the classic modules of the same name, keeping the
//! same argument names. `ping` and `wait_for_connection` are native because
//! they exercise the pipeline itself rather than the target's tooling.

use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use super::{Dispatcher, ExecuteResult};
use crate::connection::SharedConnection;
use crate::error::Error;
use crate::inventory::Host;

/// Actions shadowed by native implementations.
const SHADOWED: &[&str] = &["copy", "template", "fetch", "ping", "wait_for_connection"];

/// Whether a module name is shadowed (short or `ansible.builtin.` form).
pub fn is_shadowed(name: &str) -> bool {
    let short = name.strip_prefix("ansible.builtin.").unwrap_or(name);
    !short.contains('.') && SHADOWED.contains(&short)
}

/// Run a shadow action on one host.
pub async fn run(
    dispatcher: &Dispatcher,
    host: &Host,
    vars: &IndexMap<String, Value>,
    name: &str,
    args: Map<String, Value>,
) -> ExecuteResult {
    let short = name.strip_prefix("ansible.builtin.").unwrap_or(name);
    let outcome = match short {
        "copy" => copy(dispatcher, host, &args).await,
        "template" => template(dispatcher, host, vars, &args).await,
        "fetch" => fetch(dispatcher, host, &args).await,
        "ping" => ping(dispatcher, host).await,
        "wait_for_connection" => wait_for_connection(host, &args).await,
        _ => unreachable!("not a shadow action: {name}"),
    };

    match outcome {
        Ok(output) => ExecuteResult::from_output(&host.name, short, output),
        Err(e) => ExecuteResult::failure(&host.name, short, e.to_string()),
    }
}

fn get_str<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

/// Accept `"0644"`, `"644"`, or a number for a file mode.
fn parse_mode(value: &Value) -> Option<u32> {
    match value {
        Value::String(s) => u32::from_str_radix(s, 8).ok(),
        Value::Number(n) => n.as_u64().map(|v| v as u32),
        _ => None,
    }
}

// ============================================================================
// copy / template
// ============================================================================

/// The copy contract: idempotent content write with temp-path + atomic
/// rename, `mode`/`owner`/`group` applied before the rename lands.
async fn apply_copy(
    conn: &SharedConnection,
    dest: &Path,
    content: &[u8],
    args: &Map<String, Value>,
) -> Result<Map<String, Value>, Error> {
    // Idempotence by byte read-back: equal bytes mean nothing to do.
    if conn.path_exists(dest).await.unwrap_or(false) {
        if let Ok(existing) = conn.download_content(dest).await {
            if existing == content {
                let mut output = Map::new();
                output.insert("changed".to_string(), json!(false));
                output.insert("dest".to_string(), json!(dest.to_string_lossy()));
                return Ok(output);
            }
        }
    }

    let tmp = PathBuf::from(format!("{}.ftl.tmp", dest.to_string_lossy()));
    conn.upload_content(content, &tmp).await?;

    if let Some(mode) = args.get("mode").and_then(parse_mode) {
        conn.chmod(&tmp, mode).await?;
    }
    let owner = get_str(args, "owner");
    let group = get_str(args, "group");
    if owner.is_some() || group.is_some() {
        conn.chown(&tmp, owner, group).await?;
    }

    conn.rename(&tmp, dest).await?;

    let mut output = Map::new();
    output.insert("changed".to_string(), json!(true));
    output.insert("dest".to_string(), json!(dest.to_string_lossy()));
    output.insert("size".to_string(), json!(content.len()));
    Ok(output)
}

/// `copy`: write `content` or the bytes of a controller-side `src` to `dest`.
async fn copy(
    dispatcher: &Dispatcher,
    host: &Host,
    args: &Map<String, Value>,
) -> Result<Map<String, Value>, Error> {
    let dest = get_str(args, "dest")
        .ok_or_else(|| Error::shadow_contract("copy", "dest is required"))?;

    let content: Vec<u8> = match (get_str(args, "src"), get_str(args, "content")) {
        (Some(src), None) => std::fs::read(src)
            .map_err(|e| Error::shadow_contract("copy", format!("cannot read src '{src}': {e}")))?,
        (None, Some(content)) => content.as_bytes().to_vec(),
        (Some(_), Some(_)) => {
            return Err(Error::shadow_contract(
                "copy",
                "src and content are mutually exclusive",
            ))
        }
        (None, None) => {
            return Err(Error::shadow_contract("copy", "src or content is required"))
        }
    };

    let conn = dispatcher.pool().get(host).await?;
    apply_copy(&conn, Path::new(dest), &content, args).await
}

/// `template`: render a controller-side source and apply the copy contract
/// with the rendered bytes.
async fn template(
    dispatcher: &Dispatcher,
    host: &Host,
    vars: &IndexMap<String, Value>,
    args: &Map<String, Value>,
) -> Result<Map<String, Value>, Error> {
    let src = get_str(args, "src")
        .ok_or_else(|| Error::shadow_contract("template", "src is required"))?;
    let dest = get_str(args, "dest")
        .ok_or_else(|| Error::shadow_contract("template", "dest is required"))?;

    let source = std::fs::read_to_string(src).map_err(|e| {
        Error::shadow_contract("template", format!("cannot read src '{src}': {e}"))
    })?;

    // Host variables are in scope, with caller-provided `vars` on top.
    let mut context = serde_json::Map::new();
    for (k, v) in vars {
        context.insert(k.clone(), v.clone());
    }
    if let Some(Value::Object(extra)) = args.get("vars") {
        for (k, v) in extra {
            context.insert(k.clone(), v.clone());
        }
    }

    let mut env = minijinja::Environment::new();
    env.add_template("inline", &source)?;
    let rendered = env
        .get_template("inline")
        .expect("template registered above")
        .render(Value::Object(context))?;

    debug!(host = %host.name, src = %src, dest = %dest, "Rendered template");
    let conn = dispatcher.pool().get(host).await?;
    apply_copy(&conn, Path::new(dest), rendered.as_bytes(), args).await
}

// ============================================================================
// fetch
// ============================================================================

/// `fetch`: read remote `src` and write it controller-side.
///
/// With `flat=true` the bytes land at `dest` exactly; otherwise at
/// `dest/<host>/<src with its leading slash stripped>`.
async fn fetch(
    dispatcher: &Dispatcher,
    host: &Host,
    args: &Map<String, Value>,
) -> Result<Map<String, Value>, Error> {
    let src = get_str(args, "src")
        .ok_or_else(|| Error::shadow_contract("fetch", "src is required"))?;
    let dest = get_str(args, "dest")
        .ok_or_else(|| Error::shadow_contract("fetch", "dest is required"))?;
    let flat = args.get("flat").and_then(Value::as_bool).unwrap_or(false);

    let conn = dispatcher.pool().get(host).await?;
    let content = conn.download_content(Path::new(src)).await?;

    let local_path = if flat {
        PathBuf::from(dest)
    } else {
        let normalized = src.trim_start_matches('/');
        PathBuf::from(dest).join(&host.name).join(normalized)
    };

    if let Some(parent) = local_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let changed = match std::fs::read(&local_path) {
        Ok(existing) => existing != content,
        Err(_) => true,
    };
    if changed {
        std::fs::write(&local_path, &content)?;
    }

    let mut output = Map::new();
    output.insert("changed".to_string(), json!(changed));
    output.insert("dest".to_string(), json!(local_path.to_string_lossy()));
    output.insert("src".to_string(), json!(src));
    Ok(output)
}

// ============================================================================
// ping / wait_for_connection
// ============================================================================

/// `ping`: run `echo pong` through the full dispatch stack.
///
/// Unlike a transport-level check, a pong here proves TCP, auth, gate
/// staging, and round-trip framing all work.
async fn ping(dispatcher: &Dispatcher, host: &Host) -> Result<Map<String, Value>, Error> {
    let mut args = Map::new();
    args.insert("cmd".to_string(), json!("echo pong"));

    let result = dispatcher.dispatch_with_retry(host, "command", args).await;
    if !result.success {
        return Err(Error::ModuleFailed {
            module: "ping".to_string(),
            host: host.name.clone(),
            message: result
                .error
                .unwrap_or_else(|| "no response from target".to_string()),
        });
    }

    let stdout = result
        .output
        .get("stdout")
        .and_then(Value::as_str)
        .unwrap_or("");
    if stdout.trim() == "pong" {
        let mut output = Map::new();
        output.insert("ping".to_string(), json!("pong"));
        output.insert("changed".to_string(), json!(false));
        Ok(output)
    } else {
        Err(Error::ModuleFailed {
            module: "ping".to_string(),
            host: host.name.clone(),
            message: format!("unexpected response '{}'", stdout.trim()),
        })
    }
}

/// `wait_for_connection`: poll TCP connect to the host's address and port.
async fn wait_for_connection(
    host: &Host,
    args: &Map<String, Value>,
) -> Result<Map<String, Value>, Error> {
    let timeout = args
        .get("timeout")
        .and_then(Value::as_u64)
        .unwrap_or(600);
    let delay = args.get("delay").and_then(Value::as_u64).unwrap_or(0);
    let sleep = args.get("sleep").and_then(Value::as_u64).unwrap_or(1);
    let connect_timeout = args
        .get("connect_timeout")
        .and_then(Value::as_u64)
        .unwrap_or(5);

    let address = host.address().to_string();
    let port = host.port;

    if delay > 0 {
        tokio::time::sleep(Duration::from_secs(delay)).await;
    }

    let start = std::time::Instant::now();
    loop {
        let attempt = tokio::time::timeout(
            Duration::from_secs(connect_timeout),
            TcpStream::connect((address.as_str(), port)),
        )
        .await;

        if let Ok(Ok(stream)) = attempt {
            drop(stream);
            let mut output = Map::new();
            output.insert(
                "elapsed".to_string(),
                json!(start.elapsed().as_secs()),
            );
            output.insert("changed".to_string(), json!(false));
            return Ok(output);
        }

        if start.elapsed() >= Duration::from_secs(timeout) {
            return Err(Error::ModuleFailed {
                module: "wait_for_connection".to_string(),
                host: host.name.clone(),
                message: format!("{address}:{port} not reachable after {timeout} seconds"),
            });
        }
        tokio::time::sleep(Duration::from_secs(sleep)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_shadowed() {
        assert!(is_shadowed("copy"));
        assert!(is_shadowed("ansible.builtin.copy"));
        assert!(is_shadowed("ping"));
        assert!(is_shadowed("wait_for_connection"));
        assert!(!is_shadowed("file"));
        assert!(!is_shadowed("amazon.aws.copy"));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode(&json!("0755")), Some(0o755));
        assert_eq!(parse_mode(&json!("644")), Some(0o644));
        assert_eq!(parse_mode(&json!(420)), Some(420));
        assert_eq!(parse_mode(&json!(true)), None);
    }
}
