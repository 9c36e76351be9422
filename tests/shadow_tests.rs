//! Native shadow action tests against localhost.

mod common;

use ftl::automation::AutomationContext;
use ftl::inventory::Inventory;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

fn context(dir: &tempfile::TempDir) -> AutomationContext {
    AutomationContext::builder()
        .cache_dir(dir.path().join("cache"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn copy_content_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&dir);
    let dest = dir.path().join("out/config.txt");
    let dest_str = dest.to_string_lossy().to_string();

    // First write changes the target.
    let results = ctx
        .target("localhost")
        .copy()
        .arg("content", "listen 8080\n")
        .arg("dest", dest_str.as_str())
        .call()
        .await
        .unwrap();
    assert!(results[0].success, "{:?}", results[0].error);
    assert_eq!(results[0].changed, true);
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "listen 8080\n");

    // Same bytes again: nothing to do.
    let results = ctx
        .target("localhost")
        .copy()
        .arg("content", "listen 8080\n")
        .arg("dest", dest_str.as_str())
        .call()
        .await
        .unwrap();
    assert!(results[0].success);
    assert_eq!(results[0].changed, false);
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "listen 8080\n");

    ctx.close().await.unwrap();
}

#[tokio::test]
async fn copy_applies_mode() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&dir);
    let dest = dir.path().join("script.sh");

    let results = ctx
        .target("localhost")
        .copy()
        .arg("content", "#!/bin/sh\nexit 0\n")
        .arg("dest", dest.to_string_lossy().as_ref())
        .arg("mode", "0755")
        .call()
        .await
        .unwrap();
    assert!(results[0].success, "{:?}", results[0].error);

    let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);

    ctx.close().await.unwrap();
}

#[tokio::test]
async fn copy_requires_dest() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&dir);

    let results = ctx
        .target("localhost")
        .copy()
        .arg("content", "x")
        .call()
        .await
        .unwrap();
    assert!(!results[0].success);
    assert!(results[0].error.as_deref().unwrap().contains("dest"));

    ctx.close().await.unwrap();
}

#[tokio::test]
async fn template_renders_with_vars() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&dir);

    let src = dir.path().join("motd.j2");
    std::fs::write(&src, "Welcome to {{ app_name }} on {{ ansible_host }}\n").unwrap();
    let dest = dir.path().join("motd");

    let results = ctx
        .target("localhost")
        .template()
        .arg("src", src.to_string_lossy().as_ref())
        .arg("dest", dest.to_string_lossy().as_ref())
        .arg("vars", json!({"app_name": "ftl"}))
        .call()
        .await
        .unwrap();
    assert!(results[0].success, "{:?}", results[0].error);

    let rendered = std::fs::read_to_string(&dest).unwrap();
    assert_eq!(rendered, "Welcome to ftl on 127.0.0.1\n");

    ctx.close().await.unwrap();
}

#[tokio::test]
async fn fetch_lays_out_per_host_tree() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&dir);

    let src = dir.path().join("remote.log");
    std::fs::write(&src, "log line\n").unwrap();
    let dest_root = dir.path().join("fetched");

    let results = ctx
        .target("localhost")
        .fetch()
        .arg("src", src.to_string_lossy().as_ref())
        .arg("dest", dest_root.to_string_lossy().as_ref())
        .call()
        .await
        .unwrap();
    assert!(results[0].success, "{:?}", results[0].error);

    // dest/<host>/<src with leading slash stripped>
    let expected = dest_root
        .join("localhost")
        .join(src.to_string_lossy().trim_start_matches('/'));
    assert_eq!(std::fs::read_to_string(&expected).unwrap(), "log line\n");

    ctx.close().await.unwrap();
}

#[tokio::test]
async fn fetch_flat_writes_dest_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&dir);

    let src = dir.path().join("remote.log");
    std::fs::write(&src, "flat\n").unwrap();
    let dest = dir.path().join("local-copy.log");

    let results = ctx
        .target("localhost")
        .fetch()
        .arg("src", src.to_string_lossy().as_ref())
        .arg("dest", dest.to_string_lossy().as_ref())
        .arg("flat", Value::Bool(true))
        .call()
        .await
        .unwrap();
    assert!(results[0].success);
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "flat\n");

    ctx.close().await.unwrap();
}

#[tokio::test]
async fn wait_for_connection_respects_delay_and_timeout() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let inventory = Inventory::from_yaml(&format!(
        r#"
svc:
  hosts:
    open-host:
      ansible_host: 127.0.0.1
      ansible_port: {port}
      ansible_connection: local
"#
    ))
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let ctx = AutomationContext::builder()
        .inventory(inventory)
        .cache_dir(dir.path().join("cache"))
        .build()
        .unwrap();

    // Reachable port: returns after at least the initial delay.
    let start = Instant::now();
    let results = ctx
        .target("open-host")
        .wait_for_connection(5, 1)
        .await
        .unwrap();
    let elapsed = start.elapsed();
    assert!(results[0].success, "{:?}", results[0].error);
    assert_eq!(results[0].changed, false);
    assert!(elapsed >= Duration::from_secs(1), "returned before delay");
    assert!(elapsed < Duration::from_secs(7), "exceeded upper bound");
    assert!(results[0].output.contains_key("elapsed"));

    ctx.close().await.unwrap();
}

#[tokio::test]
async fn wait_for_connection_times_out_on_closed_port() {
    // Bind then drop to find a port that refuses connections.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let inventory = Inventory::from_yaml(&format!(
        r#"
svc:
  hosts:
    closed-host:
      ansible_host: 127.0.0.1
      ansible_port: {port}
      ansible_connection: local
"#
    ))
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let ctx = AutomationContext::builder()
        .inventory(inventory)
        .cache_dir(dir.path().join("cache"))
        .build()
        .unwrap();

    let start = Instant::now();
    let results = ctx
        .target("closed-host")
        .module("wait_for_connection")
        .arg("timeout", Value::from(1))
        .arg("sleep", Value::from(1))
        .call()
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert!(!results[0].success);
    assert!(results[0]
        .error
        .as_deref()
        .unwrap()
        .contains("not reachable"));
    // Bounded: delay(0) + timeout(1) + sleep(1) plus scheduling slack.
    assert!(elapsed < Duration::from_secs(4));

    ctx.close().await.unwrap();
}
