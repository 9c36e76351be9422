//! End-to-end automation context scenarios.

mod common;

use common::CaptureSink;
use ftl::automation::AutomationContext;
use ftl::connection::ConnectionConfig;
use ftl::events::Event;
use ftl::inventory::Inventory;
use ftl::retry::RetryPolicy;
use serde_json::json;
use std::time::Duration;

fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(50),
        factor: 2.0,
        jitter: 0.0,
    }
}

/// Local ping on an empty inventory: `{"ping": "pong"}`, unchanged.
#[tokio::test]
async fn local_ping_returns_pong() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = AutomationContext::builder()
        .cache_dir(dir.path().join("cache"))
        .build()
        .unwrap();

    let results = ctx.target("localhost").ping().await.unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert!(result.success, "ping failed: {:?}", result.error);
    assert!(!result.changed);
    assert_eq!(result.output["ping"], json!("pong"));

    ctx.close().await.unwrap();
}

/// A destructive command without an override is refused before any dispatch.
#[tokio::test]
async fn destructive_command_requires_override() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = AutomationContext::builder()
        .cache_dir(dir.path().join("cache"))
        .build()
        .unwrap();

    let results = ctx
        .target("localhost")
        .module("command")
        .arg("cmd", "rm -rf /etc")
        .call()
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    let error = results[0].error.as_deref().unwrap();
    assert!(
        error.contains("Destructive") || error.contains("allow_destructive"),
        "unexpected error: {error}"
    );

    ctx.close().await.unwrap();
}

/// Blocked constructs are refused even with the destructive override set.
#[tokio::test]
async fn blocked_command_ignores_override() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = AutomationContext::builder()
        .cache_dir(dir.path().join("cache"))
        .allow_destructive(true)
        .build()
        .unwrap();

    let results = ctx
        .target("localhost")
        .module("command")
        .arg("cmd", "rm -rf /")
        .call()
        .await
        .unwrap();

    assert!(!results[0].success);
    assert!(results[0].error.as_deref().unwrap().contains("blocked"));

    ctx.close().await.unwrap();
}

/// Fan-out over a group with one unreachable host: both hosts report, each
/// in its own failure domain, and the final summary counts one failure.
#[tokio::test]
async fn fan_out_with_one_unreachable_host() {
    let inventory = Inventory::from_yaml(
        r#"
web:
  hosts:
    a:
      ansible_connection: local
    b:
      ansible_host: 192.0.2.1
      ansible_user: test
      ansible_ssh_pass: secret
"#,
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let sink = CaptureSink::new();
    let ctx = AutomationContext::builder()
        .inventory(inventory)
        .cache_dir(dir.path().join("cache"))
        .retry(quick_retry())
        .connection(ConnectionConfig {
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .sink(sink.clone())
        .build()
        .unwrap();

    let results = ctx.run_module("web", "ping", Default::default()).await.unwrap();
    assert_eq!(results.len(), 2);

    let a = results.iter().find(|r| r.host == "a").unwrap();
    let b = results.iter().find(|r| r.host == "b").unwrap();
    assert!(a.success, "local host should pong: {:?}", a.error);
    let b_error = b.error.as_deref().unwrap().to_lowercase();
    assert!(!b.success);
    assert!(
        b_error.contains("timeout") || b_error.contains("unreachable") || b_error.contains("refused"),
        "expected a transport failure, got: {b_error}"
    );

    // The unreachable host retried at least once.
    assert!(sink.count(|e| matches!(e, Event::HostRetry { host, .. } if host == "b")) >= 1);

    let summary = ctx.close().await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.failed, 1);

    // execution_complete fires exactly once, carrying the failure count.
    let completes: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::ExecutionComplete { .. }))
        .collect();
    assert_eq!(completes.len(), 1);
    if let Event::ExecutionComplete { failed, total, .. } = &completes[0] {
        assert_eq!(*failed, 1);
        assert_eq!(*total, 2);
    }

    // Closing again emits nothing further.
    ctx.close().await.unwrap();
    assert_eq!(
        sink.count(|e| matches!(e, Event::ExecutionComplete { .. })),
        1
    );
}

/// Module timeouts fail without being retried.
#[tokio::test]
async fn module_timeout_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let sink = CaptureSink::new();
    let ctx = AutomationContext::builder()
        .cache_dir(dir.path().join("cache"))
        .module_timeout(Duration::from_millis(200))
        .retry(quick_retry())
        .sink(sink.clone())
        .build()
        .unwrap();

    let results = ctx
        .target("localhost")
        .module("command")
        .arg("cmd", "sleep 5")
        .call()
        .await
        .unwrap();

    assert!(!results[0].success);
    assert_eq!(sink.count(|e| matches!(e, Event::HostRetry { .. })), 0);

    ctx.close().await.unwrap();
}

/// A synthetic results check: accumulator filters by host and module.
#[tokio::test]
async fn results_accumulate_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = AutomationContext::builder()
        .cache_dir(dir.path().join("cache"))
        .build()
        .unwrap();

    ctx.target("localhost").ping().await.unwrap();
    ctx.target("localhost")
        .module("command")
        .arg("cmd", "true")
        .call()
        .await
        .unwrap();

    assert_eq!(ctx.results().len(), 2);
    assert!(!ctx.results().failed());
    assert_eq!(ctx.results().for_module("ping").len(), 1);
    assert_eq!(ctx.results().for_host("localhost").len(), 2);

    ctx.close().await.unwrap();
}
