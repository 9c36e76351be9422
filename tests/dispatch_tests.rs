//! Classic module dispatch against the local connection.
//!
//! Shape-specific calling conventions are exercised with shell-script
//! modules carrying the detection markers, run under a /bin/sh interpreter
//! hint so no other runtime is required.

mod common;

use ftl::automation::AutomationContext;
use ftl::inventory::Inventory;
use serde_json::json;
use std::path::{Path, PathBuf};

fn write_module(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
}

fn modules_dir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let modules = dir.path().join("modules");
    std::fs::create_dir_all(&modules).unwrap();

    // New-style marker: arguments arrive wrapped on stdin.
    write_module(
        &modules,
        "probe_new",
        "#!/bin/sh\n# AnsibleModule(\nif grep -q ANSIBLE_MODULE_ARGS; then\n  echo '{\"shape\": \"new_style\", \"wrapped\": true}'\nelse\n  echo '{\"shape\": \"new_style\", \"wrapped\": false}'\nfi\n",
    );

    // WANT_JSON marker: arguments arrive as a JSON file path argument.
    write_module(
        &modules,
        "probe_want",
        "#!/bin/sh\n# WANT_JSON\nif grep -q '\"mode\"' \"$1\"; then\n  echo '{\"shape\": \"want_json\", \"got_args\": true}'\nelse\n  echo '{\"shape\": \"want_json\", \"got_args\": false}'\nfi\n",
    );

    // No marker: old-style key=value args file.
    write_module(
        &modules,
        "probe_old",
        "#!/bin/sh\nif grep -q 'mode=0755' \"$1\"; then\n  echo '{\"shape\": \"old_style\", \"got_args\": true}'\nelse\n  echo '{\"shape\": \"old_style\", \"got_args\": false}'\nfi\n",
    );

    // Emits no JSON at all.
    write_module(&modules, "noisy", "#!/bin/sh\necho plain text output\n");

    // Emits no JSON and fails.
    write_module(&modules, "crasher", "#!/bin/sh\necho broken >&2\nexit 3\n");

    (dir, modules)
}

fn context(scratch: &tempfile::TempDir, modules: &Path) -> AutomationContext {
    let inventory = Inventory::from_yaml(
        r#"
control:
  hosts:
    ctl:
      ansible_connection: local
      ansible_python_interpreter: /bin/sh
"#,
    )
    .unwrap();

    AutomationContext::builder()
        .inventory(inventory)
        .module_dir(modules)
        .cache_dir(scratch.path().join("cache"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn new_style_gets_wrapped_json_on_stdin() {
    let (scratch, modules) = modules_dir();
    let ctx = context(&scratch, &modules);

    let results = ctx
        .target("ctl")
        .module("probe_new")
        .arg("mode", "0755")
        .call()
        .await
        .unwrap();
    let result = &results[0];
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output["shape"], json!("new_style"));
    assert_eq!(result.output["wrapped"], json!(true));

    ctx.close().await.unwrap();
}

#[tokio::test]
async fn want_json_gets_args_file_path() {
    let (scratch, modules) = modules_dir();
    let ctx = context(&scratch, &modules);

    let results = ctx
        .target("ctl")
        .module("probe_want")
        .arg("mode", "0755")
        .call()
        .await
        .unwrap();
    let result = &results[0];
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output["got_args"], json!(true));

    ctx.close().await.unwrap();
}

#[tokio::test]
async fn old_style_gets_key_value_file() {
    let (scratch, modules) = modules_dir();
    let ctx = context(&scratch, &modules);

    let results = ctx
        .target("ctl")
        .module("probe_old")
        .arg("mode", "0755")
        .call()
        .await
        .unwrap();
    let result = &results[0];
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output["got_args"], json!(true));

    ctx.close().await.unwrap();
}

#[tokio::test]
async fn non_json_stdout_is_wrapped_without_error() {
    let (scratch, modules) = modules_dir();
    let ctx = context(&scratch, &modules);

    let results = ctx.target("ctl").module("noisy").call().await.unwrap();
    let result = &results[0];
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output["stdout"], json!("plain text output\n"));

    ctx.close().await.unwrap();
}

#[tokio::test]
async fn non_json_nonzero_exit_is_a_crash() {
    let (scratch, modules) = modules_dir();
    let ctx = context(&scratch, &modules);

    let results = ctx.target("ctl").module("crasher").call().await.unwrap();
    let result = &results[0];
    assert!(!result.success);
    let error = result.error.as_deref().unwrap();
    assert!(error.contains("crashed"), "unexpected error: {error}");
    assert!(error.contains("broken"));

    ctx.close().await.unwrap();
}

#[tokio::test]
async fn unknown_module_reports_search_paths() {
    let (scratch, modules) = modules_dir();
    let ctx = context(&scratch, &modules);

    let results = ctx
        .target("ctl")
        .module("does_not_exist")
        .call()
        .await
        .unwrap();
    let result = &results[0];
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("not found"));

    ctx.close().await.unwrap();
}

#[tokio::test]
async fn excluded_module_is_refused() {
    let (scratch, modules) = modules_dir();
    let ctx = context(&scratch, &modules);

    let results = ctx
        .target("ctl")
        .module("async_status")
        .call()
        .await
        .unwrap();
    let result = &results[0];
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("excluded"));

    ctx.close().await.unwrap();
}
