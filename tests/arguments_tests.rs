//! Argument resolution integration tests.

use ftl::dispatch::{deref, merge, ArgValue, ArgumentConfig, SymbolicRef};
use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};

fn host_vars() -> IndexMap<String, Value> {
    let mut vars = IndexMap::new();
    vars.insert("config".to_string(), json!({"src_dir": "/opt/app"}));
    vars
}

#[test]
fn refs_resolve_against_host_vars_with_overrides() {
    let mut config = ArgumentConfig::new();
    config.module_args.insert(
        "src".to_string(),
        ArgValue::Ref(SymbolicRef::parse("config.src_dir")),
    );
    config
        .module_args
        .insert("mode".to_string(), ArgValue::from("0755"));
    let mut h1 = Map::new();
    h1.insert("dest".to_string(), json!("/var/www"));
    config.host_args.insert("h1".to_string(), h1);

    let resolved = merge("h1", &host_vars(), &config).unwrap();
    assert_eq!(resolved["src"], json!("/opt/app"));
    assert_eq!(resolved["mode"], json!("0755"));
    assert_eq!(resolved["dest"], json!("/var/www"));
}

#[test]
fn host_override_always_wins() {
    let mut config = ArgumentConfig::new();
    config
        .module_args
        .insert("path".to_string(), ArgValue::from("/from/literal"));
    config.module_args.insert(
        "src".to_string(),
        ArgValue::Ref(SymbolicRef::parse("config.src_dir")),
    );
    let mut h1 = Map::new();
    h1.insert("path".to_string(), json!("/from/override"));
    h1.insert("src".to_string(), json!("/also/override"));
    config.host_args.insert("h1".to_string(), h1.clone());

    let resolved = merge("h1", &host_vars(), &config).unwrap();
    for key in h1.keys() {
        assert_eq!(resolved[key], h1[key], "override lost for '{key}'");
    }
}

#[test]
fn missing_ref_is_a_resolution_error() {
    let mut config = ArgumentConfig::new();
    config.module_args.insert(
        "src".to_string(),
        ArgValue::Ref(SymbolicRef::parse("config.missing")),
    );
    let err = merge("web1", &host_vars(), &config).unwrap_err();
    let text = err.to_string();
    assert!(text.contains("config.missing"));
    assert!(text.contains("web1"));
}

#[test]
fn deref_never_mutates_inputs() {
    let vars = host_vars();
    let snapshot = vars.clone();
    let r = SymbolicRef::new("config").field("src_dir");
    let value = deref(&vars, &r, "h1").unwrap();
    assert_eq!(value, json!("/opt/app"));
    assert_eq!(vars, snapshot);

    // Dereferencing twice yields the same value: evaluation is pure.
    assert_eq!(deref(&vars, &r, "h1").unwrap(), value);
}

#[test]
fn ref_builder_and_parse_agree() {
    let built = SymbolicRef::new("config")
        .field("app")
        .field("paths")
        .field("data");
    let parsed = SymbolicRef::parse("config.app.paths.data");
    assert_eq!(built, parsed);
    assert_eq!(built.dotted(), "config.app.paths.data");
}
