//! Argument merging and symbolic reference resolution.
//!
//! Module arguments may contain symbolic references: deferred lookups of a
//! head name plus a chain of field accesses, evaluated against a host's
//! variable mapping at dispatch time. Merge precedence, low to high:
//! literal module args, dereferenced refs, host-specific overrides.

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A deferred lookup: head name plus a chain of field accesses.
///
/// A ref never mutates anything; evaluation is a pure function of the
/// variable mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolicRef {
    /// First variable name looked up.
    pub head: String,
    /// Field accesses applied in order.
    pub path: Vec<String>,
}

impl SymbolicRef {
    /// A ref to a top-level variable.
    pub fn new(head: impl Into<String>) -> Self {
        Self {
            head: head.into(),
            path: Vec::new(),
        }
    }

    /// Parse a dotted path: `ref("config.app.paths")`.
    pub fn parse(dotted: &str) -> Self {
        let mut parts = dotted.split('.');
        let head = parts.next().unwrap_or_default().to_string();
        Self {
            head,
            path: parts.map(str::to_string).collect(),
        }
    }

    /// Extend the access chain by one field.
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.path.push(name.into());
        self
    }

    /// The full dotted path for error messages.
    pub fn dotted(&self) -> String {
        let mut out = self.head.clone();
        for part in &self.path {
            out.push('.');
            out.push_str(part);
        }
        out
    }
}

impl std::fmt::Display for SymbolicRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dotted())
    }
}

/// An argument value: a literal, or a ref resolved at dispatch time.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// A plain JSON value passed through untouched.
    Literal(Value),
    /// A symbolic reference dereferenced against host variables.
    Ref(SymbolicRef),
}

impl From<Value> for ArgValue {
    fn from(value: Value) -> Self {
        ArgValue::Literal(value)
    }
}

impl From<SymbolicRef> for ArgValue {
    fn from(r: SymbolicRef) -> Self {
        ArgValue::Ref(r)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Literal(Value::String(value.to_string()))
    }
}

/// Base module arguments plus host-specific overrides.
#[derive(Debug, Clone, Default)]
pub struct ArgumentConfig {
    /// Arguments for every host; values may be refs.
    pub module_args: IndexMap<String, ArgValue>,
    /// Per-host overrides, highest precedence.
    pub host_args: IndexMap<String, Map<String, Value>>,
}

impl ArgumentConfig {
    /// Empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any base argument is a ref.
    pub fn has_refs(&self) -> bool {
        self.module_args
            .values()
            .any(|v| matches!(v, ArgValue::Ref(_)))
    }
}

/// Dereference a symbolic ref against a variable mapping.
///
/// Pure: neither input is mutated. A missing link errors with the full
/// dotted path.
pub fn deref(
    vars: &IndexMap<String, Value>,
    r: &SymbolicRef,
    host: &str,
) -> Result<Value> {
    let mut current = vars
        .get(&r.head)
        .ok_or_else(|| Error::resolution_failed(r.dotted(), host))?;

    for part in &r.path {
        current = current
            .as_object()
            .and_then(|obj| obj.get(part))
            .ok_or_else(|| Error::resolution_failed(r.dotted(), host))?;
    }

    Ok(current.clone())
}

/// Merge base arguments with host-specific overrides for one host.
///
/// Fast path: no refs and no overrides returns the literals as-is.
pub fn merge(
    host: &str,
    vars: &IndexMap<String, Value>,
    config: &ArgumentConfig,
) -> Result<Map<String, Value>> {
    let host_overrides = config.host_args.get(host);

    let mut merged = Map::new();
    for (key, value) in &config.module_args {
        let resolved = match value {
            ArgValue::Literal(v) => v.clone(),
            ArgValue::Ref(r) => deref(vars, r, host)?,
        };
        merged.insert(key.clone(), resolved);
    }

    if let Some(overrides) = host_overrides {
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
    }

    Ok(merged)
}
