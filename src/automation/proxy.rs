//! Target and module call proxies.
//!
//! The user-facing surface is a small builder DSL: `ctx.target("webservers")`
//! returns an immutable [`Target`] handle, `.module("file")` (or a dotted
//! fully qualified name) returns a [`ModuleCall`] that accumulates arguments
//! and dispatches on `.call()`. Names are resolved against the inventory at
//! call time, host-first with dash/underscore normalization; anything the
//! inventory does not know is treated as a module namespace for localhost.

use serde_json::Value;

use super::AutomationContext;
use crate::dispatch::{ArgValue, ArgumentConfig, ExecuteResult, SymbolicRef};
use crate::error::Result;

/// A host or group handle; shadow actions hang off it as methods.
pub struct Target<'a> {
    ctx: &'a AutomationContext,
    target: String,
}

impl<'a> Target<'a> {
    pub(super) fn new(ctx: &'a AutomationContext, target: impl Into<String>) -> Self {
        Self {
            ctx,
            target: target.into(),
        }
    }

    /// The target name this handle dispatches to.
    pub fn name(&self) -> &str {
        &self.target
    }

    /// Start a module call against this target. `name` may be short or a
    /// fully qualified `ns.coll.name`.
    pub fn module(&self, name: impl Into<String>) -> ModuleCall<'a> {
        ModuleCall {
            ctx: self.ctx,
            target: self.target.clone(),
            module: name.into(),
            args: ArgumentConfig::new(),
        }
    }

    /// Test the full execution pipeline; pong comes from the target.
    pub async fn ping(&self) -> Result<Vec<ExecuteResult>> {
        self.module("ping").call().await
    }

    /// Copy controller-side content or a file to the target.
    pub fn copy(&self) -> ModuleCall<'a> {
        self.module("copy")
    }

    /// Render a template controller-side and copy the result out.
    pub fn template(&self) -> ModuleCall<'a> {
        self.module("template")
    }

    /// Fetch a remote file back to the controller.
    pub fn fetch(&self) -> ModuleCall<'a> {
        self.module("fetch")
    }

    /// Wait for the target's TCP port to accept connections.
    pub async fn wait_for_connection(
        &self,
        timeout_secs: u64,
        delay_secs: u64,
    ) -> Result<Vec<ExecuteResult>> {
        self.module("wait_for_connection")
            .arg("timeout", Value::from(timeout_secs))
            .arg("delay", Value::from(delay_secs))
            .call()
            .await
    }
}

/// A pending module invocation: target + module + accumulated arguments.
pub struct ModuleCall<'a> {
    ctx: &'a AutomationContext,
    target: String,
    module: String,
    args: ArgumentConfig,
}

impl ModuleCall<'_> {
    /// Extend the module path by one dotted component (FQCN traversal).
    pub fn namespace(mut self, component: impl AsRef<str>) -> Self {
        self.module.push('.');
        self.module.push_str(component.as_ref());
        self
    }

    /// Add an argument: a literal value or a symbolic ref.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.args.module_args.insert(key.into(), value.into());
        self
    }

    /// Add a symbolic reference argument from a dotted path.
    pub fn arg_ref(mut self, key: impl Into<String>, dotted: &str) -> Self {
        self.args
            .module_args
            .insert(key.into(), ArgValue::Ref(SymbolicRef::parse(dotted)));
        self
    }

    /// Add a host-specific override, highest precedence.
    pub fn host_arg(
        mut self,
        host: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        self.args
            .host_args
            .entry(host.into())
            .or_default()
            .insert(key.into(), value);
        self
    }

    /// Dispatch to every host the target resolves to.
    pub async fn call(self) -> Result<Vec<ExecuteResult>> {
        self.ctx.run_module(&self.target, &self.module, self.args).await
    }
}
