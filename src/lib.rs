//! # FTL - Fleet Automation Through Persistent Gates
//!
//! FTL executes Ansible-compatible automation modules across an inventory of
//! hosts. Instead of forking an interpreter per task, it ships a
//! self-contained agent archive (a "gate") to each target once, keeps it
//! alive, and exchanges length-prefixed JSON frames with it over SSH. Many
//! targets run concurrently from a single controller under a bounded
//! fan-out.
//!
//! ## Core Concepts
//!
//! - **Inventory**: hosts and groups with layered variables
//! - **Gate**: a content-addressed executable archive hosting the protocol
//!   loop and bundled modules on the target
//! - **Gate session**: a live SSH connection paired with a spawned gate
//!   process, strictly one request in flight
//! - **Module dispatch**: shape detection (native shadow, FTL-native,
//!   classic binary/new-style/want-json/old-style) and invocation
//! - **Automation context**: the scope owning inventory, state, results,
//!   and events
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use ftl::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> ftl::Result<()> {
//!     let ctx = AutomationContext::builder()
//!         .inventory_file("inventory.yml")
//!         .forks(10)
//!         .build()?;
//!
//!     let results = ctx.target("webservers").ping().await?;
//!     for result in &results {
//!         println!("{}: {}", result.host, if result.success { "pong" } else { "failed" });
//!     }
//!
//!     ctx.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod prelude {
    //! Convenient re-exports of the commonly used types.

    pub use crate::automation::{AutomationContext, ContextBuilder, NewHost, Results, RunSummary, Target};
    pub use crate::codec::{GateCodec, Message};
    pub use crate::connection::{Connection, ConnectionConfig, ConnectionPool};
    pub use crate::dispatch::{ArgValue, ArgumentConfig, ExecuteResult, SymbolicRef};
    pub use crate::error::{Error, Result};
    pub use crate::events::{Event, EventSink, NdjsonSink, NullSink, TextSink};
    pub use crate::gate::{GateBuildConfig, GateBuilder, GateSession};
    pub use crate::inventory::{Group, Host, Inventory};
    pub use crate::retry::RetryPolicy;
    pub use crate::state::StateStore;
}

/// Error types and result aliases.
pub mod error;

/// Framed message codec for the controller ↔ gate protocol.
pub mod codec;

/// Retry policy for transient transport failures.
pub mod retry;

/// Destructive-command detection and pre-flight validation.
pub mod safety;

/// Structured event streaming during fan-out.
pub mod events;

/// Persistent state for dynamic hosts and provisioned resources.
pub mod state;

/// Host and group inventory management.
pub mod inventory;

/// Transport layer: SSH (russh) and local execution, pooled.
pub mod connection;

/// Gate building, caching, and sessions.
pub mod gate;

/// Module dispatch: classification, shipping, invocation, results.
pub mod dispatch;

/// The automation context and its user-facing proxies.
pub mod automation;

pub use error::{Error, Result};

/// Returns the current version of FTL.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
