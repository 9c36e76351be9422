//! Error types for FTL.
//!
//! This module defines the top-level error type used throughout FTL. Each
//! subsystem (codec, connection, gate, state) has its own focused error enum;
//! everything converges here for callers that work at the crate surface.

use std::path::PathBuf;
use thiserror::Error;

use crate::codec::CodecError;
use crate::connection::ConnectionError;
use crate::gate::GateError;
use crate::state::StateError;

/// Result type alias for FTL operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for FTL.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Any failure in the SSH/local transport layer.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Failure encoding or decoding a gate protocol frame.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The gate replied with a message the protocol does not allow here.
    #[error("Unexpected gate message '{got}' (expected {expected})")]
    UnexpectedMessage {
        /// Message type name that arrived
        got: String,
        /// What the session was waiting for
        expected: String,
    },

    // ========================================================================
    // Gate Errors
    // ========================================================================
    /// Failure building, staging, or running a gate archive.
    #[error(transparent)]
    Gate(#[from] GateError),

    // ========================================================================
    // Dispatch Errors
    // ========================================================================
    /// Module could not be resolved against the search roots.
    #[error("Module '{name}' not found (searched {searched:?})")]
    ModuleNotFound {
        /// Requested module name
        name: String,
        /// Directories that were searched
        searched: Vec<PathBuf>,
    },

    /// Module is on the exclusion list.
    #[error("Module '{name}' is excluded: {reason}")]
    ExcludedModule {
        /// Excluded module name
        name: String,
        /// Why the module is excluded
        reason: String,
    },

    /// A symbolic reference failed to resolve against host variables.
    #[error("Failed to resolve reference '{path}' for host '{host}'")]
    ResolutionFailed {
        /// Dotted path that missed
        path: String,
        /// Host whose variables were searched
        host: String,
    },

    /// A shadow action was invoked with arguments that violate its contract.
    #[error("Invalid arguments for native action '{action}': {message}")]
    ShadowActionContract {
        /// Shadow action name
        action: String,
        /// What was wrong
        message: String,
    },

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// Module did not produce a result within the allotted time.
    #[error("Module '{module}' timed out on host '{host}' after {timeout_secs} seconds")]
    ModuleTimeout {
        /// Module name
        module: String,
        /// Target host
        host: String,
        /// Timeout in seconds
        timeout_secs: u64,
    },

    /// Module self-reported failure (`failed: true` in its result).
    #[error("Module '{module}' failed on host '{host}': {message}")]
    ModuleFailed {
        /// Module name
        module: String,
        /// Target host
        host: String,
        /// Error message from the module
        message: String,
    },

    /// Module produced no JSON and exited non-zero.
    #[error("Module '{module}' crashed on host '{host}' (exit {exit_code}): {stderr}")]
    ModuleCrash {
        /// Module name
        module: String,
        /// Target host
        host: String,
        /// Process exit code
        exit_code: i32,
        /// Captured stderr
        stderr: String,
    },

    // ========================================================================
    // Safety Errors
    // ========================================================================
    /// Command matched an always-blocked pattern.
    #[error("Command blocked for safety: {reason}")]
    Blocked {
        /// Which pattern matched
        reason: String,
    },

    /// Command matched a destructive pattern and no override was given.
    #[error("Destructive command detected ({warnings:?}); pass allow_destructive to run it")]
    DestructiveRequiresOverride {
        /// Matched pattern descriptions
        warnings: Vec<String>,
    },

    /// Pre-flight validation of a host's connection settings failed.
    #[error("Pre-flight check failed for host '{host}': {message}")]
    Preflight {
        /// Host that failed validation
        host: String,
        /// What was missing or wrong
        message: String,
    },

    // ========================================================================
    // Persistence Errors
    // ========================================================================
    /// State file could not be written.
    #[error(transparent)]
    State(#[from] StateError),

    /// Inventory file could not be parsed.
    #[error("Failed to parse inventory '{path}': {message}")]
    InventoryParse {
        /// Path to the inventory file
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Host not found in inventory.
    #[error("Host or group '{0}' not found in inventory")]
    TargetNotFound(String),

    // ========================================================================
    // Other Errors
    // ========================================================================
    /// Configuration is invalid or incomplete.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Template rendering error.
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),
}

impl Error {
    /// Creates a resolution failure for a missed symbolic reference.
    pub fn resolution_failed(path: impl Into<String>, host: impl Into<String>) -> Self {
        Self::ResolutionFailed {
            path: path.into(),
            host: host.into(),
        }
    }

    /// Creates a shadow action contract violation.
    pub fn shadow_contract(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ShadowActionContract {
            action: action.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error is transient and worth retrying.
    ///
    /// Only transport-level failures before a request was accepted qualify;
    /// module-reported failures and timeouts are never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connection(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Returns the process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::InventoryParse { .. } | Error::Preflight { .. } => 2,
            _ => 1,
        }
    }
}
