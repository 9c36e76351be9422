//! Safety checks: destructive-command detection and pre-flight validation.
//!
//! Command-like modules are scanned before any bytes leave the controller.
//! Blocked constructs are always refused; destructive constructs are refused
//! unless the caller set an explicit override. Operations confined to scratch
//! paths are exempt from the destructive class.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::Error;
use crate::inventory::{ConnectionKind, Host};

/// Patterns that are always blocked; an override cannot run these.
static BLOCKED_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"\brm\s+-rf\s+/\s*$",
            "rm -rf / (would destroy entire filesystem)",
        ),
        (
            r"\brm\s+-rf\s+/\*",
            "rm -rf /* (would destroy entire filesystem)",
        ),
        (r":\s*\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}", "fork bomb"),
        (
            r"\bdd\s+.*of=/dev/[sh]d[a-z]\b",
            "dd writing to raw disk device",
        ),
    ]
    .into_iter()
    .map(|(p, d)| (Regex::new(&format!("(?i){p}")).expect("invalid blocked pattern"), d))
    .collect()
});

/// Patterns that indicate destructive commands; require an explicit override.
static DESTRUCTIVE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"\brm\s+(-[rfR]+|--force|--recursive)",
            "rm with force/recursive flags",
        ),
        (r"\brm\s+.*\s+-[rfR]", "rm with force/recursive flags"),
        (r"\brmdir\b", "rmdir command"),
        (r"\bdd\s+", "dd command (can overwrite disks)"),
        (r"\bmkfs\b", "mkfs command (formats filesystem)"),
        (r">\s*/", "redirect overwriting file"),
        (r">\s*~", "redirect overwriting file in home"),
        (r"\bkillall\b", "killall command"),
        (r"\bpkill\s+-9", "pkill with SIGKILL"),
        (
            r"\b(shutdown|reboot|halt|poweroff)\b",
            "system shutdown/reboot command",
        ),
        (
            r"\bchmod\s+(-R|--recursive)\s+.*\s+/",
            "recursive chmod on system path",
        ),
        (
            r"\bchown\s+(-R|--recursive)\s+.*\s+/",
            "recursive chown on system path",
        ),
        (r"\bDROP\s+(DATABASE|TABLE|SCHEMA)\b", "SQL DROP command"),
        (r"\bdocker\s+(rm|rmi)\s+.*-f", "docker force remove"),
        (r"\bdocker\s+system\s+prune", "docker system prune"),
        (
            r"\bgit\s+(reset\s+--hard|clean\s+-f|push\s+.*--force)",
            "destructive git command",
        ),
        (r"\biptables\s+-F", "iptables flush"),
        (
            r"\bsystemctl\s+(stop|disable)\s+(sshd|ssh|network)",
            "stopping critical system service",
        ),
    ]
    .into_iter()
    .map(|(p, d)| {
        (
            Regex::new(&format!("(?i){p}")).expect("invalid destructive pattern"),
            d,
        )
    })
    .collect()
});

/// Scratch prefixes exempt from the destructive class.
const SAFE_PATHS: &[&str] = &["/tmp/", "/var/tmp/", "/dev/shm/"];

/// Module names whose arguments carry a shell command to scan.
const COMMAND_MODULES: &[&str] = &["shell", "command", "script"];

/// Outcome of scanning one command string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SafetyCheck {
    /// Reason the command is blocked outright, if any.
    pub blocked: Option<String>,
    /// Destructive-pattern descriptions that matched.
    pub warnings: Vec<String>,
}

impl SafetyCheck {
    /// True when nothing matched at all.
    pub fn is_safe(&self) -> bool {
        self.blocked.is_none() && self.warnings.is_empty()
    }
}

fn touches_only_scratch(cmd: &str) -> bool {
    SAFE_PATHS.iter().any(|p| cmd.contains(p))
}

/// Scan a shell command for blocked and destructive constructs.
pub fn check_command(cmd: &str) -> SafetyCheck {
    let normalized = cmd.trim();
    let mut result = SafetyCheck::default();

    for (pattern, reason) in BLOCKED_PATTERNS.iter() {
        if pattern.is_match(normalized) {
            result.blocked = Some((*reason).to_string());
            return result;
        }
    }

    for (pattern, description) in DESTRUCTIVE_PATTERNS.iter() {
        if pattern.is_match(normalized) && !touches_only_scratch(normalized) {
            result.warnings.push((*description).to_string());
        }
    }

    result
}

/// Extract the command string a command-like module was asked to run.
fn command_arg(args: &Map<String, Value>) -> Option<&str> {
    args.get("cmd")
        .or_else(|| args.get("_raw_params"))
        .and_then(Value::as_str)
}

/// Validate module arguments before dispatch.
///
/// Returns `Ok(())` when the execution may proceed. Blocked constructs fail
/// regardless of `allow_destructive`; destructive constructs fail unless it
/// is set.
pub fn check_module_args(
    module_name: &str,
    args: &Map<String, Value>,
    allow_destructive: bool,
) -> Result<(), Error> {
    if !COMMAND_MODULES.contains(&module_name) {
        return Ok(());
    }
    let Some(cmd) = command_arg(args) else {
        return Ok(());
    };

    let check = check_command(cmd);
    if let Some(reason) = check.blocked {
        return Err(Error::Blocked { reason });
    }
    if !check.warnings.is_empty() && !allow_destructive {
        return Err(Error::DestructiveRequiresOverride {
            warnings: check.warnings,
        });
    }
    Ok(())
}

/// Pre-flight validation of a host's connection settings.
///
/// SSH hosts must have a password or at least one existing private key file;
/// a key file named explicitly must exist.
pub fn preflight_host(host: &Host) -> Result<(), Error> {
    if host.connection != ConnectionKind::Ssh {
        return Ok(());
    }

    if let Some(key_file) = &host.private_key_file {
        let expanded = shellexpand::tilde(key_file);
        if !std::path::Path::new(expanded.as_ref()).exists() {
            return Err(Error::Preflight {
                host: host.name.clone(),
                message: format!("private key file '{key_file}' does not exist"),
            });
        }
        return Ok(());
    }

    if host.password.is_some() {
        return Ok(());
    }

    if crate::connection::config::default_identity_files()
        .iter()
        .any(|p| p.exists())
    {
        return Ok(());
    }

    Err(Error::Preflight {
        host: host.name.clone(),
        message: "no password configured and no SSH private key found".to_string(),
    })
}
