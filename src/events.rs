//! Structured event streaming during fan-out.
//!
//! Events are emitted as a side effect of execution and never alter outcomes:
//! a sink that fails to write is logged once and then ignored. Ordering is
//! per-host causal (`host_start` precedes `host_complete` / `host_retry` for
//! the same host); events for different hosts interleave freely.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// A structured execution event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A fan-out over a target set has started.
    ExecutionStart {
        /// When the event was created
        timestamp: DateTime<Utc>,
        /// Target name as given by the caller
        target: String,
        /// Module being dispatched
        module: String,
        /// Number of hosts in the resolved target set
        host_count: usize,
    },

    /// Dispatch to one host has started.
    HostStart {
        /// When the event was created
        timestamp: DateTime<Utc>,
        /// Host name
        host: String,
    },

    /// Dispatch to one host has finished.
    HostComplete {
        /// When the event was created
        timestamp: DateTime<Utc>,
        /// Host name
        host: String,
        /// Whether the module succeeded
        success: bool,
        /// Whether the module reported a change
        changed: bool,
    },

    /// A transient failure is being retried on a host.
    HostRetry {
        /// When the event was created
        timestamp: DateTime<Utc>,
        /// Host name
        host: String,
        /// Attempt number that just failed (1-indexed)
        attempt: u32,
        /// Configured attempt cap
        max_attempts: u32,
        /// The transient error
        error: String,
    },

    /// The fan-out has completed and the summary is final.
    ExecutionComplete {
        /// When the event was created
        timestamp: DateTime<Utc>,
        /// Hosts dispatched
        total: usize,
        /// Hosts that succeeded
        successful: usize,
        /// Hosts that failed
        failed: usize,
        /// Wall-clock duration in seconds
        duration_secs: f64,
    },

    /// Incremental progress reported by a running module.
    ModuleProgress {
        /// When the event was created
        timestamp: DateTime<Utc>,
        /// Host the module is running on
        host: String,
        /// Progress percentage (0-100)
        percent: u8,
        /// Human-readable status message
        message: String,
    },

    /// Log line reported by a running module.
    ModuleLog {
        /// When the event was created
        timestamp: DateTime<Utc>,
        /// Host the module is running on
        host: String,
        /// Log level (debug, info, warning, error)
        level: String,
        /// Log message text
        message: String,
    },

    /// Raw output data streamed by a running module.
    ModuleData {
        /// When the event was created
        timestamp: DateTime<Utc>,
        /// Host the module is running on
        host: String,
        /// Stream identifier (stdout, stderr, or custom)
        stream: String,
        /// Data content
        data: String,
    },
}

impl Event {
    /// Host this event concerns, when it concerns one.
    pub fn host(&self) -> Option<&str> {
        match self {
            Event::HostStart { host, .. }
            | Event::HostComplete { host, .. }
            | Event::HostRetry { host, .. }
            | Event::ModuleProgress { host, .. }
            | Event::ModuleLog { host, .. }
            | Event::ModuleData { host, .. } => Some(host),
            _ => None,
        }
    }

    fn summary_line(&self) -> String {
        match self {
            Event::ExecutionStart {
                target,
                module,
                host_count,
                ..
            } => format!("START  {module} on {target} ({host_count} hosts)"),
            Event::HostStart { host, .. } => format!("HOST   {host} ..."),
            Event::HostComplete {
                host,
                success,
                changed,
                ..
            } => {
                let status = match (success, changed) {
                    (true, true) => "changed",
                    (true, false) => "ok",
                    (false, _) => "failed",
                };
                format!("HOST   {host} {status}")
            }
            Event::HostRetry {
                host,
                attempt,
                max_attempts,
                error,
                ..
            } => format!("RETRY  {host} attempt {attempt}/{max_attempts}: {error}"),
            Event::ExecutionComplete {
                total,
                successful,
                failed,
                duration_secs,
                ..
            } => format!(
                "DONE   total={total} ok={successful} failed={failed} in {duration_secs:.2}s"
            ),
            Event::ModuleProgress {
                host,
                percent,
                message,
                ..
            } => format!("PROG   {host} {percent}% {message}"),
            Event::ModuleLog {
                host,
                level,
                message,
                ..
            } => format!("LOG    {host} [{level}] {message}"),
            Event::ModuleData {
                host, stream, data, ..
            } => format!("DATA   {host} [{stream}] {data}"),
        }
    }
}

/// Sink for execution events.
///
/// Emission must not affect outcomes; implementations swallow their own
/// failures.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    fn emit(&self, event: &Event);
}

/// Shared, cloneable handle to a sink.
pub type SharedSink = Arc<dyn EventSink>;

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &Event) {}
}

/// Sink writing one human-readable line per event.
pub struct TextSink {
    writer: Mutex<Box<dyn Write + Send>>,
    failed: AtomicBool,
}

impl TextSink {
    /// Create a text sink over any writer.
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            failed: AtomicBool::new(false),
        }
    }

    /// Create a text sink over standard error.
    pub fn stderr() -> Self {
        Self::new(Box::new(std::io::stderr()))
    }
}

impl EventSink for TextSink {
    fn emit(&self, event: &Event) {
        let mut writer = self.writer.lock();
        if writeln!(writer, "{}", event.summary_line())
            .and_then(|_| writer.flush())
            .is_err()
            && !self.failed.swap(true, Ordering::Relaxed)
        {
            warn!("event sink write failed; further sink errors suppressed");
        }
    }
}

/// Sink writing one JSON document per line (NDJSON).
pub struct NdjsonSink {
    writer: Mutex<Box<dyn Write + Send>>,
    failed: AtomicBool,
}

impl NdjsonSink {
    /// Create an NDJSON sink over any writer.
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            failed: AtomicBool::new(false),
        }
    }

    /// Create an NDJSON sink over standard output.
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }
}

impl EventSink for NdjsonSink {
    fn emit(&self, event: &Event) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                if !self.failed.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, "event serialization failed; further sink errors suppressed");
                }
                return;
            }
        };
        let mut writer = self.writer.lock();
        if writeln!(writer, "{line}")
            .and_then(|_| writer.flush())
            .is_err()
            && !self.failed.swap(true, Ordering::Relaxed)
        {
            warn!("event sink write failed; further sink errors suppressed");
        }
    }
}

/// Timestamp helper used by event constructors.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Split module stderr into emitted events and plain log text.
///
/// Modules report incremental progress as JSON lines on stderr
/// (`{"event": "progress", ...}`); everything else on stderr stays ordinary
/// text. Unknown event types are left in the text.
pub fn parse_module_events(host: &str, stderr: &str) -> (Vec<Event>, String) {
    let mut events = Vec::new();
    let mut other_lines = Vec::new();

    for line in stderr.lines() {
        let trimmed = line.trim();
        let parsed: Option<serde_json::Value> =
            if trimmed.starts_with('{') && trimmed.ends_with('}') {
                serde_json::from_str(trimmed).ok()
            } else {
                None
            };

        let event = parsed.as_ref().and_then(|value| {
            let kind = value.get("event")?.as_str()?;
            let text = |key: &str| {
                value
                    .get(key)
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            match kind {
                "progress" => Some(Event::ModuleProgress {
                    timestamp: now(),
                    host: host.to_string(),
                    percent: value
                        .get("percent")
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(0)
                        .min(100) as u8,
                    message: text("message"),
                }),
                "log" => Some(Event::ModuleLog {
                    timestamp: now(),
                    host: host.to_string(),
                    level: value
                        .get("level")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("info")
                        .to_string(),
                    message: text("message"),
                }),
                "data" => Some(Event::ModuleData {
                    timestamp: now(),
                    host: host.to_string(),
                    stream: value
                        .get("stream")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("stdout")
                        .to_string(),
                    data: text("data"),
                }),
                _ => None,
            }
        });

        match event {
            Some(event) => events.push(event),
            None => other_lines.push(line),
        }
    }

    (events, other_lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ndjson_shape() {
        let event = Event::HostComplete {
            timestamp: now(),
            host: "web1".to_string(),
            success: true,
            changed: false,
        };
        let line = serde_json::to_string(&event).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "host_complete");
        assert_eq!(value["host"], "web1");
        assert_eq!(value["success"], true);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_round_trip() {
        let event = Event::HostRetry {
            timestamp: now(),
            host: "db1".to_string(),
            attempt: 1,
            max_attempts: 3,
            error: "connect timeout".to_string(),
        };
        let line = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(back.host(), Some("db1"));
    }

    #[test]
    fn test_null_sink_is_silent() {
        NullSink.emit(&Event::ExecutionStart {
            timestamp: now(),
            target: "all".to_string(),
            module: "ping".to_string(),
            host_count: 0,
        });
    }

    #[test]
    fn test_parse_module_events() {
        let stderr = "\
starting up
{\"event\": \"progress\", \"percent\": 50, \"message\": \"halfway\"}
{\"event\": \"log\", \"level\": \"warning\", \"message\": \"slow disk\"}
{\"event\": \"unknown_kind\"}
plain trailing line";
        let (events, rest) = parse_module_events("web1", stderr);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            Event::ModuleProgress { percent: 50, host, .. } if host == "web1"
        ));
        assert!(matches!(
            &events[1],
            Event::ModuleLog { level, .. } if level == "warning"
        ));
        assert!(rest.contains("starting up"));
        assert!(rest.contains("unknown_kind"));
        assert!(rest.contains("plain trailing line"));
    }

    #[test]
    fn test_failing_sink_does_not_panic() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("broken pipe"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let sink = TextSink::new(Box::new(Broken));
        for _ in 0..3 {
            sink.emit(&Event::HostStart {
                timestamp: now(),
                host: "h".to_string(),
            });
        }
    }
}
