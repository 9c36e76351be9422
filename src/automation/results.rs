//! Results accumulation and run summaries.

use parking_lot::RwLock;
use std::time::Duration;

use crate::dispatch::ExecuteResult;

/// Aggregate counts for a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Results recorded.
    pub total: usize,
    /// Results with `success = true`.
    pub successful: usize,
    /// Results with `success = false`.
    pub failed: usize,
    /// Wall-clock duration covered by the summary.
    pub duration: Duration,
}

/// Ordered, append-safe accumulator of execution results.
///
/// Iteration snapshots a copy, so readers never block writers.
#[derive(Debug, Default)]
pub struct Results {
    inner: RwLock<Vec<ExecuteResult>>,
}

impl Results {
    /// An empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one result.
    pub fn push(&self, result: ExecuteResult) {
        self.inner.write().push(result);
    }

    /// Number of recorded results.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Whether any result failed.
    pub fn failed(&self) -> bool {
        self.inner.read().iter().any(|r| !r.success)
    }

    /// A copy of all results in append order.
    pub fn snapshot(&self) -> Vec<ExecuteResult> {
        self.inner.read().clone()
    }

    /// Results for one host.
    pub fn for_host(&self, host: &str) -> Vec<ExecuteResult> {
        self.inner
            .read()
            .iter()
            .filter(|r| r.host == host)
            .cloned()
            .collect()
    }

    /// Results for one module.
    pub fn for_module(&self, module: &str) -> Vec<ExecuteResult> {
        self.inner
            .read()
            .iter()
            .filter(|r| r.module == module)
            .cloned()
            .collect()
    }

    /// Summarize everything recorded so far.
    pub fn summarize(&self, duration: Duration) -> RunSummary {
        let results = self.inner.read();
        let successful = results.iter().filter(|r| r.success).count();
        RunSummary {
            total: results.len(),
            successful,
            failed: results.len() - successful,
            duration,
        }
    }
}
