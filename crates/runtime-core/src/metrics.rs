//! Sink for tagged scalar time series

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

/// Consumer of scalar, tagged time-series values
///
/// The orchestration layer only produces values; how they are stored or
/// displayed is up to the sink.
pub trait MetricsSink: Send + Sync {
    fn record_scalar(&self, tag: &str, value: f64, step: u64);
}

/// Shared sink handle
pub type MetricsSinkHandle = Arc<dyn MetricsSink>;

/// Writes every value as a structured log event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record_scalar(&self, tag: &str, value: f64, step: u64) {
        info!(tag = tag, value = value, step = step, "metric");
    }
}

/// One recorded value
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarRecord {
    pub tag: String,
    pub value: f64,
    pub step: u64,
}

/// Keeps every value in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<ScalarRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All values recorded so far
    pub fn records(&self) -> Vec<ScalarRecord> {
        self.records.lock().clone()
    }

    /// Values recorded under `tag`, in order
    pub fn series(&self, tag: &str) -> Vec<(u64, f64)> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.tag == tag)
            .map(|r| (r.step, r.value))
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn record_scalar(&self, tag: &str, value: f64, step: u64) {
        self.records.lock().push(ScalarRecord {
            tag: tag.to_string(),
            value,
            step,
        });
    }
}
