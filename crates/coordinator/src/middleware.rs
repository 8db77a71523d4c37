//! Request validation and per-method metrics for the coordinator service

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tonic::Status;

use runtime_core::{Error, Result};

/// Input validator for coordinator requests
pub struct InputValidator {
    /// Maximum hostname length
    max_hostname_len: usize,
    /// Maximum payload of a single exchange
    max_payload_bytes: usize,
    /// Allowed characters for hostnames
    hostname_pattern: regex::Regex,
}

impl InputValidator {
    pub fn new(max_payload_bytes: usize) -> Result<Self> {
        let hostname_pattern =
            regex::Regex::new(r"^[a-zA-Z0-9_\-\.]+$").map_err(|e| Error::Internal {
                message: format!("hostname pattern: {}", e),
            })?;
        Ok(Self {
            max_hostname_len: 253,
            max_payload_bytes,
            hostname_pattern,
        })
    }

    /// Validate a rank against the group size
    pub fn validate_rank(&self, rank: u32, world_size: usize) -> std::result::Result<usize, Status> {
        let rank = rank as usize;
        if rank >= world_size {
            return Err(Status::invalid_argument(format!(
                "rank {} out of range for world_size {}",
                rank, world_size
            )));
        }
        Ok(rank)
    }

    /// Validate a hostname reported at join
    pub fn validate_hostname(&self, hostname: &str) -> std::result::Result<(), Status> {
        if hostname.is_empty() {
            return Err(Status::invalid_argument("hostname cannot be empty"));
        }

        if hostname.len() > self.max_hostname_len {
            return Err(Status::invalid_argument(format!(
                "hostname exceeds maximum length of {} characters",
                self.max_hostname_len
            )));
        }

        if !self.hostname_pattern.is_match(hostname) {
            return Err(Status::invalid_argument(
                "hostname contains invalid characters",
            ));
        }

        Ok(())
    }

    /// Validate the combined size of an exchange's payloads
    pub fn validate_payloads(&self, payloads: &[Vec<u8>]) -> std::result::Result<(), Status> {
        let total: usize = payloads.iter().map(Vec::len).sum();
        if total > self.max_payload_bytes {
            return Err(Status::resource_exhausted(format!(
                "payloads of {} bytes exceed limit of {}",
                total, self.max_payload_bytes
            )));
        }
        Ok(())
    }
}

const LATENCY_WINDOW: usize = 1000;

#[derive(Debug, Default)]
struct MethodStats {
    requests: u64,
    errors: u64,
    latencies_us: VecDeque<u64>,
}

impl MethodStats {
    fn snapshot(&self) -> MethodSummary {
        MethodSummary {
            requests: self.requests,
            errors: self.errors,
            p99_latency_us: p99(&self.latencies_us),
        }
    }
}

/// Point-in-time view of one RPC method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSummary {
    pub requests: u64,
    pub errors: u64,
    pub p99_latency_us: Option<u64>,
}

/// Per-method request counts and a bounded window of recent latencies
#[derive(Debug, Default)]
pub struct RequestMetrics {
    methods: DashMap<String, MethodStats>,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one finished request
    pub fn record(&self, method: &str, latency: Duration, failed: bool) {
        let mut stats = self.methods.entry(method.to_string()).or_default();
        stats.requests += 1;
        if failed {
            stats.errors += 1;
        }
        if stats.latencies_us.len() >= LATENCY_WINDOW {
            stats.latencies_us.pop_front();
        }
        stats
            .latencies_us
            .push_back(latency.as_micros().min(u64::MAX as u128) as u64);
    }

    pub fn method(&self, method: &str) -> Option<MethodSummary> {
        self.methods.get(method).map(|stats| stats.snapshot())
    }

    /// Every method seen so far, sorted by name
    pub fn summary(&self) -> Vec<(String, MethodSummary)> {
        let mut all: Vec<_> = self
            .methods
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

fn p99(samples: &VecDeque<u64>) -> Option<u64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let idx = (sorted.len() * 99 / 100).min(sorted.len() - 1);
    Some(sorted[idx])
}
