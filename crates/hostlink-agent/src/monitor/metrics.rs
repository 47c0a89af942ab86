//! Derived rates and latency averaging.

use std::collections::VecDeque;

use serde::Serialize;

/// Aggregated view across the transport, channel, queue and host.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregatedMetrics {
    pub collected_at: i64,
    /// Channel frames sent plus received per second since the previous sample.
    pub messages_per_sec: f64,
    pub requests_per_sec: f64,
    /// Mean over the recent latency window.
    pub average_latency_ms: f64,
    pub error_rate: f64,
    pub queue_depth: usize,
    pub queue_utilization: f64,
    pub active_connections: u64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Counter values remembered between samples.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Sample {
    pub at: i64,
    pub messages: u64,
    pub requests: u64,
}

/// Events per second between two counter readings.
pub fn rate_per_sec(previous: u64, current: u64, elapsed_ms: i64) -> f64 {
    if elapsed_ms <= 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let rate = current.saturating_sub(previous) as f64 * 1000.0 / elapsed_ms as f64;
    rate
}

/// Fixed-size window of recent latency samples.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, latency_ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.samples.iter().sum();
        #[allow(clippy::cast_precision_loss)]
        let avg = sum as f64 / self.samples.len() as f64;
        avg
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
