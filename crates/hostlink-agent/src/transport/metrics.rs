//! Request counters and latency tracking.

use std::time::Duration;

use serde::Serialize;

/// Smoothing factor for the latency moving average.
const EMA_ALPHA: f64 = 0.1;

/// Cumulative HTTP transport metrics. Counters only grow until reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HttpMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub retry_requests: u64,
    pub last_latency_ms: u64,
    /// Exponential moving average over all attempts.
    pub average_latency_ms: f64,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Unix milliseconds.
    pub last_request_at: Option<i64>,
    pub last_error_at: Option<i64>,
    pub last_error: Option<String>,
}

impl HttpMetrics {
    fn record_latency(&mut self, latency: Duration, now: i64) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.total_requests += 1;
        self.last_latency_ms = ms;
        #[allow(clippy::cast_precision_loss)]
        let sample = ms as f64;
        self.average_latency_ms = if self.total_requests == 1 {
            sample
        } else {
            EMA_ALPHA.mul_add(sample, (1.0 - EMA_ALPHA) * self.average_latency_ms)
        };
        self.min_latency_ms = Some(self.min_latency_ms.map_or(ms, |min| min.min(ms)));
        self.max_latency_ms = self.max_latency_ms.max(ms);
        self.last_request_at = Some(now);
    }

    pub fn record_success(&mut self, latency: Duration, sent: usize, received: usize, now: i64) {
        self.record_latency(latency, now);
        self.successful_requests += 1;
        self.bytes_sent += sent as u64;
        self.bytes_received += received as u64;
    }

    pub fn record_failure(&mut self, latency: Duration, sent: usize, error: &str, now: i64) {
        self.record_latency(latency, now);
        self.failed_requests += 1;
        self.bytes_sent += sent as u64;
        self.last_error_at = Some(now);
        self.last_error = Some(error.to_string());
    }

    pub const fn record_retry(&mut self) {
        self.retry_requests += 1;
    }

    /// Fraction of attempts that succeeded. 1.0 before any traffic.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.successful_requests as f64 / self.total_requests as f64;
        rate
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.failed_requests as f64 / self.total_requests as f64;
        rate
    }
}
