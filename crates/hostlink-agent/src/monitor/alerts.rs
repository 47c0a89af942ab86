//! Threshold alert rules.

use std::collections::VecDeque;

use serde::Serialize;

use super::health::Severity;
use super::metrics::AggregatedMetrics;

/// Quantity an [`AlertRule`] watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    /// Transport error rate as a fraction.
    ErrorRate,
    ResponseTimeMs,
    /// Queue utilization as a fraction.
    QueueUtilization,
    MemoryPercent,
    CpuPercent,
}

impl AlertMetric {
    pub const fn read(self, metrics: &AggregatedMetrics) -> f64 {
        match self {
            Self::ErrorRate => metrics.error_rate,
            Self::ResponseTimeMs => metrics.average_latency_ms,
            Self::QueueUtilization => metrics.queue_utilization,
            Self::MemoryPercent => metrics.memory_percent,
            Self::CpuPercent => metrics.cpu_percent,
        }
    }
}

/// Fires when `metric` exceeds `threshold`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRule {
    pub name: String,
    pub metric: AlertMetric,
    pub threshold: f64,
    pub severity: Severity,
    pub enabled: bool,
    pub trigger_count: u64,
    pub last_triggered: Option<i64>,
}

impl AlertRule {
    pub fn new(name: &str, metric: AlertMetric, threshold: f64, severity: Severity) -> Self {
        Self {
            name: name.to_string(),
            metric,
            threshold,
            severity,
            enabled: true,
            trigger_count: 0,
            last_triggered: None,
        }
    }

    /// Check the rule once, recording the trigger when it fires.
    pub fn evaluate(&mut self, metrics: &AggregatedMetrics, now: i64) -> Option<Alert> {
        if !self.enabled {
            return None;
        }
        let value = self.metric.read(metrics);
        if value <= self.threshold {
            return None;
        }
        self.trigger_count += 1;
        self.last_triggered = Some(now);
        Some(Alert {
            rule: self.name.clone(),
            metric: self.metric,
            severity: self.severity,
            value,
            threshold: self.threshold,
            message: format!("{} is {value:.2}, above {:.2}", self.name, self.threshold),
            triggered_at: now,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub rule: String,
    pub metric: AlertMetric,
    pub severity: Severity,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub triggered_at: i64,
}

pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new("high_error_rate", AlertMetric::ErrorRate, 0.10, Severity::Critical),
        AlertRule::new("slow_responses", AlertMetric::ResponseTimeMs, 5000.0, Severity::Warning),
        AlertRule::new("queue_backlog", AlertMetric::QueueUtilization, 0.80, Severity::Warning),
        AlertRule::new("high_memory", AlertMetric::MemoryPercent, 90.0, Severity::Critical),
        AlertRule::new("high_cpu", AlertMetric::CpuPercent, 90.0, Severity::Warning),
    ]
}

/// Bounded alert history, oldest evicted first.
#[derive(Debug, Clone)]
pub struct AlertHistory {
    alerts: VecDeque<Alert>,
    capacity: usize,
}

impl AlertHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            alerts: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, alert: Alert) {
        if self.alerts.len() == self.capacity {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert);
    }

    pub fn to_vec(&self) -> Vec<Alert> {
        self.alerts.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_fires_above_threshold_only() {
        let mut rule = AlertRule::new("high_cpu", AlertMetric::CpuPercent, 90.0, Severity::Warning);
        let calm = AggregatedMetrics {
            cpu_percent: 90.0,
            ..Default::default()
        };
        assert!(rule.evaluate(&calm, 1).is_none());
        assert_eq!(rule.trigger_count, 0);

        let busy = AggregatedMetrics {
            cpu_percent: 97.5,
            ..Default::default()
        };
        let alert = rule.evaluate(&busy, 2);
        assert!(alert.is_some());
        assert_eq!(rule.trigger_count, 1);
        assert_eq!(rule.last_triggered, Some(2));

        rule.evaluate(&busy, 3);
        assert_eq!(rule.trigger_count, 2);
        assert_eq!(rule.last_triggered, Some(3));
    }

    #[test]
    fn disabled_rule_never_fires() {
        let mut rule = AlertRule::new("x", AlertMetric::ErrorRate, 0.0, Severity::Info);
        rule.enabled = false;
        let metrics = AggregatedMetrics {
            error_rate: 1.0,
            ..Default::default()
        };
        assert!(rule.evaluate(&metrics, 0).is_none());
    }

    #[test]
    fn default_rules_cover_all_metrics() {
        let rules = default_rules();
        for metric in [
            AlertMetric::ErrorRate,
            AlertMetric::ResponseTimeMs,
            AlertMetric::QueueUtilization,
            AlertMetric::MemoryPercent,
            AlertMetric::CpuPercent,
        ] {
            assert!(rules.iter().any(|r| r.metric == metric));
        }
    }

    #[test]
    fn history_is_bounded() {
        let mut history = AlertHistory::new(2);
        let mut rule = AlertRule::new("q", AlertMetric::QueueUtilization, 0.5, Severity::Warning);
        let metrics = AggregatedMetrics {
            queue_utilization: 0.9,
            ..Default::default()
        };
        for now in 0..3 {
            if let Some(alert) = rule.evaluate(&metrics, now) {
                history.push(alert);
            }
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history.to_vec()[0].triggered_at, 1);
    }
}
