//! Component health classification and weighted scoring.

use serde::Serialize;

use crate::channel::{ChannelMetrics, ConnectionState};
use crate::system::SystemHealth;
use crate::transport::HttpMetrics;

/// Component names used in [`ComponentHealth::name`] and [`HealthIssue::component`].
pub mod components {
    pub const TRANSPORT: &str = "transport";
    pub const CHANNEL: &str = "channel";
    pub const QUEUE: &str = "queue";
    pub const SYSTEM: &str = "system";
}

const TRANSPORT_DEGRADED_ERROR_RATE: f64 = 0.05;
const TRANSPORT_UNHEALTHY_ERROR_RATE: f64 = 0.10;
const QUEUE_UNHEALTHY_UTILIZATION: f64 = 0.90;
const SYSTEM_DEGRADED_PERCENT: f64 = 80.0;
const SYSTEM_UNHEALTHY_PERCENT: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub const fn score(self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.7,
            Self::Unhealthy => 0.3,
            Self::Unknown => 0.0,
        }
    }

    /// Classify an overall score.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Self::Healthy
        } else if score >= 0.5 {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    /// Names the condition. Measurements live in the fields below.
    pub message: String,
    pub checked_at: i64,
    pub response_time_ms: Option<f64>,
    /// Fraction in `[0, 1]`.
    pub error_rate: Option<f64>,
    pub uptime_secs: Option<u64>,
}

impl ComponentHealth {
    pub fn new(name: &str, status: HealthStatus, message: impl Into<String>, now: i64) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            checked_at: now,
            response_time_ms: None,
            error_rate: None,
            uptime_secs: None,
        }
    }

    #[must_use]
    pub fn with_response_time(mut self, ms: f64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_error_rate(mut self, rate: f64) -> Self {
        self.error_rate = Some(rate);
        self
    }

    #[must_use]
    pub fn with_uptime(mut self, secs: u64) -> Self {
        self.uptime_secs = Some(secs);
        self
    }

    /// Relative weight in the overall score.
    pub fn weight(&self) -> f64 {
        match self.name.as_str() {
            components::TRANSPORT | components::CHANNEL => 2.0,
            _ => 1.0,
        }
    }

    /// The issue this component raises, if it is not healthy.
    pub fn issue(&self) -> Option<HealthIssue> {
        let severity = match self.status {
            HealthStatus::Healthy => return None,
            HealthStatus::Unhealthy => Severity::Critical,
            HealthStatus::Degraded | HealthStatus::Unknown => Severity::Warning,
        };
        Some(HealthIssue {
            component: self.name.clone(),
            severity,
            description: self.message.clone(),
            first_seen: self.checked_at,
            last_seen: self.checked_at,
            count: 1,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthIssue {
    pub component: String,
    pub severity: Severity,
    pub description: String,
    pub first_seen: i64,
    pub last_seen: i64,
    /// Number of checks that reported this issue.
    pub count: u32,
}

/// Merge `issue` into `issues`, bumping the counter of an identical one.
pub fn record_issue(issues: &mut Vec<HealthIssue>, issue: HealthIssue) {
    if let Some(existing) = issues
        .iter_mut()
        .find(|i| i.component == issue.component && i.description == issue.description)
    {
        existing.count = existing.count.saturating_add(1);
        existing.last_seen = issue.last_seen;
        existing.severity = issue.severity;
    } else {
        issues.push(issue);
    }
}

/// Result of one health evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub score: f64,
    pub components: Vec<ComponentHealth>,
    pub issues: Vec<HealthIssue>,
    pub checked_at: i64,
}

/// Weighted mean of component scores. Zero when there are no components.
pub fn overall_score(components: &[ComponentHealth]) -> f64 {
    let total_weight: f64 = components.iter().map(ComponentHealth::weight).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = components
        .iter()
        .map(|c| c.weight() * c.status.score())
        .sum();
    weighted / total_weight
}

fn percent(rate: f64) -> f64 {
    rate * 100.0
}

pub fn transport_health(metrics: &HttpMetrics, now: i64) -> ComponentHealth {
    let rate = metrics.error_rate();
    let (status, message) = if rate > TRANSPORT_UNHEALTHY_ERROR_RATE {
        (
            HealthStatus::Unhealthy,
            format!("error rate above {:.0}%", percent(TRANSPORT_UNHEALTHY_ERROR_RATE)),
        )
    } else if rate > TRANSPORT_DEGRADED_ERROR_RATE {
        (
            HealthStatus::Degraded,
            format!("error rate above {:.0}%", percent(TRANSPORT_DEGRADED_ERROR_RATE)),
        )
    } else {
        (HealthStatus::Healthy, "requests succeeding".to_string())
    };
    ComponentHealth::new(components::TRANSPORT, status, message, now)
        .with_response_time(metrics.average_latency_ms)
        .with_error_rate(rate)
}

pub fn channel_health(
    metrics: &ChannelMetrics,
    state: ConnectionState,
    now: i64,
) -> ComponentHealth {
    let (status, message) = if state == ConnectionState::GaveUp {
        (HealthStatus::Unhealthy, "reconnection attempts exhausted")
    } else if metrics.active_connections == 0 {
        (HealthStatus::Unhealthy, "no active connections")
    } else {
        (HealthStatus::Healthy, "connected")
    };
    let health = ComponentHealth::new(components::CHANNEL, status, message, now)
        .with_error_rate(metrics.error_rate());
    match metrics.connected_at {
        Some(since) => health.with_uptime(u64::try_from((now - since) / 1000).unwrap_or(0)),
        None => health,
    }
}

/// `newly_failed` counts messages that exhausted their retries since the
/// previous check.
pub fn queue_health(utilization: f64, newly_failed: u64, now: i64) -> ComponentHealth {
    let (status, message) = if utilization > QUEUE_UNHEALTHY_UTILIZATION {
        (
            HealthStatus::Unhealthy,
            format!("utilization above {:.0}%", percent(QUEUE_UNHEALTHY_UTILIZATION)),
        )
    } else if newly_failed > 0 {
        (
            HealthStatus::Degraded,
            "messages failed permanently".to_string(),
        )
    } else {
        (HealthStatus::Healthy, "within capacity".to_string())
    };
    ComponentHealth::new(components::QUEUE, status, message, now)
}

pub fn system_health(health: &SystemHealth, now: i64) -> ComponentHealth {
    let cpu = f64::from(health.cpu_percent);
    let memory = f64::from(health.memory_percent);
    let peak = cpu.max(memory);
    let (status, message) = if peak > SYSTEM_UNHEALTHY_PERCENT {
        (
            HealthStatus::Unhealthy,
            format!("resource usage above {SYSTEM_UNHEALTHY_PERCENT:.0}%"),
        )
    } else if peak > SYSTEM_DEGRADED_PERCENT {
        (
            HealthStatus::Degraded,
            format!("resource usage above {SYSTEM_DEGRADED_PERCENT:.0}%"),
        )
    } else {
        (HealthStatus::Healthy, "resource usage normal".to_string())
    };
    ComponentHealth::new(components::SYSTEM, status, message, now).with_uptime(health.uptime_secs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn http(total: u64, failed: u64) -> HttpMetrics {
        HttpMetrics {
            total_requests: total,
            successful_requests: total - failed,
            failed_requests: failed,
            ..Default::default()
        }
    }

    #[test]
    fn transport_thresholds() {
        assert_eq!(transport_health(&http(100, 5), 0).status, HealthStatus::Healthy);
        assert_eq!(transport_health(&http(100, 6), 0).status, HealthStatus::Degraded);
        assert_eq!(transport_health(&http(100, 10), 0).status, HealthStatus::Degraded);
        assert_eq!(transport_health(&http(100, 11), 0).status, HealthStatus::Unhealthy);
        assert_eq!(transport_health(&http(0, 0), 0).status, HealthStatus::Healthy);
    }

    #[test]
    fn transport_reports_rate_and_latency() {
        let metrics = HttpMetrics {
            average_latency_ms: 120.5,
            ..http(100, 6)
        };
        let health = transport_health(&metrics, 0);
        assert_eq!(health.message, "error rate above 5%");
        assert!((health.error_rate.unwrap() - 0.06).abs() < 1e-9);
        assert!((health.response_time_ms.unwrap() - 120.5).abs() < 1e-9);
        assert_eq!(health.uptime_secs, None);
    }

    #[test]
    fn drifting_error_rate_is_one_issue() {
        let mut issues = Vec::new();
        let checks = [(100, 6), (101, 7), (102, 7), (103, 8)];
        for (i, (total, failed)) in checks.into_iter().enumerate() {
            let now = i64::try_from(i).unwrap() * 1000;
            let health = transport_health(&http(total, failed), now);
            assert_eq!(health.status, HealthStatus::Degraded);
            record_issue(&mut issues, health.issue().unwrap());
        }
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].count, 4);
        assert_eq!(issues[0].first_seen, 0);
        assert_eq!(issues[0].last_seen, 3000);
    }

    #[test]
    fn channel_without_connections_is_unhealthy() {
        let metrics = ChannelMetrics::default();
        let health = channel_health(&metrics, ConnectionState::Disconnected, 0);
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.message, "no active connections");

        let connected = ChannelMetrics {
            active_connections: 1,
            ..Default::default()
        };
        let health = channel_health(&connected, ConnectionState::Connected, 0);
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.uptime_secs, None);

        let gave_up = channel_health(&metrics, ConnectionState::GaveUp, 0);
        assert_eq!(gave_up.message, "reconnection attempts exhausted");
    }

    #[test]
    fn channel_reports_uptime_and_error_rate() {
        let metrics = ChannelMetrics {
            active_connections: 1,
            connected_at: Some(10_000),
            messages_sent: 6,
            messages_received: 3,
            errors: 1,
            ..Default::default()
        };
        let health = channel_health(&metrics, ConnectionState::Connected, 75_000);
        assert_eq!(health.uptime_secs, Some(65));
        assert!((health.error_rate.unwrap() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn queue_thresholds() {
        assert_eq!(queue_health(0.5, 0, 0).status, HealthStatus::Healthy);
        assert_eq!(queue_health(0.5, 2, 0).status, HealthStatus::Degraded);
        assert_eq!(queue_health(0.91, 0, 0).status, HealthStatus::Unhealthy);
        assert_eq!(queue_health(0.93, 0, 0).message, queue_health(0.97, 0, 0).message);
    }

    #[test]
    fn system_thresholds() {
        let sample = |cpu: f32, memory: f32| SystemHealth {
            cpu_percent: cpu,
            memory_percent: memory,
            ..Default::default()
        };
        assert_eq!(system_health(&sample(10.0, 50.0), 0).status, HealthStatus::Healthy);
        assert_eq!(system_health(&sample(85.0, 50.0), 0).status, HealthStatus::Degraded);
        assert_eq!(system_health(&sample(10.0, 95.0), 0).status, HealthStatus::Unhealthy);

        let host = SystemHealth {
            uptime_secs: 3600,
            ..sample(10.0, 50.0)
        };
        assert_eq!(system_health(&host, 0).uptime_secs, Some(3600));
    }

    #[test]
    fn weighted_score_doubles_transport_and_channel() {
        let components = vec![
            ComponentHealth::new(components::TRANSPORT, HealthStatus::Healthy, "", 0),
            ComponentHealth::new(components::CHANNEL, HealthStatus::Unhealthy, "", 0),
            ComponentHealth::new(components::QUEUE, HealthStatus::Healthy, "", 0),
            ComponentHealth::new(components::SYSTEM, HealthStatus::Healthy, "", 0),
        ];
        // (2*1.0 + 2*0.3 + 1.0 + 1.0) / 6
        let score = overall_score(&components);
        assert!((score - 4.6 / 6.0).abs() < 1e-9);
        assert_eq!(HealthStatus::from_score(score), HealthStatus::Degraded);
        assert!(overall_score(&[]).abs() < f64::EPSILON);
    }

    #[test]
    fn status_classification() {
        assert_eq!(HealthStatus::from_score(0.8), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_score(0.79), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_score(0.5), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_score(0.49), HealthStatus::Unhealthy);
    }

    #[test]
    fn duplicate_issues_are_counted() {
        let mut issues = Vec::new();
        let unhealthy = |now| {
            ComponentHealth::new(
                components::CHANNEL,
                HealthStatus::Unhealthy,
                "no active connections",
                now,
            )
        };
        record_issue(&mut issues, unhealthy(10).issue().unwrap());
        let again = unhealthy(20);
        record_issue(&mut issues, again.issue().unwrap());

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].count, 2);
        assert_eq!(issues[0].first_seen, 10);
        assert_eq!(issues[0].last_seen, 20);
        assert_eq!(issues[0].severity, Severity::Critical);

        let healthy = ComponentHealth::new(components::QUEUE, HealthStatus::Healthy, "ok", 0);
        assert!(healthy.issue().is_none());
    }
}
