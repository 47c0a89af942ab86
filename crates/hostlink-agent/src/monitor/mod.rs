//! Health and metrics monitor.

mod alerts;
mod health;
mod metrics;
mod service;

pub use alerts::{Alert, AlertHistory, AlertMetric, AlertRule, default_rules};
pub use health::{
    ComponentHealth, HealthCheck, HealthIssue, HealthStatus, Severity, channel_health,
    components, overall_score, queue_health, record_issue, system_health, transport_health,
};
pub use metrics::{AggregatedMetrics, LatencyWindow, rate_per_sec};
pub use service::{Monitor, MonitorConfig};
