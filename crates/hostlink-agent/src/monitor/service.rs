//! Periodic metrics aggregation, health checks and alert evaluation.

use std::sync::Arc;
use std::time::Duration;

use hostlink_core::config::MonitorSettings;
use hostlink_core::now_millis;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::ChannelClient;
use crate::queue::MessageQueue;
use crate::system::HealthProvider;
use crate::transport::TransportClient;

use super::alerts::{Alert, AlertHistory, AlertRule, default_rules};
use super::health::{
    ComponentHealth, HealthCheck, HealthIssue, HealthStatus, channel_health, components,
    overall_score, queue_health, record_issue, system_health, transport_health,
};
use super::metrics::{AggregatedMetrics, LatencyWindow, Sample, rate_per_sec};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub metrics_interval: Duration,
    pub health_interval: Duration,
    pub alert_interval: Duration,
    /// Latency samples averaged for `average_latency_ms`.
    pub latency_window: usize,
    /// Alerts kept in history.
    pub alert_history: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_settings(&MonitorSettings::default())
    }
}

impl MonitorConfig {
    pub fn from_settings(settings: &MonitorSettings) -> Self {
        Self {
            metrics_interval: Duration::from_secs(settings.metrics_interval_secs),
            health_interval: Duration::from_secs(settings.health_interval_secs),
            alert_interval: Duration::from_secs(settings.alert_interval_secs),
            latency_window: settings.latency_window,
            alert_history: settings.alert_history,
        }
    }
}

struct MonitorState {
    latest_health: Option<HealthCheck>,
    latest_metrics: Option<AggregatedMetrics>,
    issues: Vec<HealthIssue>,
    rules: Vec<AlertRule>,
    alerts: AlertHistory,
    latency: LatencyWindow,
    last_sample: Option<Sample>,
    /// Transport request count at the last latency sample.
    last_request_total: u64,
    /// Queue failure count at the last health check.
    last_queue_failed: u64,
}

/// Decides whether the subsystem is working.
///
/// Each watched component is optional; a missing one reports `unknown`.
pub struct Monitor {
    config: MonitorConfig,
    transport: Option<Arc<TransportClient>>,
    channel: Option<ChannelClient>,
    queue: Option<Arc<MessageQueue>>,
    system: Option<HealthProvider>,
    state: RwLock<MonitorState>,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        let state = MonitorState {
            latest_health: None,
            latest_metrics: None,
            issues: Vec::new(),
            rules: default_rules(),
            alerts: AlertHistory::new(config.alert_history),
            latency: LatencyWindow::new(config.latency_window),
            last_sample: None,
            last_request_total: 0,
            last_queue_failed: 0,
        };
        Self {
            config,
            transport: None,
            channel: None,
            queue: None,
            system: None,
            state: RwLock::new(state),
        }
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Arc<TransportClient>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn with_channel(mut self, channel: ChannelClient) -> Self {
        self.channel = Some(channel);
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: Arc<MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    #[must_use]
    pub fn with_system(mut self, provider: HealthProvider) -> Self {
        self.system = Some(provider);
        self
    }

    pub const fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Recompute rates and the latency average.
    pub async fn collect_metrics(&self) -> AggregatedMetrics {
        let now = now_millis();
        let http = match &self.transport {
            Some(transport) => Some(transport.metrics().await),
            None => None,
        };
        let channel = self.channel.as_ref().map(ChannelClient::metrics);
        let (queue_depth, queue_utilization) = match &self.queue {
            Some(queue) => (queue.len().await, queue.utilization().await),
            None => (0, 0.0),
        };
        let host = self.system.as_ref().map(|provider| provider());

        let messages = channel
            .as_ref()
            .map_or(0, |c| c.messages_sent + c.messages_received);
        let requests = http.as_ref().map_or(0, |h| h.total_requests);

        let mut state = self.state.write().await;
        if let Some(http) = &http {
            if http.total_requests > state.last_request_total {
                state.latency.push(http.last_latency_ms);
            }
            state.last_request_total = http.total_requests;
        }

        let (messages_per_sec, requests_per_sec) = state.last_sample.map_or((0.0, 0.0), |prev| {
            let elapsed = now - prev.at;
            (
                rate_per_sec(prev.messages, messages, elapsed),
                rate_per_sec(prev.requests, requests, elapsed),
            )
        });
        state.last_sample = Some(Sample {
            at: now,
            messages,
            requests,
        });

        let metrics = AggregatedMetrics {
            collected_at: now,
            messages_per_sec,
            requests_per_sec,
            average_latency_ms: state.latency.average(),
            error_rate: http.as_ref().map_or(0.0, crate::transport::HttpMetrics::error_rate),
            queue_depth,
            queue_utilization,
            active_connections: channel.as_ref().map_or(0, |c| c.active_connections),
            cpu_percent: host.as_ref().map_or(0.0, |h| f64::from(h.cpu_percent)),
            memory_percent: host.as_ref().map_or(0.0, |h| f64::from(h.memory_percent)),
        };
        state.latest_metrics = Some(metrics.clone());
        drop(state);

        debug!(
            messages_per_sec = metrics.messages_per_sec,
            average_latency_ms = metrics.average_latency_ms,
            queue_depth = metrics.queue_depth,
            "Collected metrics"
        );
        metrics
    }

    /// Evaluate every component and combine them into one verdict.
    pub async fn check_health(&self) -> HealthCheck {
        let now = now_millis();
        let mut checked = Vec::with_capacity(4);

        checked.push(match &self.transport {
            Some(transport) => transport_health(&transport.metrics().await, now),
            None => unknown(components::TRANSPORT, now),
        });
        checked.push(match &self.channel {
            Some(channel) => channel_health(&channel.metrics(), channel.state(), now),
            None => unknown(components::CHANNEL, now),
        });

        let queue_reading = match &self.queue {
            Some(queue) => Some((queue.utilization().await, queue.stats().await.failed)),
            None => None,
        };

        let mut state = self.state.write().await;
        checked.push(match queue_reading {
            Some((utilization, failed)) => {
                let newly_failed = failed.saturating_sub(state.last_queue_failed);
                state.last_queue_failed = failed;
                queue_health(utilization, newly_failed, now)
            }
            None => unknown(components::QUEUE, now),
        });
        checked.push(match &self.system {
            Some(provider) => system_health(&provider(), now),
            None => unknown(components::SYSTEM, now),
        });

        // Resolved issues drop out; recurring ones are counted
        state.issues.retain(|issue| {
            checked
                .iter()
                .any(|c| c.name == issue.component && c.status != HealthStatus::Healthy)
        });
        for issue in checked.iter().filter_map(ComponentHealth::issue) {
            record_issue(&mut state.issues, issue);
        }

        let score = overall_score(&checked);
        let check = HealthCheck {
            status: HealthStatus::from_score(score),
            score,
            components: checked,
            issues: state.issues.clone(),
            checked_at: now,
        };
        state.latest_health = Some(check.clone());
        drop(state);

        match check.status {
            HealthStatus::Healthy => debug!(score, "Health check passed"),
            status => warn!(
                score,
                status = ?status,
                issues = check.issues.len(),
                "Subsystem not healthy"
            ),
        }
        check
    }

    /// Run every rule once against the latest metrics.
    pub async fn evaluate_alerts(&self) -> Vec<Alert> {
        let metrics = match self.latest_metrics().await {
            Some(metrics) => metrics,
            None => self.collect_metrics().await,
        };
        let now = now_millis();

        let mut state = self.state.write().await;
        let fired: Vec<Alert> = state
            .rules
            .iter_mut()
            .filter_map(|rule| rule.evaluate(&metrics, now))
            .collect();
        for alert in &fired {
            state.alerts.push(alert.clone());
        }
        drop(state);

        for alert in &fired {
            warn!(
                rule = %alert.rule,
                value = alert.value,
                threshold = alert.threshold,
                severity = ?alert.severity,
                "Alert triggered"
            );
        }
        fired
    }

    pub async fn latest_health(&self) -> Option<HealthCheck> {
        self.state.read().await.latest_health.clone()
    }

    pub async fn latest_metrics(&self) -> Option<AggregatedMetrics> {
        self.state.read().await.latest_metrics.clone()
    }

    /// Alert history, oldest first.
    pub async fn alerts(&self) -> Vec<Alert> {
        self.state.read().await.alerts.to_vec()
    }

    pub async fn rules(&self) -> Vec<AlertRule> {
        self.state.read().await.rules.clone()
    }

    pub async fn set_rules(&self, rules: Vec<AlertRule>) {
        self.state.write().await.rules = rules;
    }

    /// Spawn the metrics, health and alert tickers.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut metrics = tokio::time::interval(monitor.config.metrics_interval);
            let mut health = tokio::time::interval(monitor.config.health_interval);
            let mut alerts = tokio::time::interval(monitor.config.alert_interval);
            // Skip the immediate first ticks
            metrics.tick().await;
            health.tick().await;
            alerts.tick().await;
            info!("Health monitor started");

            loop {
                tokio::select! {
                    _ = metrics.tick() => {
                        monitor.collect_metrics().await;
                    }
                    _ = health.tick() => {
                        monitor.check_health().await;
                    }
                    _ = alerts.tick() => {
                        monitor.evaluate_alerts().await;
                    }
                    () = cancel.cancelled() => {
                        info!("Health monitor stopped");
                        break;
                    }
                }
            }
        })
    }
}

fn unknown(name: &str, now: i64) -> ComponentHealth {
    ComponentHealth::new(name, HealthStatus::Unknown, "not monitored", now)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::queue::{QueueConfig, QueuedMessage};
    use crate::system::{SystemHealth, fixed_provider};

    fn calm_host() -> HealthProvider {
        fixed_provider(SystemHealth {
            cpu_percent: 10.0,
            memory_percent: 30.0,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn unwatched_components_are_unknown() {
        let monitor = Monitor::new(MonitorConfig::default());
        let check = monitor.check_health().await;
        assert_eq!(check.components.len(), 4);
        assert!(check.components.iter().all(|c| c.status == HealthStatus::Unknown));
        assert!(check.score.abs() < f64::EPSILON);
        assert_eq!(check.status, HealthStatus::Unhealthy);
        assert_eq!(check.issues.len(), 4);
    }

    #[tokio::test]
    async fn disconnected_channel_raises_issue() {
        let (channel, _rx) = ChannelClient::new(ChannelConfig::new("ws://127.0.0.1:9", "m", "1"));
        let monitor = Monitor::new(MonitorConfig::default())
            .with_channel(channel)
            .with_queue(Arc::new(MessageQueue::in_memory()))
            .with_system(calm_host());

        let check = monitor.check_health().await;
        let channel = check
            .components
            .iter()
            .find(|c| c.name == components::CHANNEL)
            .unwrap();
        assert_eq!(channel.status, HealthStatus::Unhealthy);
        assert!(
            check
                .issues
                .iter()
                .any(|i| i.component == components::CHANNEL)
        );

        // Same issue on the next check is counted, not duplicated
        let again = monitor.check_health().await;
        let issues: Vec<_> = again
            .issues
            .iter()
            .filter(|i| i.component == components::CHANNEL)
            .collect();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].count, 2);
        assert_eq!(monitor.latest_health().await.unwrap(), again);
    }

    #[tokio::test]
    async fn metrics_reflect_queue_and_host() {
        let queue = Arc::new(MessageQueue::open(QueueConfig {
            capacity: 4,
            ..QueueConfig::default()
        })
        .unwrap());
        queue
            .enqueue(QueuedMessage::heartbeat(serde_json::json!({})))
            .await
            .unwrap();
        let monitor = Monitor::new(MonitorConfig::default())
            .with_queue(Arc::clone(&queue))
            .with_system(calm_host());

        let metrics = monitor.collect_metrics().await;
        assert_eq!(metrics.queue_depth, 1);
        assert!((metrics.queue_utilization - 0.25).abs() < f64::EPSILON);
        assert!((metrics.cpu_percent - 10.0).abs() < f64::EPSILON);
        assert_eq!(monitor.latest_metrics().await.unwrap(), metrics);
    }

    #[tokio::test]
    async fn alerts_fire_and_are_recorded() {
        let monitor = Monitor::new(MonitorConfig::default()).with_system(fixed_provider(
            SystemHealth {
                cpu_percent: 99.0,
                memory_percent: 95.0,
                ..Default::default()
            },
        ));
        let fired = monitor.evaluate_alerts().await;
        let names: Vec<_> = fired.iter().map(|a| a.rule.as_str()).collect();
        assert_eq!(names, vec!["high_memory", "high_cpu"]);

        monitor.evaluate_alerts().await;
        assert_eq!(monitor.alerts().await.len(), 4);
        let rules = monitor.rules().await;
        let cpu = rules.iter().find(|r| r.name == "high_cpu").unwrap();
        assert_eq!(cpu.trigger_count, 2);
        assert!(cpu.last_triggered.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn tickers_populate_latest_state() {
        let config = MonitorConfig {
            metrics_interval: Duration::from_secs(1),
            health_interval: Duration::from_secs(2),
            alert_interval: Duration::from_secs(3),
            ..MonitorConfig::default()
        };
        let monitor = Arc::new(Monitor::new(config).with_system(calm_host()));
        let cancel = CancellationToken::new();
        let handle = monitor.start(cancel.clone());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(monitor.latest_metrics().await.is_some());
        assert!(monitor.latest_health().await.is_some());

        cancel.cancel();
        handle.await.unwrap();
    }
}
