//! Wires the transport, queue, channel, security manager and monitor into a
//! running agent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hostlink_core::Config;
use hostlink_core::now_millis;
use hostlink_security::{SecurityConfig, SecurityManager};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelClient, ChannelConfig, ChannelReceivers, ConnectionState, Envelope};
use crate::command::{Command, CommandExecutor, CommandResult};
use crate::monitor::{Monitor, MonitorConfig};
use crate::queue::{MessageQueue, QueueConfig, QueueError, QueuedMessage, deliver_pending};
use crate::system::{HealthProvider, hostname, os_description};
use crate::transport::{RegistrationRequest, TransportClient, TransportConfig, TransportError};

/// Errors that prevent the agent from starting.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Security(#[from] hostlink_security::SecurityError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Inputs to [`Agent::new`] beyond the resolved configuration.
pub struct AgentOptions {
    pub agent_version: String,
    /// Accept `http`/`ws` URLs and private hosts.
    pub allow_insecure: bool,
    pub executor: Arc<dyn CommandExecutor>,
    pub health: HealthProvider,
    pub cancel: CancellationToken,
}

pub struct Agent {
    machine_id: String,
    agent_version: String,
    security: Arc<SecurityManager>,
    transport: Arc<TransportClient>,
    queue: Arc<MessageQueue>,
    channel: ChannelClient,
    monitor: Arc<Monitor>,
    executor: Arc<dyn CommandExecutor>,
    health: HealthProvider,
    heartbeat_interval: Duration,
    drain_interval: Duration,
    registered: AtomicBool,
    cancel: CancellationToken,
}

impl Agent {
    /// Build every component. Fails on missing URLs, rejected URLs or an
    /// unreadable queue snapshot.
    pub fn new(
        mut config: Config,
        options: AgentOptions,
    ) -> Result<(Arc<Self>, ChannelReceivers), AgentError> {
        let machine_id = config.machine_id_or_generate();
        let api_url = config
            .server
            .api_url
            .clone()
            .ok_or_else(|| AgentError::Config("server.api_url is required".into()))?;
        let channel_url = config
            .server
            .channel_url
            .clone()
            .ok_or_else(|| AgentError::Config("server.channel_url is required".into()))?;

        let mut security_config = SecurityConfig::from_settings(&config.security);
        security_config.allow_insecure = options.allow_insecure;
        let security = Arc::new(SecurityManager::new(security_config));
        security.validate_url(&api_url)?;
        security.validate_url(&channel_url)?;

        let secure_transport = api_url.starts_with("https://").then_some(&security);
        let transport_config = TransportConfig::new(api_url, &options.agent_version)
            .with_settings(&config.transport)
            .with_auth_token(config.server.auth_token.clone());
        let transport = Arc::new(TransportClient::new(&transport_config, secure_transport)?);

        let queue = Arc::new(MessageQueue::open(QueueConfig {
            path: config.queue.path.clone(),
            capacity: config.queue.capacity,
            max_payload_bytes: config.security.max_json_bytes,
        })?);

        let mut channel_config =
            ChannelConfig::new(channel_url, &machine_id, &options.agent_version)
                .with_settings(&config.channel);
        channel_config.auth_token.clone_from(&config.server.auth_token);
        let (channel, receivers) = ChannelClient::builder(channel_config)
            .health_provider(Arc::clone(&options.health))
            .security(Arc::clone(&security))
            .cancel_token(options.cancel.clone())
            .build();

        let monitor = Monitor::new(MonitorConfig::from_settings(&config.monitor))
            .with_transport(Arc::clone(&transport))
            .with_channel(channel.clone())
            .with_queue(Arc::clone(&queue))
            .with_system(Arc::clone(&options.health));

        let agent = Self {
            machine_id,
            agent_version: options.agent_version,
            security,
            transport,
            queue,
            channel,
            monitor: Arc::new(monitor),
            executor: options.executor,
            health: options.health,
            heartbeat_interval: Duration::from_secs(config.transport.heartbeat_interval_secs),
            drain_interval: Duration::from_secs(config.transport.drain_interval_secs),
            registered: AtomicBool::new(false),
            cancel: options.cancel,
        };
        Ok((Arc::new(agent), receivers))
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub const fn transport(&self) -> &Arc<TransportClient> {
        &self.transport
    }

    pub const fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    pub const fn channel(&self) -> &ChannelClient {
        &self.channel
    }

    pub const fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Register, connect and run every loop until cancelled.
    pub async fn run(self: Arc<Self>, receivers: ChannelReceivers) {
        self.register().await;
        if let Err(e) = self.channel.connect().await {
            warn!(error = %e, "Initial channel connect failed, retrying on heartbeat");
        }

        let handles: Vec<JoinHandle<()>> = vec![
            self.security.spawn_token_sweeper(self.cancel.clone()),
            self.monitor.start(self.cancel.clone()),
            tokio::spawn(Arc::clone(&self).heartbeat_loop()),
            tokio::spawn(Arc::clone(&self).drain_loop()),
            tokio::spawn(Arc::clone(&self).command_loop(receivers.commands)),
            tokio::spawn(Arc::clone(&self).message_loop(receivers.messages)),
        ];
        info!(machine_id = %self.machine_id, "Agent running");

        self.cancel.cancelled().await;
        info!("Shutting down agent");
        self.channel.disconnect().await;
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Agent task panicked");
            }
        }
        self.transport.close().await;
        let queued = self.queue.len().await;
        info!(queued, "Agent stopped");
    }

    /// Register over HTTP. Returns whether the agent is registered.
    ///
    /// A token issued by the backend is used for the channel handshake too.
    pub async fn register(&self) -> bool {
        if self.registered.load(Ordering::Acquire) {
            return true;
        }
        let request = RegistrationRequest {
            machine_id: self.machine_id.clone(),
            hostname: hostname(),
            agent_version: self.agent_version.clone(),
            os: os_description(),
            arch: std::env::consts::ARCH.to_string(),
            capabilities: vec!["heartbeat".into(), "commands".into()],
        };
        match self.transport.register(&request, &self.cancel).await {
            Ok(response) => {
                if let Some(token) = response.token {
                    self.channel.set_auth_token(token).await;
                }
                if let Some(secs) = response.heartbeat_interval_secs {
                    debug!(requested_secs = secs, "Backend requested heartbeat interval");
                }
                self.registered.store(true, Ordering::Release);
                true
            }
            Err(e) => {
                warn!(error = %e, "Registration failed, will retry");
                false
            }
        }
    }

    fn heartbeat_payload(&self) -> serde_json::Value {
        json!({
            "machine_id": self.machine_id,
            "hostname": hostname(),
            "agent_version": self.agent_version,
            "status": "online",
            "timestamp": now_millis(),
            "system_health": (self.health)(),
        })
    }

    /// One heartbeat tick: register if needed, send the heartbeat, and bring
    /// the channel back if it has given up.
    pub async fn heartbeat_tick(&self) {
        if !self.register().await {
            self.enqueue(QueuedMessage::heartbeat(self.heartbeat_payload()))
                .await;
        } else {
            let payload = self.heartbeat_payload();
            match self.transport.send_heartbeat(&payload, &self.cancel).await {
                Ok(_) => debug!("Heartbeat sent"),
                Err(TransportError::Cancelled) => return,
                Err(e) => {
                    warn!(error = %e, "Heartbeat failed, queueing");
                    self.enqueue(QueuedMessage::heartbeat(payload)).await;
                }
            }
        }

        let state = self.channel.state();
        if matches!(state, ConnectionState::Disconnected | ConnectionState::GaveUp)
            && !self.channel.is_reconnecting()
        {
            info!(state = %state, "Reconnecting channel from heartbeat");
            if let Err(e) = self.channel.connect().await {
                debug!(error = %e, "Channel still unreachable");
            }
        }
    }

    async fn enqueue(&self, message: QueuedMessage) {
        let kind = message.message_type.clone();
        if let Err(e) = self.queue.enqueue(message).await {
            error!(kind = %kind, error = %e, "Failed to queue message");
        }
    }

    /// Execute `command` and deliver its result: over the channel when
    /// connected, otherwise through the durable queue.
    pub async fn handle_command(&self, command: Command) {
        info!(command_id = %command.id, command_type = %command.command_type, "Executing command");
        let result = self.executor.execute(command).await;
        self.deliver_result(&result).await;
    }

    async fn deliver_result(&self, result: &CommandResult) {
        if self.channel.is_connected() {
            match self.channel.send_command_result(result).await {
                Ok(delivery) => {
                    debug!(command_id = %result.command_id, ?delivery, "Command result sent");
                    return;
                }
                Err(e) => {
                    warn!(command_id = %result.command_id, error = %e, "Channel send failed");
                }
            }
        }
        match QueuedMessage::command_result(result) {
            Ok(message) => self.enqueue(message).await,
            Err(e) => {
                error!(command_id = %result.command_id, error = %e, "Unencodable command result");
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        // Skip the immediate first tick
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.heartbeat_tick().await,
                () = self.cancel.cancelled() => break,
            }
        }
    }

    async fn drain_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.drain_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.queue.is_empty().await {
                        continue;
                    }
                    deliver_pending(&self.queue, &self.transport, &self.cancel).await;
                }
                () = self.cancel.cancelled() => break,
            }
        }
    }

    async fn command_loop(self: Arc<Self>, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    let agent = Arc::clone(&self);
                    tokio::spawn(async move { agent.handle_command(command).await });
                }
                () = self.cancel.cancelled() => break,
            }
        }
    }

    async fn message_loop(self: Arc<Self>, mut messages: mpsc::Receiver<Envelope>) {
        loop {
            tokio::select! {
                message = messages.recv() => {
                    let Some(envelope) = message else { break };
                    debug!(kind = %envelope.kind, id = %envelope.id, "Unhandled channel message");
                }
                () = self.cancel.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::command::UnsupportedExecutor;
    use crate::system::{SystemHealth, fixed_provider};

    fn options(allow_insecure: bool) -> AgentOptions {
        AgentOptions {
            agent_version: "1.0.0".into(),
            allow_insecure,
            executor: Arc::new(UnsupportedExecutor::new("m-1")),
            health: fixed_provider(SystemHealth::default()),
            cancel: CancellationToken::new(),
        }
    }

    fn config(api: &str, channel: &str) -> Config {
        let mut config = Config::default();
        config.server.api_url = Some(api.into());
        config.server.channel_url = Some(channel.into());
        config.server.machine_id = Some("m-1".into());
        config
    }

    #[test]
    fn urls_are_required() {
        let result = Agent::new(Config::default(), options(true));
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[test]
    fn insecure_urls_need_opt_in() {
        let config = config("http://127.0.0.1:9", "ws://127.0.0.1:9/ws");
        assert!(matches!(
            Agent::new(config.clone(), options(false)),
            Err(AgentError::Security(_))
        ));
        let (agent, _rx) = Agent::new(config, options(true)).unwrap();
        assert_eq!(agent.machine_id(), "m-1");
    }

    #[tokio::test]
    async fn results_fall_back_to_the_queue_when_offline() {
        let config = config("http://127.0.0.1:9", "ws://127.0.0.1:9/ws");
        let (agent, _rx) = Agent::new(config, options(true)).unwrap();
        let command = Command {
            id: "c-1".into(),
            command_type: "shell".into(),
            command: "uptime".into(),
            args: vec![],
            options: std::collections::HashMap::new(),
            timeout: None,
        };
        agent.handle_command(command).await;

        let queued = agent.queue().peek().await.unwrap();
        assert_eq!(queued.message_type, crate::queue::kinds::COMMAND_RESULT);
        assert_eq!(queued.payload["command_id"], "c-1");
        assert_eq!(queued.payload["status"], "rejected");
    }
}
