//! Persistent WebSocket channel to the backend.
//!
//! The client owns three background tasks per connection: a read loop, a ping
//! loop and (briefly) an offline-buffer flush. When the read loop observes a
//! dropped connection it starts a single reconnect task with linear backoff.
//! Outbound messages sent while disconnected are buffered and delivered after
//! the next successful connect.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hostlink_core::now_millis;
use hostlink_security::SecurityManager;

use crate::command::{Command, CommandResult};
use crate::system::HealthProvider;

use super::config::ChannelConfig;
use super::envelope::{ChannelMessage, Envelope, Heartbeat};
use super::error::ChannelError;
use super::metrics::{ChannelMetrics, Counters, bump};
use super::state::{ConnectionState, ReconnectGuard, ReconnectPermit};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Rate-limit key for commands arriving over the channel.
const COMMAND_RATE_KEY: &str = "channel:commands";

/// Outcome of [`ChannelClient::send_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the socket.
    Sent,
    /// Held in the offline buffer until the next connect.
    Buffered,
}

/// Receiving ends of the inbound streams.
pub struct ChannelReceivers {
    pub commands: mpsc::Receiver<Command>,
    /// Frames whose kind the client does not handle itself.
    pub messages: mpsc::Receiver<Envelope>,
}

/// Builds a [`ChannelClient`] with its optional collaborators.
pub struct ChannelClientBuilder {
    config: ChannelConfig,
    health: Option<HealthProvider>,
    security: Option<Arc<SecurityManager>>,
    cancel: CancellationToken,
}

impl ChannelClientBuilder {
    /// Include a system-health snapshot in pings and pongs.
    #[must_use]
    pub fn health_provider(mut self, provider: HealthProvider) -> Self {
        self.health = Some(provider);
        self
    }

    /// Rate-limit and sanitize inbound commands, and use the manager's TLS
    /// trust policy for `wss://` URLs.
    #[must_use]
    pub fn security(mut self, manager: Arc<SecurityManager>) -> Self {
        self.security = Some(manager);
        self
    }

    /// Owner cancellation. Stops every background task and pending reconnect.
    #[must_use]
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> (ChannelClient, ChannelReceivers) {
        let (commands_tx, commands) = mpsc::channel(self.config.command_buffer.max(1));
        let (messages_tx, messages) = mpsc::channel(self.config.message_buffer.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let session = self.cancel.child_token();
        let auth_token = RwLock::new(self.config.auth_token.clone());

        let inner = Inner {
            config: self.config,
            auth_token,
            state,
            writer: Mutex::new(None),
            offline: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
            ping_seq: AtomicU64::new(0),
            commands_tx,
            messages_tx,
            health: self.health,
            security: self.security,
            reconnect: ReconnectGuard::new(),
            closed: AtomicBool::new(false),
            session: Mutex::new(session),
            cancel: self.cancel,
        };
        (
            ChannelClient {
                inner: Arc::new(inner),
            },
            ChannelReceivers { commands, messages },
        )
    }
}

/// Handle to the persistent channel. Cheap to clone.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ChannelConfig,
    /// Sent on every handshake, including reconnects.
    auth_token: RwLock<Option<String>>,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<Option<WsSink>>,
    offline: Mutex<VecDeque<Envelope>>,
    counters: Counters,
    ping_seq: AtomicU64,
    commands_tx: mpsc::Sender<Command>,
    messages_tx: mpsc::Sender<Envelope>,
    health: Option<HealthProvider>,
    security: Option<Arc<SecurityManager>>,
    reconnect: ReconnectGuard,
    /// Set by an explicit disconnect. Suppresses reconnection.
    closed: AtomicBool,
    /// Cancelled when the current connection ends.
    session: Mutex<CancellationToken>,
    cancel: CancellationToken,
}

impl ChannelClient {
    pub fn builder(config: ChannelConfig) -> ChannelClientBuilder {
        ChannelClientBuilder {
            config,
            health: None,
            security: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn new(config: ChannelConfig) -> (Self, ChannelReceivers) {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Replace the bearer token used by the next handshake.
    pub async fn set_auth_token(&self, token: impl Into<String>) {
        *self.inner.auth_token.write().await = Some(token.into());
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Open the connection. A no-op when already connected.
    ///
    /// On success the read loop, the ping loop and an offline-buffer flush are
    /// started. Failures leave the client `Disconnected`; no reconnect is
    /// scheduled for an explicit connect.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let proceed = self.inner.state.send_if_modified(|state| match state {
            ConnectionState::Connected | ConnectionState::Connecting => false,
            _ => {
                *state = ConnectionState::Connecting;
                true
            }
        });
        if !proceed {
            debug!(state = %self.state(), "Connect skipped");
            return Ok(());
        }
        self.inner.closed.store(false, Ordering::Release);

        match Arc::clone(&self.inner).open().await {
            Ok(()) => Ok(()),
            Err(e) => {
                bump(&self.inner.counters.connect_failures);
                self.inner.counters.record_error();
                self.inner.set_state(ConnectionState::Disconnected);
                warn!(error = %e, url = %self.inner.config.url, "Channel connect failed");
                Err(e)
            }
        }
    }

    /// Close the connection without scheduling a reconnect.
    pub async fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.session.lock().await.cancel();
        self.inner.counters.set_active(false);

        let writer = self.inner.writer.lock().await.take();
        if let Some(mut sink) = writer {
            if let Err(e) = sink.send(Message::Close(None)).await {
                debug!(error = %e, "Close frame not delivered");
            }
            let _ = sink.close().await;
        }
        info!("Channel disconnected");
    }

    /// Send `envelope` now, or buffer it when not connected.
    ///
    /// A failed write also buffers the envelope; only encoding errors are
    /// returned.
    pub async fn send_message(&self, envelope: Envelope) -> Result<Delivery, ChannelError> {
        self.inner.send_or_buffer(envelope).await
    }

    pub async fn send_command_result(
        &self,
        result: &CommandResult,
    ) -> Result<Delivery, ChannelError> {
        self.send_message(Envelope::command_result(result)?).await
    }

    pub fn metrics(&self) -> ChannelMetrics {
        self.inner.counters.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.inner.counters.reset();
    }

    /// Number of envelopes waiting for a connection.
    pub async fn offline_len(&self) -> usize {
        self.inner.offline.lock().await.len()
    }

    /// Whether a reconnect loop is currently running.
    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnect.is_held()
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    fn should_reconnect(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    async fn handshake_request(&self) -> Result<Request, ChannelError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        if let Some(token) = self.auth_token.read().await.as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ChannelError::InvalidRequest(format!("auth token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        let machine_id = HeaderValue::from_str(&self.config.machine_id)
            .map_err(|e| ChannelError::InvalidRequest(format!("machine id: {e}")))?;
        headers.insert("x-machine-id", machine_id);
        let version = HeaderValue::from_str(&self.config.agent_version)
            .map_err(|e| ChannelError::InvalidRequest(format!("agent version: {e}")))?;
        headers.insert("x-agent-version", version);
        Ok(request)
    }

    fn connector(&self) -> Result<Option<Connector>, ChannelError> {
        match &self.security {
            Some(security) if self.config.url.starts_with("wss://") => {
                Ok(Some(Connector::Rustls(security.client_config()?)))
            }
            _ => Ok(None),
        }
    }

    /// Handshake and start the per-connection tasks.
    async fn open(self: Arc<Self>) -> Result<(), ChannelError> {
        let request = self.handshake_request().await?;
        let connector = self.connector()?;
        let handshake = self.config.handshake_timeout;

        let (stream, _response) = timeout(
            handshake,
            connect_async_tls_with_config(request, None, false, connector),
        )
        .await
        .map_err(|_| ChannelError::HandshakeTimeout(handshake))??;

        let (sink, source) = stream.split();
        *self.writer.lock().await = Some(sink);

        let session = self.cancel.child_token();
        {
            let mut current = self.session.lock().await;
            current.cancel();
            *current = session.clone();
        }

        bump(&self.counters.connects);
        self.counters.set_active(true);
        self.set_state(ConnectionState::Connected);
        info!(url = %self.config.url, "Channel connected");

        tokio::spawn(Arc::clone(&self).read_loop(source, session.clone()));
        tokio::spawn(Arc::clone(&self).ping_loop(session));
        tokio::spawn(Arc::clone(&self).flush_offline());
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut source: WsSource, session: CancellationToken) {
        let read_timeout = self.config.read_timeout;
        loop {
            let next = tokio::select! {
                () = session.cancelled() => return,
                next = timeout(read_timeout, source.next()) => next,
            };

            match next {
                Err(_) => {
                    debug!(timeout_secs = read_timeout.as_secs(), "Channel idle, re-arming read");
                }
                Ok(None) => {
                    self.handle_disconnect(&session, "stream ended").await;
                    return;
                }
                Ok(Some(Err(e))) => {
                    self.counters.record_error();
                    self.handle_disconnect(&session, &e.to_string()).await;
                    return;
                }
                Ok(Some(Ok(message))) => match message {
                    Message::Text(text) => self.handle_frame(text.as_str().as_bytes()).await,
                    Message::Binary(bytes) => self.handle_frame(&bytes).await,
                    Message::Close(frame) => {
                        let reason = frame.map_or_else(
                            || "closed by peer".to_string(),
                            |f| format!("closed by peer: {} {}", f.code, f.reason.as_str()),
                        );
                        self.handle_disconnect(&session, &reason).await;
                        return;
                    }
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                },
            }
        }
    }

    async fn ping_loop(self: Arc<Self>, session: CancellationToken) {
        let mut ticker = interval(self.config.ping_interval);
        // Skip the immediate first tick
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.is_connected() {
                        continue;
                    }
                    let seq = self.ping_seq.fetch_add(1, Ordering::Relaxed) + 1;
                    let ping = self.heartbeat(seq);
                    match self.write_envelope(Envelope::ping(&ping)).await {
                        Ok(()) => bump(&self.counters.pings_sent),
                        Err(e) => warn!(error = %e, ping_seq = seq, "Ping failed"),
                    }
                }
                () = session.cancelled() => return,
            }
        }
    }

    fn heartbeat(&self, ping_seq: u64) -> Heartbeat {
        Heartbeat {
            machine_id: self.config.machine_id.clone(),
            status: "online".to_string(),
            agent_version: self.config.agent_version.clone(),
            timestamp: now_millis(),
            ping_seq,
            system_health: self.health.as_ref().map(|provider| provider()),
        }
    }

    async fn handle_frame(&self, frame: &[u8]) {
        self.counters.record_received(frame.len());

        let message = match Envelope::parse(frame).and_then(Envelope::decode) {
            Ok(message) => message,
            Err(e) => {
                self.counters.record_error();
                warn!(error = %e, "Discarding inbound frame");
                return;
            }
        };

        match message {
            ChannelMessage::Command(command) => self.dispatch_command(command).await,
            ChannelMessage::Ping(ping) => {
                let pong = self.heartbeat(ping.ping_seq);
                match self.write_envelope(Envelope::pong(&pong)).await {
                    Ok(()) => bump(&self.counters.pongs_sent),
                    Err(e) => warn!(error = %e, ping_seq = ping.ping_seq, "Pong failed"),
                }
            }
            ChannelMessage::Pong(pong) => {
                bump(&self.counters.pongs_received);
                debug!(ping_seq = pong.ping_seq, "Pong received");
            }
            ChannelMessage::Other(envelope) => {
                let kind = envelope.kind.clone();
                if let Err(e) = self.messages_tx.try_send(envelope) {
                    bump(&self.counters.messages_dropped);
                    warn!(kind = %kind, error = %e, "Message stream full, dropping frame");
                }
            }
        }
    }

    async fn dispatch_command(&self, mut command: Command) {
        if let Some(security) = &self.security {
            if let Err(e) = security.check_rate_limit(COMMAND_RATE_KEY).await {
                bump(&self.counters.messages_dropped);
                warn!(command_id = %command.id, error = %e, "Command rejected");
                return;
            }
            command.command = security.sanitize_input(&command.command);
            command.args = command
                .args
                .iter()
                .map(|arg| security.sanitize_input(arg))
                .collect();
        }

        let id = command.id.clone();
        if let Err(e) = self.commands_tx.try_send(command) {
            bump(&self.counters.messages_dropped);
            warn!(command_id = %id, error = %e, "Command stream full, dropping command");
        } else {
            debug!(command_id = %id, "Command dispatched");
        }
    }

    async fn write_envelope(
        &self,
        envelope: Result<Envelope, ChannelError>,
    ) -> Result<(), ChannelError> {
        self.write(&envelope?).await
    }

    async fn write(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        let text = envelope.encode()?;
        let len = text.len();
        let write_timeout = self.config.write_timeout;

        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(ChannelError::NotConnected)?;
        let result = match timeout(write_timeout, sink.send(Message::text(text))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ChannelError::from(e)),
            Err(_) => Err(ChannelError::WriteTimeout(write_timeout)),
        };
        drop(writer);

        match &result {
            Ok(()) => self.counters.record_sent(len),
            Err(_) => self.counters.record_error(),
        }
        result
    }

    async fn send_or_buffer(&self, envelope: Envelope) -> Result<Delivery, ChannelError> {
        if self.is_connected() {
            match self.write(&envelope).await {
                Ok(()) => return Ok(Delivery::Sent),
                Err(ChannelError::Serialization(e)) => return Err(ChannelError::Serialization(e)),
                Err(e) => warn!(kind = %envelope.kind, error = %e, "Send failed, buffering"),
            }
        }
        self.buffer(envelope).await;
        Ok(Delivery::Buffered)
    }

    async fn buffer(&self, envelope: Envelope) {
        let capacity = self.config.offline_buffer.max(1);
        let mut offline = self.offline.lock().await;
        while offline.len() >= capacity {
            if let Some(dropped) = offline.pop_front() {
                bump(&self.counters.messages_dropped);
                warn!(
                    kind = %dropped.kind,
                    id = %dropped.id,
                    "Offline buffer full, dropping oldest"
                );
            }
        }
        offline.push_back(envelope);
        bump(&self.counters.messages_buffered);
    }

    /// Deliver buffered envelopes in order, stopping at the first failure.
    async fn flush_offline(self: Arc<Self>) {
        let mut delivered = 0_usize;
        while self.is_connected() {
            let Some(envelope) = self.offline.lock().await.pop_front() else {
                break;
            };
            if let Err(e) = self.write(&envelope).await {
                warn!(error = %e, "Offline flush interrupted");
                let mut offline = self.offline.lock().await;
                offline.push_front(envelope);
                while offline.len() > self.config.offline_buffer.max(1) {
                    offline.pop_back();
                    bump(&self.counters.messages_dropped);
                }
                break;
            }
            delivered += 1;
        }
        if delivered > 0 {
            info!(delivered, "Flushed offline buffer");
        }
    }

    /// Tear down the session that owns `session` and schedule a reconnect.
    async fn handle_disconnect(self: &Arc<Self>, session: &CancellationToken, reason: &str) {
        let was_connected = self.state.send_if_modified(|state| {
            if state.is_connected() {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        session.cancel();
        if !was_connected {
            return;
        }

        self.writer.lock().await.take();
        self.counters.set_active(false);
        warn!(reason, "Channel connection lost");

        if self.should_reconnect() {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let Some(permit) = self.reconnect.try_acquire() else {
            debug!("Reconnect already in progress");
            return;
        };
        tokio::spawn(reconnect_task(Arc::clone(self), permit));
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        let backoff = self.config.reconnect_backoff();
        let mut attempt: u32 = 0;
        while backoff.should_retry(attempt) {
            self.set_state(ConnectionState::Reconnecting);
            let delay = backoff.delay_for_attempt(attempt);
            info!(attempt = attempt + 1, delay_ms = delay.as_millis(), "Reconnecting");

            tokio::select! {
                () = sleep(delay) => {}
                () = self.cancel.cancelled() => {
                    self.set_state(ConnectionState::Disconnected);
                    info!("Reconnect cancelled");
                    return;
                }
            }
            if self.closed.load(Ordering::Acquire) {
                self.set_state(ConnectionState::Disconnected);
                debug!("Channel closed during reconnect wait");
                return;
            }

            bump(&self.counters.reconnect_attempts);
            match Arc::clone(self).open().await {
                Ok(()) => {
                    bump(&self.counters.reconnects);
                    info!(attempt = attempt + 1, "Reconnected");
                    return;
                }
                Err(e) => {
                    bump(&self.counters.connect_failures);
                    self.counters.record_error();
                    warn!(attempt = attempt + 1, error = %e, "Reconnect attempt failed");
                }
            }
            attempt = attempt.saturating_add(1);
        }

        self.set_state(ConnectionState::GaveUp);
        error!(
            attempts = backoff.max_retries,
            "Giving up on channel reconnection"
        );
    }
}

// Boxed: connect, read and reconnect spawn each other, so one future in the
// cycle needs a concrete type.
fn reconnect_task(inner: Arc<Inner>, permit: ReconnectPermit) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        inner.reconnect_loop().await;
        drop(permit);
        // The fresh connection may have dropped while the permit was held
        if *inner.state.borrow() == ConnectionState::Disconnected && inner.should_reconnect() {
            inner.spawn_reconnect();
        }
    })
}
