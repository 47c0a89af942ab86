#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end agent run against a local HTTP backend and WebSocket server,
//! plus monitor verdicts over real components.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::routing::post;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_util::sync::CancellationToken;

use hostlink_agent::agent::{Agent, AgentOptions};
use hostlink_agent::channel::{ChannelClient, ChannelConfig};
use hostlink_agent::command::UnsupportedExecutor;
use hostlink_agent::monitor::{HealthStatus, Monitor, MonitorConfig, components};
use hostlink_agent::queue::MessageQueue;
use hostlink_agent::system::{SystemHealth, fixed_provider};
use hostlink_agent::transport::endpoints;
use hostlink_core::Config;

const WAIT: Duration = Duration::from_secs(5);
const ISSUED_TOKEN: &str = "issued-token";

#[derive(Clone, Default)]
struct Counts {
    registrations: Arc<AtomicUsize>,
    /// Heartbeats that carried the issued bearer token.
    heartbeats: Arc<AtomicUsize>,
}

async fn register(State(counts): State<Counts>) -> Json<Value> {
    counts.registrations.fetch_add(1, Ordering::SeqCst);
    Json(json!({"agent_id": "a-1", "token": ISSUED_TOKEN}))
}

async fn heartbeat(State(counts): State<Counts>, headers: HeaderMap) -> Json<Value> {
    let expected = format!("Bearer {ISSUED_TOKEN}");
    if headers.get(AUTHORIZATION).is_some_and(|v| v.as_bytes() == expected.as_bytes()) {
        counts.heartbeats.fetch_add(1, Ordering::SeqCst);
    }
    Json(json!({}))
}

async fn serve_api(counts: Counts) -> String {
    let app = Router::new()
        .route(endpoints::REGISTER, post(register))
        .route(endpoints::HEARTBEAT, post(heartbeat))
        .with_state(counts);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}

#[tokio::test]
async fn agent_registers_runs_commands_and_stops() {
    let counts = Counts::default();
    let api_url = serve_api(counts.clone()).await;
    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let channel_url = format!("ws://{}/ws/agent", ws_listener.local_addr().unwrap());

    let mut config = Config::default();
    config.server.api_url = Some(api_url);
    config.server.channel_url = Some(channel_url);
    config.server.machine_id = Some("m-1".into());
    config.transport.heartbeat_interval_secs = 1;
    config.transport.drain_interval_secs = 1;

    let cancel = CancellationToken::new();
    let options = AgentOptions {
        agent_version: "1.0.0".into(),
        allow_insecure: true,
        executor: Arc::new(UnsupportedExecutor::new("m-1")),
        health: fixed_provider(SystemHealth::default()),
        cancel: cancel.clone(),
    };
    let (agent, receivers) = Agent::new(config, options).unwrap();
    let run = tokio::spawn(Arc::clone(&agent).run(receivers));

    let (stream, _) = timeout(WAIT, ws_listener.accept()).await.unwrap().unwrap();
    let mut handshake_auth = None;
    let mut ws = accept_hdr_async(stream, |request: &Request, response: Response| {
        handshake_auth = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Ok(response)
    })
    .await
    .unwrap();
    assert_eq!(counts.registrations.load(Ordering::SeqCst), 1);
    assert_eq!(handshake_auth.as_deref(), Some("Bearer issued-token"));

    let command = json!({
        "type": "command",
        "id": "e-1",
        "timestamp": 0,
        "data": {"id": "c-1", "type": "reboot", "command": "reboot"}
    });
    ws.send(Message::text(command.to_string())).await.unwrap();

    let reply: Value = loop {
        let frame = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = frame {
            break serde_json::from_str(text.as_str()).unwrap();
        }
    };
    assert_eq!(reply["type"], "command_result");
    assert_eq!(reply["data"]["command_id"], "c-1");
    assert_eq!(reply["data"]["status"], "rejected");

    timeout(WAIT, async {
        while counts.heartbeats.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    timeout(WAIT, run).await.unwrap().unwrap();
    assert!(!agent.channel().is_connected());
    assert!(agent.queue().is_empty().await);
}

#[tokio::test]
async fn monitor_flags_channel_without_connections() {
    let config = ChannelConfig::new("ws://127.0.0.1:9/ws", "m-1", "1.0.0");
    let (channel, _rx) = ChannelClient::new(config);
    let monitor = Monitor::new(MonitorConfig::default())
        .with_channel(channel)
        .with_queue(Arc::new(MessageQueue::in_memory()))
        .with_system(fixed_provider(SystemHealth {
            cpu_percent: 5.0,
            memory_percent: 20.0,
            ..Default::default()
        }));

    let check = monitor.check_health().await;
    let channel = check
        .components
        .iter()
        .find(|c| c.name == components::CHANNEL)
        .unwrap();
    assert_eq!(channel.status, HealthStatus::Unhealthy);

    let issue = check
        .issues
        .iter()
        .find(|i| i.component == components::CHANNEL)
        .unwrap();
    assert_eq!(issue.description, "no active connections");

    let queue = check
        .components
        .iter()
        .find(|c| c.name == components::QUEUE)
        .unwrap();
    assert_eq!(queue.status, HealthStatus::Healthy);
}
