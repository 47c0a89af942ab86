//! Hostlink Agent
//!
//! Registers the host with the backend, keeps a persistent channel open for
//! commands, and delivers heartbeats and results reliably.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use hostlink_agent::agent::{Agent, AgentOptions};
use hostlink_agent::command::UnsupportedExecutor;
use hostlink_agent::system::SystemProbe;
use hostlink_core::config::load_config;

#[derive(Parser, Debug)]
#[command(name = "hostlink-agent")]
#[command(version, about = "Hostlink agent - resilient link between a host and its backend")]
struct Args {
    /// Config file layered over the global settings file
    #[arg(long, env = "HOSTLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Backend HTTP API base URL (e.g. "https://backend.example.com")
    #[arg(long, env = "HOSTLINK_API_URL")]
    api_url: Option<String>,

    /// Backend WebSocket URL (e.g. "wss://backend.example.com/ws/agent")
    #[arg(long, env = "HOSTLINK_CHANNEL_URL")]
    channel_url: Option<String>,

    /// Machine ID; generated when absent
    #[arg(long, env = "HOSTLINK_MACHINE_ID")]
    machine_id: Option<String>,

    /// Bearer token for the API and channel
    #[arg(long, env = "HOSTLINK_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Message queue snapshot file
    #[arg(long, env = "HOSTLINK_QUEUE_PATH")]
    queue_path: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, env = "HOSTLINK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "HOSTLINK_LOG_JSON")]
    log_json: bool,

    /// Accept http/ws URLs and private hosts. Development only.
    #[arg(long, env = "HOSTLINK_ALLOW_INSECURE")]
    allow_insecure: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(url) = args.api_url {
        config.server.api_url = Some(url);
    }
    if let Some(url) = args.channel_url {
        config.server.channel_url = Some(url);
    }
    if let Some(id) = args.machine_id {
        config.server.machine_id = Some(id);
    }
    if let Some(token) = args.auth_token {
        config.server.auth_token = Some(token);
    }
    if let Some(path) = args.queue_path {
        config.queue.path = Some(path);
    }
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }
    if config.queue.path.is_none() {
        config.queue.path = Some(default_queue_path()?);
    }
    config.validate()?;

    hostlink_core::tracing_init::init_tracing(&config.server.log_level, args.log_json)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        api_url = config.server.api_url.as_deref().unwrap_or("-"),
        channel_url = config.server.channel_url.as_deref().unwrap_or("-"),
        insecure = args.allow_insecure,
        "Starting hostlink-agent"
    );
    if let Some(path) = &config.queue.path {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!(path = %path.display(), "Using message queue");
    }

    let machine_id = config.machine_id_or_generate();
    let cancel = CancellationToken::new();
    let options = AgentOptions {
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        allow_insecure: args.allow_insecure,
        executor: Arc::new(UnsupportedExecutor::new(&machine_id)),
        health: Arc::new(SystemProbe::new()).provider(),
        cancel: cancel.clone(),
    };
    let (agent, receivers) = Agent::new(config, options)?;

    let run = tokio::spawn(Arc::clone(&agent).run(receivers));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
        _ = sigterm_future => info!("Received SIGTERM shutdown signal"),
    }

    cancel.cancel();
    run.await?;
    Ok(())
}

/// Default queue snapshot: ~/.hostlink/queue.json
fn default_queue_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".hostlink").join("queue.json"))
}
