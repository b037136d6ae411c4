//! Minnow - storage heartbeat agent
//!
//! Reports object-root capacity to the store every interval and exposes a
//! liveness probe that turns 503 when the last heartbeat write failed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use minnow_agent::config::DEFAULT_CONFIG_PATH;
use minnow_agent::http::{self, ProbeState};
use minnow_agent::store::mqtt::MqttStore;
use minnow_agent::{
    AgentConfig, ConnectionHandle, HealthExporter, HeartbeatScheduler, Identity, StatCollector,
    StoreClient, StoreConnection,
};

#[derive(Debug, Parser)]
#[command(name = "minnow", version, about = "Storage capacity heartbeat agent")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    file: PathBuf,

    /// Raise log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Move a plain level `steps` towards trace. Directive strings pass through.
fn raise_level(level: &str, steps: u8) -> String {
    let level = level.trim().to_ascii_lowercase();
    match LEVELS.iter().position(|l| *l == level) {
        Some(i) => LEVELS[(i + steps as usize).min(LEVELS.len() - 1)].to_string(),
        None => level,
    }
}

fn init_logging(verbose: u8, configured: Option<&str>) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => {
            let base = std::env::var("LOG_LEVEL")
                .ok()
                .filter(|level| !level.trim().is_empty())
                .or_else(|| configured.map(str::to_string))
                .unwrap_or_else(|| "info".to_string());
            EnvFilter::new(raise_level(&base, verbose))
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

struct Running {
    connection: ConnectionHandle,
    health: HealthExporter,
    connection_task: JoinHandle<()>,
    scheduler_task: JoinHandle<()>,
}

/// Wire the connection manager and the scheduler. The scheduler is built
/// first: a schedule it rejects never leads to a connect attempt.
fn start_heartbeats(
    config: &AgentConfig,
    identity: Identity,
    store: Arc<dyn StoreClient>,
    stats: StatCollector,
) -> Result<Running> {
    let (manager, connection) = StoreConnection::new(store, config.connection_settings());
    let (recorder, health) = HealthExporter::new(Some(config.stale_after()));
    let scheduler = HeartbeatScheduler::new(
        config.scheduler_settings(),
        stats,
        identity,
        recorder,
        connection.clone(),
    )
    .context("failed to create heartbeat scheduler")?;

    let connection_task = tokio::spawn(manager.run());
    let scheduler_task = scheduler.spawn();
    connection.start();
    Ok(Running {
        connection,
        health,
        connection_task,
        scheduler_task,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loaded = AgentConfig::load(&args.file).await;
    init_logging(args.verbose, loaded.as_ref().ok().and_then(|c| c.log_level.as_deref()));
    let config =
        loaded.with_context(|| format!("invalid configuration in {}", args.file.display()))?;

    let host = gethostname::gethostname()
        .into_string()
        .map_err(|raw| anyhow!("host name is not valid UTF-8: {raw:?}"))?;
    let identity = config.identity(&host);
    info!(
        key = identity.key(),
        bucket = %config.store.bucket.name,
        object_root = %config.object_root.display(),
        interval_ms = config.interval_ms,
        "minnow starting"
    );

    let store = Arc::new(MqttStore::new(config.mqtt_settings()));
    let Running {
        connection,
        health,
        connection_task,
        scheduler_task,
    } = start_heartbeats(&config, identity, store, StatCollector::statvfs())?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.ping_port));
    let probe = ProbeState {
        health,
        connection: connection.clone(),
    };
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(http::serve(addr, probe, async move {
        let _ = stop_rx.await;
    }));

    let mut server_done = false;
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => signal.context("failed to listen for ctrl-c"),
        served = &mut server => {
            server_done = true;
            match served {
                Ok(Ok(())) => Err(anyhow!("health probe stopped unexpectedly")),
                Ok(Err(e)) => {
                    Err(anyhow::Error::new(e).context(format!("health probe failed on {addr}")))
                }
                Err(e) => Err(anyhow::Error::new(e).context("health probe task failed")),
            }
        }
    };

    info!("shutting down");
    connection.shutdown();
    let _ = stop_tx.send(());
    if let Err(e) = connection_task.await {
        error!(error = %e, "store connection task failed");
    }
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "heartbeat scheduler task failed");
    }
    if !server_done {
        match server.await {
            Ok(Err(e)) => error!(error = %e, "health probe failed"),
            Err(e) => error!(error = %e, "health probe task failed"),
            Ok(Ok(())) => {}
        }
    }
    outcome
}
