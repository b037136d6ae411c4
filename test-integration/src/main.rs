//! Live smoke test: provision a scratch bucket on a running broker, write a
//! heartbeat record and read it back.
//!
//! Broker address from `MQTT_BROKER` / `MQTT_PORT` (default 127.0.0.1:1883).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use minnow_agent::stats::RawFsStat;
use minnow_agent::store::mqtt::{MqttSettings, MqttStore};
use minnow_agent::{
    BucketDescriptor, EventSink, HeartbeatRecord, Identity, StoreClient, StoreSession,
};

const BUCKET: &str = "minnow_smoke";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let host = std::env::var("MQTT_BROKER").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = match std::env::var("MQTT_PORT") {
        Ok(port) => port.parse().context("MQTT_PORT is not a port number")?,
        Err(_) => 1883,
    };

    let store = MqttStore::new(MqttSettings {
        host: host.clone(),
        port,
        client_id: None,
        keep_alive: Duration::from_secs(30),
        topic_prefix: "minnow-smoke".to_string(),
        read_timeout: Duration::from_secs(5),
    });

    info!(%host, port, "connecting");
    let session: Arc<dyn StoreSession> =
        tokio::time::timeout(Duration::from_secs(10), store.connect(EventSink::detached()))
            .await
            .context("connect timed out")?
            .context("connect failed")?;

    let bucket = BucketDescriptor {
        name: BUCKET.to_string(),
        index: Default::default(),
        options: None,
    };
    session.provision(&bucket).await.context("provision failed")?;
    session.provision(&bucket).await.context("second provision failed")?;
    info!(bucket = BUCKET, "bucket provisioned twice");

    let identity = Identity {
        hostname: "smoke.minnow.test".to_string(),
        datacenter: "smoke".to_string(),
        server_id: "smoke-server".to_string(),
        zone_id: "smoke-zone".to_string(),
        compute_id: "smoke-compute".to_string(),
        storage_id: "smoke-storage".to_string(),
    };
    let raw = RawFsStat {
        blocks_available: 128_000,
        blocks: 256_000,
        fragment_size: 4096,
    };
    let usage = raw.usage(Path::new("/smoke"), chrono::Utc::now().timestamp_millis())?;
    let record = HeartbeatRecord::new(&identity, usage);

    session
        .put_object(BUCKET, identity.key(), serde_json::to_value(&record)?)
        .await
        .context("write failed")?;
    info!(key = identity.key(), "record written");

    let stored = session.get_object(BUCKET, identity.key()).await.context("read failed")?;
    session.close().await;

    match stored {
        Some(value) if value == serde_json::to_value(&record)? => {
            info!("record read back intact");
            Ok(())
        }
        Some(value) => bail!("record mismatch: {value}"),
        None => bail!("record not found after write"),
    }
}
