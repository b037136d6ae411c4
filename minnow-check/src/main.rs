//! check-minnow - verify a node's heartbeat record
//!
//! Connects once to the store (no retry), reads the record for this host and
//! exits non-zero when it is missing, malformed, stamped in the future or
//! older than the allowed age.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use minnow_agent::config::DEFAULT_CONFIG_PATH;
use minnow_agent::store::mqtt::MqttStore;
use minnow_agent::{AgentConfig, EventSink, StoreClient, StoreSession};

#[derive(Debug, Parser)]
#[command(
    name = "check-minnow",
    version,
    about = "Check that this node's heartbeat record is fresh"
)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    file: PathBuf,

    /// Maximum record age in seconds
    #[arg(short = 'a', long = "max-age", default_value_t = 900)]
    max_age: u64,

    /// Record key (defaults to <hostname>.<domain>)
    #[arg(short, long)]
    key: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
enum FreshnessError {
    #[error("no heartbeat record for {0}")]
    Missing(String),

    #[error("heartbeat record is malformed: {0}")]
    Malformed(String),

    #[error("heartbeat timestamp {timestamp_ms} is in the future (now {now_ms})")]
    Future { timestamp_ms: i64, now_ms: i64 },

    #[error("heartbeat is {age_secs}s old, limit is {max_age_secs}s")]
    Stale { age_secs: u64, max_age_secs: u64 },
}

/// Age of `record` at `now_ms`, or why it does not count as fresh.
fn check_freshness(
    key: &str,
    record: Option<&Value>,
    now_ms: i64,
    max_age: Duration,
) -> Result<Duration, FreshnessError> {
    let record = record.ok_or_else(|| FreshnessError::Missing(key.to_string()))?;
    let timestamp_ms = record
        .get("timestamp")
        .ok_or_else(|| FreshnessError::Malformed("missing timestamp".into()))?
        .as_i64()
        .ok_or_else(|| FreshnessError::Malformed("timestamp is not an integer".into()))?;

    if timestamp_ms > now_ms {
        return Err(FreshnessError::Future { timestamp_ms, now_ms });
    }
    let age_ms = now_ms.checked_sub(timestamp_ms).ok_or_else(|| {
        FreshnessError::Malformed(format!("timestamp {timestamp_ms} is out of range"))
    })?;
    let age = Duration::from_millis(age_ms as u64);
    if age > max_age {
        return Err(FreshnessError::Stale {
            age_secs: age.as_secs(),
            max_age_secs: max_age.as_secs(),
        });
    }
    Ok(age)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = AgentConfig::read(&args.file)
        .await
        .with_context(|| format!("failed to load {}", args.file.display()))?;
    config.validate_store().context("invalid store configuration")?;

    let key = match args.key {
        Some(key) => key,
        None => {
            let host = gethostname::gethostname()
                .into_string()
                .map_err(|raw| anyhow!("host name is not valid UTF-8: {raw:?}"))?;
            config.record_key(&host)
        }
    };

    let store = MqttStore::new(config.mqtt_settings());
    let connect_timeout = Duration::from_millis(config.store.connect_timeout_ms);
    let session = tokio::time::timeout(connect_timeout, store.connect(EventSink::detached()))
        .await
        .map_err(|_| anyhow!("store connect timed out after {connect_timeout:?}"))?
        .context("failed to connect to store")?;

    debug!(bucket = %config.store.bucket.name, %key, "reading heartbeat record");
    let fetched = session.get_object(&config.store.bucket.name, &key).await;
    session.close().await;
    let record = fetched.with_context(|| format!("failed to read {key}"))?;

    let now_ms = chrono::Utc::now().timestamp_millis();
    let age = check_freshness(&key, record.as_ref(), now_ms, Duration::from_secs(args.max_age))?;
    info!(%key, age_secs = age.as_secs(), "heartbeat is fresh");
    if let Some(record) = record {
        println!("{record}");
    }
    Ok(())
}
