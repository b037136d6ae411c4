//! Agent configuration
//!
//! Loaded once at startup from a JSON file and validated before any store
//! connection is attempted:
//! - store endpoint, bucket descriptor and retry bounds
//! - object root to stat and heartbeat interval
//! - static identity fields copied into every record

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::BackoffPolicy;
use crate::connection::ConnectionSettings;
use crate::record::Identity;
use crate::scheduler::SchedulerSettings;
use crate::store::mqtt::MqttSettings;
use crate::store::BucketDescriptor;

pub const DEFAULT_CONFIG_PATH: &str = "etc/config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("option is empty: {0}")]
    Empty(&'static str),

    #[error("heartbeat interval must be positive, got {0} ms")]
    InvalidInterval(i64),

    #[error("invalid retry bounds: {0}")]
    InvalidBackoff(String),

    #[error("{0} must be positive")]
    InvalidTimeout(&'static str),

    #[error("stale_after_ms ({stale_after_ms}) must exceed interval_ms ({interval_ms})")]
    InvalidStaleness {
        stale_after_ms: u64,
        interval_ms: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub datacenter: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub object_root: PathBuf,
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub zone_id: String,
    #[serde(default)]
    pub compute_id: String,
    #[serde(default)]
    pub storage_id: String,
    /// Signed so that a negative value is reported rather than rejected by the parser.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: i64,
    #[serde(default = "default_ping_port")]
    pub ping_port: u16,
    #[serde(default)]
    pub log_level: Option<String>,
    /// Age after which a successful heartbeat no longer counts as healthy.
    /// Defaults to three intervals.
    #[serde(default)]
    pub stale_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    pub bucket: BucketDescriptor,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_min_timeout_ms")]
    pub min_timeout_ms: u64,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_timeout_ms: default_min_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

fn default_interval_ms() -> i64 {
    30_000
}

fn default_ping_port() -> u16 {
    3030
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_topic_prefix() -> String {
    "minnow".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_read_timeout_ms() -> u64 {
    5_000
}

fn default_min_timeout_ms() -> u64 {
    2_000
}

fn default_max_timeout_ms() -> u64 {
    120_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl AgentConfig {
    /// Read and parse without validation.
    pub async fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Read, parse and validate.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read(path).await?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Everything needed to reach the store and locate a record.
    pub fn validate_store(&self) -> Result<(), ConfigError> {
        non_empty(&self.store.host, "store.host")?;
        non_empty(&self.store.bucket.name, "store.bucket.name")?;
        non_empty(&self.domain, "domain")?;
        if self.store.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("store.connect_timeout_ms"));
        }
        if self.store.read_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("store.read_timeout_ms"));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_store()?;
        non_empty(&self.datacenter, "datacenter")?;
        if self.object_root.as_os_str().is_empty() {
            return Err(ConfigError::Empty("object_root"));
        }
        non_empty(&self.server_id, "server_id")?;
        non_empty(&self.zone_id, "zone_id")?;
        non_empty(&self.compute_id, "compute_id")?;
        non_empty(&self.storage_id, "storage_id")?;

        if self.interval_ms <= 0 {
            return Err(ConfigError::InvalidInterval(self.interval_ms));
        }
        if self.store.write_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout("store.write_timeout_ms"));
        }
        if let Some(stale_after_ms) = self.stale_after_ms {
            if stale_after_ms <= self.interval_ms as u64 {
                return Err(ConfigError::InvalidStaleness {
                    stale_after_ms,
                    interval_ms: self.interval_ms,
                });
            }
        }

        let retry = &self.store.retry;
        if retry.min_timeout_ms == 0 {
            return Err(ConfigError::InvalidBackoff("min_timeout_ms must be positive".into()));
        }
        if retry.max_timeout_ms < retry.min_timeout_ms {
            return Err(ConfigError::InvalidBackoff(format!(
                "max_timeout_ms ({}) is below min_timeout_ms ({})",
                retry.max_timeout_ms, retry.min_timeout_ms
            )));
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoff(format!(
                "multiplier must be at least 1, got {}",
                retry.multiplier
            )));
        }
        Ok(())
    }

    /// Heartbeat interval. Only meaningful after [`validate`](Self::validate).
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(0) as u64)
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.interval() * 3)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            min: Duration::from_millis(self.store.retry.min_timeout_ms),
            max: Duration::from_millis(self.store.retry.max_timeout_ms),
            multiplier: self.store.retry.multiplier,
            jitter: self.store.retry.jitter,
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            bucket: self.store.bucket.clone(),
            backoff: self.backoff(),
            connect_timeout: Duration::from_millis(self.store.connect_timeout_ms),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            interval: self.interval(),
            object_root: self.object_root.clone(),
            write_timeout: Duration::from_millis(self.store.write_timeout_ms),
        }
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.store.host.clone(),
            port: self.store.port,
            client_id: self.store.client_id.clone(),
            keep_alive: Duration::from_secs(self.store.keep_alive_secs.max(5)),
            topic_prefix: self.store.topic_prefix.clone(),
            read_timeout: Duration::from_millis(self.store.read_timeout_ms),
        }
    }

    /// Store key for `host`: `<host>.<domain>`.
    pub fn record_key(&self, host: &str) -> String {
        format!("{}.{}", host, self.domain)
    }

    pub fn identity(&self, host: &str) -> Identity {
        Identity {
            hostname: self.record_key(host),
            datacenter: self.datacenter.clone(),
            server_id: self.server_id.clone(),
            zone_id: self.zone_id.clone(),
            compute_id: self.compute_id.clone(),
            storage_id: self.storage_id.clone(),
        }
    }
}

fn non_empty(value: &str, label: &'static str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::Empty(label))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "store": {
            "host": "store.example.com",
            "bucket": { "name": "manta_storage", "index": { "hostname": { "type": "string" } } }
        },
        "datacenter": "us-east-1",
        "domain": "stor.example.com",
        "object_root": "/manta",
        "server_id": "44454c4c-4700-1034-804a-b2c04f354d31",
        "zone_id": "c1f3d7a2-6ad5-4d9e-b1d4-6fbd2f1f3c1e",
        "compute_id": "12.cn.us-east.example.com",
        "storage_id": "1.stor.us-east.example.com"
    }"#;

    #[test]
    fn test_defaults_applied() {
        let config = AgentConfig::parse(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.interval(), Duration::from_secs(30));
        assert_eq!(config.ping_port, 3030);
        assert_eq!(config.store.port, 1883);
        assert_eq!(config.stale_after(), Duration::from_secs(90));

        let backoff = config.backoff();
        assert_eq!(backoff.min, Duration::from_secs(2));
        assert_eq!(backoff.max, Duration::from_secs(120));
        assert!(!backoff.jitter);
    }

    #[test]
    fn test_identity_and_key() {
        let config = AgentConfig::parse(SAMPLE).unwrap();
        let identity = config.identity("c1f3d7a2");
        assert_eq!(identity.key(), "c1f3d7a2.stor.example.com");
        assert_eq!(identity.datacenter, "us-east-1");
        assert_eq!(identity.storage_id, "1.stor.us-east.example.com");
    }

    #[test]
    fn test_zero_or_negative_interval_rejected() {
        for interval in [0, -1, -30_000] {
            let mut config = AgentConfig::parse(SAMPLE).unwrap();
            config.interval_ms = interval;
            match config.validate() {
                Err(ConfigError::InvalidInterval(got)) => assert_eq!(got, interval),
                other => panic!("expected invalid interval, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_negative_interval_parses_then_fails_validation() {
        let raw = SAMPLE.replacen('{', r#"{ "interval_ms": -5,"#, 1);
        let config = AgentConfig::parse(&raw).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidInterval(-5))));
    }

    #[test]
    fn test_stale_bound_must_exceed_interval() {
        for stale_after_ms in [0, 1, 30_000] {
            let mut config = AgentConfig::parse(SAMPLE).unwrap();
            config.stale_after_ms = Some(stale_after_ms);
            match config.validate() {
                Err(ConfigError::InvalidStaleness { stale_after_ms: got, interval_ms }) => {
                    assert_eq!(got, stale_after_ms);
                    assert_eq!(interval_ms, 30_000);
                }
                other => panic!("expected invalid staleness bound, got {other:?}"),
            }
        }

        let mut config = AgentConfig::parse(SAMPLE).unwrap();
        config.stale_after_ms = Some(30_001);
        config.validate().unwrap();
        assert_eq!(config.stale_after(), Duration::from_millis(30_001));
    }

    #[test]
    fn test_empty_identity_field_rejected() {
        let mut config = AgentConfig::parse(SAMPLE).unwrap();
        config.zone_id = "  ".into();
        assert!(matches!(config.validate(), Err(ConfigError::Empty("zone_id"))));

        let raw = SAMPLE.replace(r#""datacenter": "us-east-1","#, "");
        let config = AgentConfig::parse(&raw).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Empty("datacenter"))));
    }

    #[test]
    fn test_backoff_bounds_checked() {
        let mut config = AgentConfig::parse(SAMPLE).unwrap();
        config.store.retry.max_timeout_ms = 1_000;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBackoff(_))));

        let mut config = AgentConfig::parse(SAMPLE).unwrap();
        config.store.retry.multiplier = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBackoff(_))));
    }

    #[test]
    fn test_store_only_validation_ignores_identity() {
        let raw = r#"{
            "store": { "host": "store", "bucket": { "name": "manta_storage" } },
            "domain": "example.com"
        }"#;
        let config = AgentConfig::parse(raw).unwrap();
        config.validate_store().unwrap();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = AgentConfig::load(file.path()).await.unwrap();
        assert_eq!(config.store.bucket.name, "manta_storage");
        assert!(config.store.bucket.index.contains_key("hostname"));
    }

    #[tokio::test]
    async fn test_missing_file_reports_path() {
        let err = AgentConfig::load(Path::new("/nonexistent/minnow.json")).await.unwrap_err();
        assert!(err.to_string().contains("/nonexistent/minnow.json"));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(AgentConfig::parse("{ not json"), Err(ConfigError::Parse(_))));
    }
}
