/*!
Test harness for the heartbeat agent

Wires a [`MemoryStore`], a [`ScriptedStats`] source, the store connection and
the heartbeat scheduler together the way the daemon does, and offers
assertions over what reached the store. Meant for tokio's paused clock
(`#[tokio::test(start_paused = true)]`): every wait is bounded by
[`tokio::time::timeout`] so time advances on its own.
*/

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use minnow_agent::connection::ConnectionSettings;
use minnow_agent::http::ProbeState;
use minnow_agent::scheduler::SchedulerSettings;
use minnow_agent::{
    BackoffPolicy, BucketDescriptor, ConnectionHandle, ConnectionState, HealthExporter,
    HeartbeatScheduler, Identity, StatCollector, StoreConnection,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::info;

use crate::stat_stub::ScriptedStats;
use crate::store_stub::MemoryStore;

pub const TEST_BUCKET: &str = "manta_storage";

pub fn test_identity() -> Identity {
    Identity {
        hostname: "stor-01.example.com".into(),
        datacenter: "us-east-1".into(),
        server_id: "44454c4c-5000-104d-8037-b7c04f5a5131".into(),
        zone_id: "f3b5a5e8-2b86-4f3c-9c9a-2f7c1c1a0c3e".into(),
        compute_id: "cn-01".into(),
        storage_id: "1.stor.us-east-1.example.com".into(),
    }
}

pub fn test_bucket() -> BucketDescriptor {
    let mut index = serde_json::Map::new();
    index.insert("hostname".into(), serde_json::json!({ "type": "string" }));
    BucketDescriptor {
        name: TEST_BUCKET.into(),
        index,
        options: None,
    }
}

/// Log to the test writer; `RUST_LOG` selects what is shown.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub struct HarnessBuilder {
    store: MemoryStore,
    stats: Arc<ScriptedStats>,
    identity: Identity,
    bucket: BucketDescriptor,
    interval: Duration,
    backoff: BackoffPolicy,
    connect_timeout: Duration,
    write_timeout: Duration,
    stale_after: Option<Duration>,
    autostart: bool,
}

impl HarnessBuilder {
    /// Use a store prepared (scripted) by the caller.
    pub fn store(mut self, store: MemoryStore) -> Self {
        self.store = store;
        self
    }

    pub fn stats(mut self, stats: Arc<ScriptedStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn stale_after(mut self, bound: Duration) -> Self {
        self.stale_after = Some(bound);
        self
    }

    /// Leave the connection Disconnected until `harness.connection.start()`.
    pub fn manual_start(mut self) -> Self {
        self.autostart = false;
        self
    }

    /// Spawn the connection manager and the scheduler. Needs a runtime.
    pub fn build(self) -> Result<TestHarness> {
        init_tracing();

        let settings = ConnectionSettings {
            bucket: self.bucket.clone(),
            backoff: self.backoff,
            connect_timeout: self.connect_timeout,
        };
        let (connection, handle) = StoreConnection::new(Arc::new(self.store.clone()), settings);
        let connection_task = tokio::spawn(connection.run());

        let (recorder, health) = HealthExporter::new(self.stale_after);
        let scheduler = HeartbeatScheduler::new(
            SchedulerSettings {
                interval: self.interval,
                object_root: PathBuf::from("/manta"),
                write_timeout: self.write_timeout,
            },
            StatCollector::new(self.stats.clone()),
            self.identity.clone(),
            recorder,
            handle.clone(),
        )?;
        let scheduler_task = scheduler.spawn();

        if self.autostart {
            handle.start();
        }
        info!(interval_ms = self.interval.as_millis() as u64, "test harness started");

        Ok(TestHarness {
            store: self.store,
            stats: self.stats,
            connection: handle,
            health,
            identity: self.identity,
            bucket: self.bucket.name,
            connection_task,
            scheduler_task,
        })
    }
}

/// A running agent against in-memory collaborators.
pub struct TestHarness {
    pub store: MemoryStore,
    pub stats: Arc<ScriptedStats>,
    pub connection: ConnectionHandle,
    pub health: HealthExporter,
    pub identity: Identity,
    pub bucket: String,
    connection_task: JoinHandle<()>,
    scheduler_task: JoinHandle<()>,
}

impl TestHarness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            store: MemoryStore::new(),
            stats: Arc::new(ScriptedStats::half_full()),
            identity: test_identity(),
            bucket: test_bucket(),
            interval: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            stale_after: None,
            autostart: true,
        }
    }

    /// Default harness, connection started.
    pub fn start() -> Result<Self> {
        Self::builder().build()
    }

    pub fn probe(&self) -> ProbeState {
        ProbeState {
            health: self.health.clone(),
            connection: self.connection.clone(),
        }
    }

    /// Wait, in virtual time, until the connection reaches `state`.
    pub async fn wait_for_state(&self, state: ConnectionState, within: Duration) -> Result<()> {
        let mut status = self.connection.watch_status();
        let outcome = tokio::time::timeout(within, status.wait_for(|s| s.state == state))
            .await
            .map(|reached| reached.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => bail!("connection manager stopped before reaching {state:?}"),
            Err(_) => Err(anyhow!(
                "connection still {:?} after {within:?}, expected {state:?}",
                self.connection.state()
            )),
        }
    }

    /// Wait until at least `count` heartbeats reached the store.
    pub async fn wait_for_puts(&self, count: usize, within: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + within;
        while self.store.puts().len() < count {
            if tokio::time::Instant::now() >= deadline {
                bail!("{} heartbeats after {within:?}, expected {count}", self.store.puts().len());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    /// This node's record as currently stored.
    pub fn last_record(&self) -> Option<Value> {
        self.store.object(&self.bucket, self.identity.key())
    }

    /// Assert a (dot-separated) field of the stored record.
    pub fn assert_field_equals(&self, field_path: &str, expected: &Value) -> Result<()> {
        let Some(record) = self.last_record() else {
            bail!("no record stored for {}", self.identity.key());
        };
        match get_nested_field(&record, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => {
                bail!("field '{field_path}' mismatch: expected {expected:?}, got {actual:?}")
            }
            None => bail!("field '{field_path}' not found in stored record"),
        }
    }

    /// Stop the connection manager and wait for both tasks to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.connection.shutdown();
        self.connection_task.await?;
        self.scheduler_task.await?;
        Ok(())
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        match current {
            Value::Object(obj) => current = obj.get(part)?,
            _ => return None,
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_field_lookup() {
        let value = json!({ "a": { "b": 3 }, "c": "x" });
        assert_eq!(get_nested_field(&value, "a.b"), Some(&json!(3)));
        assert_eq!(get_nested_field(&value, "c"), Some(&json!("x")));
        assert_eq!(get_nested_field(&value, "c.d"), None);
        assert_eq!(get_nested_field(&value, "missing"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_harness_reaches_active_and_writes() {
        let harness = TestHarness::start().unwrap();
        harness
            .wait_for_state(ConnectionState::Active, Duration::from_secs(1))
            .await
            .unwrap();
        harness.wait_for_puts(1, Duration::from_secs(1)).await.unwrap();

        harness.assert_field_equals("hostname", &json!("stor-01.example.com")).unwrap();
        harness.assert_field_equals("availableMB", &json!(512)).unwrap();
        harness.assert_field_equals("percentUsed", &json!(50)).unwrap();
        assert!(harness.assert_field_equals("percentUsed", &json!(51)).is_err());

        harness.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_state_times_out_while_connect_held() {
        let store = MemoryStore::new();
        store.hold_connects();
        let harness = TestHarness::builder()
            .store(store.clone())
            .connect_timeout(Duration::from_secs(600))
            .build()
            .unwrap();

        let err = harness
            .wait_for_state(ConnectionState::Active, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("still Connecting"), "{err}");

        store.release_connects();
        harness
            .wait_for_state(ConnectionState::Active, Duration::from_secs(1))
            .await
            .unwrap();

        harness.shutdown().await.unwrap();
    }
}
