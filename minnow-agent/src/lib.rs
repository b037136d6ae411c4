//! Minnow - storage heartbeat agent
//!
//! Periodically measures the capacity of the object-storage filesystem and
//! publishes it as a timestamped record to an MQTT-backed key-value store:
//! - Store connection lifecycle (connect, provision bucket, reconnect with backoff)
//! - Heartbeat scheduling gated on connection health
//! - Filesystem statistics via statvfs(2)
//! - Liveness probe over HTTP

pub mod backoff;
pub mod config;
pub mod connection;
pub mod health;
pub mod http;
pub mod record;
pub mod scheduler;
pub mod stats;
pub mod store;

pub use backoff::BackoffPolicy;
pub use config::{AgentConfig, ConfigError};
pub use connection::{ConnectionHandle, ConnectionState, StoreConnection};
pub use health::{HealthExporter, HealthRecorder, HealthStatus};
pub use record::{HeartbeatRecord, Identity};
pub use scheduler::HeartbeatScheduler;
pub use stats::{StatCollector, StatFailure, StatSource, Statvfs, UsageSnapshot};
pub use store::{
    ActiveStore, BucketDescriptor, EventSink, StoreClient, StoreError, StoreEvent, StoreSession,
};
