//! Key-value store client contract
//!
//! The connection manager only depends on these traits:
//! - [`StoreClient`] opens sessions and reports their lifecycle through an [`EventSink`]
//! - [`StoreSession`] provisions buckets and reads/writes objects
//!
//! [`mqtt::MqttStore`] is the production implementation.

pub mod mqtt;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::connection::{ConnectionEvent, Envelope};

/// Bucket (namespace) to provision on every successful connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketDescriptor {
    pub name: String,
    /// Index/schema definition, stored verbatim.
    #[serde(default)]
    pub index: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("provision bucket {bucket} failed: {reason}")]
    Provision { bucket: String, reason: String },

    #[error("write {key} failed: {reason}")]
    Write { key: String, reason: String },

    #[error("read {key} failed: {reason}")]
    Read { key: String, reason: String },

    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the error means the session itself is gone, as opposed to a
    /// single rejected request.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            StoreError::Closed
                | StoreError::Timeout(_)
                | StoreError::Transport(_)
                | StoreError::Connect(_)
        )
    }
}

/// Lifecycle events a session may raise after it was established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Error(String),
    Closed,
}

/// Where a session reports lifecycle events. Tagged with the connection
/// attempt that created it so late events from old sessions are discarded.
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventSink {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { epoch, tx }
    }

    /// Sink whose events go nowhere, for one-shot tools that do not reconnect.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { epoch: 0, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn emit(&self, event: StoreEvent) {
        let event = match event {
            StoreEvent::Error(cause) => ConnectionEvent::Errored(cause),
            StoreEvent::Closed => ConnectionEvent::Closed,
        };
        // the connection manager is gone on shutdown; nothing left to notify
        let _ = self.tx.send(Envelope::tagged(self.epoch, event));
    }
}

#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    /// Open a new session. Resolves once the store accepted the connection.
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn StoreSession>, StoreError>;
}

#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Create the bucket, or leave it untouched if it already matches.
    async fn provision(&self, bucket: &BucketDescriptor) -> Result<(), StoreError>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Current value stored under `key`, if any.
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    async fn close(&self);
}

/// The writable handle published while the connection is Active.
#[derive(Clone)]
pub struct ActiveStore {
    pub epoch: u64,
    pub bucket: String,
    pub session: Arc<dyn StoreSession>,
}

impl fmt::Debug for ActiveStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveStore")
            .field("epoch", &self.epoch)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}
