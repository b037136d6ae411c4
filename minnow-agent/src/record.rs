//! Heartbeat record published to the store

use serde::{Deserialize, Serialize};

use crate::stats::UsageSnapshot;

/// Static identity of the reporting node, copied into every record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// `<host name>.<domain>`; also the object key.
    pub hostname: String,
    pub datacenter: String,
    pub server_id: String,
    pub zone_id: String,
    pub compute_id: String,
    pub storage_id: String,
}

impl Identity {
    /// Store key of this node's record.
    pub fn key(&self) -> &str {
        &self.hostname
    }
}

/// One heartbeat, as stored. Flat document, camelCase keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    pub hostname: String,
    #[serde(rename = "availableMB")]
    pub available_mb: u64,
    pub percent_used: u8,
    pub filesystem: String,
    pub datacenter: String,
    pub server_id: String,
    pub zone_id: String,
    pub compute_id: String,
    pub storage_id: String,
    /// Milliseconds since epoch, taken when the filesystem was stat'd.
    pub timestamp: i64,
}

impl HeartbeatRecord {
    pub fn new(identity: &Identity, usage: UsageSnapshot) -> Self {
        Self {
            hostname: identity.hostname.clone(),
            available_mb: usage.available_mb,
            percent_used: usage.percent_used,
            filesystem: usage.filesystem,
            datacenter: identity.datacenter.clone(),
            server_id: identity.server_id.clone(),
            zone_id: identity.zone_id.clone(),
            compute_id: identity.compute_id.clone(),
            storage_id: identity.storage_id.clone(),
            timestamp: usage.timestamp_ms,
        }
    }
}
