//! Filesystem usage collection
//!
//! Converts raw statvfs(2) block counts into the usage figures carried by a
//! heartbeat. The OS call itself sits behind [`StatSource`] so the scheduler
//! can be driven by a scripted source in tests.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

const BYTES_PER_MB: u128 = 1_048_576;

/// Raw figures reported by the OS for a mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFsStat {
    /// Blocks available to unprivileged users (`f_bavail`).
    pub blocks_available: u64,
    /// Total blocks, in fragment-size units (`f_blocks`).
    pub blocks: u64,
    /// Fragment size in bytes (`f_frsize`).
    pub fragment_size: u64,
}

/// Usage of one filesystem at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    #[serde(rename = "availableMB")]
    pub available_mb: u64,
    pub percent_used: u8,
    pub filesystem: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Error)]
pub enum StatFailure {
    #[error("statvfs {path}: {source}")]
    Os {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("statvfs {path}: filesystem reports zero capacity")]
    ZeroCapacity { path: PathBuf },

    #[error("statvfs {path}: stat task failed: {reason}")]
    Task { path: PathBuf, reason: String },
}

/// OS capability returning raw filesystem figures for a mount path.
pub trait StatSource: Send + Sync + 'static {
    fn stat(&self, path: &Path) -> io::Result<RawFsStat>;
}

/// statvfs(2) through `nix`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statvfs;

impl StatSource for Statvfs {
    fn stat(&self, path: &Path) -> io::Result<RawFsStat> {
        let st = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        Ok(RawFsStat {
            blocks_available: st.blocks_available() as u64,
            blocks: st.blocks() as u64,
            fragment_size: st.fragment_size() as u64,
        })
    }
}

impl RawFsStat {
    /// Compute the usage figures. Fails when the filesystem has no capacity,
    /// since a used/total ratio cannot be formed.
    pub fn usage(&self, path: &Path, timestamp_ms: i64) -> Result<UsageSnapshot, StatFailure> {
        let frsize = self.fragment_size as u128;
        let free = self.blocks_available as u128 * frsize;
        let total = self.blocks as u128 * frsize;
        if total == 0 {
            return Err(StatFailure::ZeroCapacity { path: path.to_path_buf() });
        }
        let used = total.saturating_sub(free);

        // ceil(used * 100 / total) without going through floating point
        let percent = (used * 100).div_ceil(total).min(100);

        Ok(UsageSnapshot {
            available_mb: (free / BYTES_PER_MB) as u64,
            percent_used: percent as u8,
            filesystem: path.display().to_string(),
            timestamp_ms,
        })
    }
}

/// Wraps a [`StatSource`] and timestamps every reading.
#[derive(Clone)]
pub struct StatCollector {
    source: Arc<dyn StatSource>,
}

impl StatCollector {
    pub fn new(source: Arc<dyn StatSource>) -> Self {
        Self { source }
    }

    /// Collector backed by the real statvfs(2) call.
    pub fn statvfs() -> Self {
        Self::new(Arc::new(Statvfs))
    }

    /// Stat `path` once. Never retried here: the next heartbeat tick is the retry.
    pub async fn collect(&self, path: &Path) -> Result<UsageSnapshot, StatFailure> {
        let source = Arc::clone(&self.source);
        let owned = path.to_path_buf();

        let raw = tokio::task::spawn_blocking(move || source.stat(&owned))
            .await
            .map_err(|e| StatFailure::Task {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
            .map_err(|source| StatFailure::Os {
                path: path.to_path_buf(),
                source,
            })?;

        let snapshot = raw.usage(path, Utc::now().timestamp_millis())?;
        debug!(
            filesystem = %snapshot.filesystem,
            available_mb = snapshot.available_mb,
            percent_used = snapshot.percent_used,
            "filesystem stat collected"
        );
        Ok(snapshot)
    }
}
