//! Heartbeat health flag
//!
//! Split in two halves so only the heartbeat scheduler can change the flag:
//! [`HealthRecorder`] is the single write side, [`HealthExporter`] the
//! cloneable read side used by the HTTP probe.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No heartbeat write has completed yet. Reported as failing.
    Unknown,
    Healthy,
    Failing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    /// Record timestamp of the last successful write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// The last success is older than the staleness bound.
    pub stale: bool,
}

#[derive(Debug)]
struct HealthState {
    status: HealthStatus,
    last_success: Option<(Instant, i64)>,
    last_error: Option<String>,
    consecutive_failures: u32,
}

/// Write side of the flag. Deliberately not `Clone`.
#[derive(Debug)]
pub struct HealthRecorder {
    state: Arc<Mutex<HealthState>>,
}

impl HealthRecorder {
    pub fn record_success(&mut self, timestamp_ms: i64) {
        let mut state = self.state.lock();
        state.status = HealthStatus::Healthy;
        state.last_success = Some((Instant::now(), timestamp_ms));
        state.last_error = None;
        state.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        state.status = HealthStatus::Failing;
        state.last_error = Some(reason.into());
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
    }
}

/// Read side of the flag.
#[derive(Debug, Clone)]
pub struct HealthExporter {
    state: Arc<Mutex<HealthState>>,
    stale_after: Option<Duration>,
}

impl HealthExporter {
    /// `stale_after` bounds how old the last success may be before the flag
    /// reads as failing even without a failed write.
    pub fn new(stale_after: Option<Duration>) -> (HealthRecorder, HealthExporter) {
        let state = Arc::new(Mutex::new(HealthState {
            status: HealthStatus::Unknown,
            last_success: None,
            last_error: None,
            consecutive_failures: 0,
        }));
        (
            HealthRecorder { state: Arc::clone(&state) },
            HealthExporter { state, stale_after },
        )
    }

    pub fn last_heartbeat_failed(&self) -> bool {
        let snapshot = self.snapshot();
        snapshot.status != HealthStatus::Healthy || snapshot.stale
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.lock();
        let stale = match (state.last_success, self.stale_after) {
            (Some((at, _)), Some(bound)) => at.elapsed() > bound,
            _ => false,
        };
        HealthSnapshot {
            status: state.status,
            last_success_ms: state.last_success.map(|(_, ts)| ts),
            last_error: state.last_error.clone(),
            consecutive_failures: state.consecutive_failures,
            stale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_lifecycle() {
        let (mut recorder, exporter) = HealthExporter::new(None);
        assert_eq!(exporter.snapshot().status, HealthStatus::Unknown);
        assert!(exporter.last_heartbeat_failed());

        recorder.record_failure("stat failed");
        assert!(exporter.last_heartbeat_failed());

        recorder.record_success(1);
        assert!(!exporter.last_heartbeat_failed());
        assert_eq!(exporter.snapshot().last_success_ms, Some(1));

        recorder.record_failure("write failed");
        assert!(exporter.last_heartbeat_failed());
        let snapshot = exporter.snapshot();
        assert_eq!(snapshot.last_error.as_deref(), Some("write failed"));
        assert_eq!(snapshot.last_success_ms, Some(1));
        assert_eq!(snapshot.consecutive_failures, 1);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let (mut recorder, exporter) = HealthExporter::new(None);
        recorder.record_failure("a");
        recorder.record_failure("b");
        assert_eq!(exporter.snapshot().consecutive_failures, 2);
        recorder.record_success(2);
        assert_eq!(exporter.snapshot().consecutive_failures, 0);
        assert!(exporter.snapshot().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_success_reads_as_failing() {
        let (mut recorder, exporter) = HealthExporter::new(Some(Duration::from_secs(90)));
        recorder.record_success(1);
        assert!(!exporter.last_heartbeat_failed());

        tokio::time::advance(Duration::from_secs(91)).await;
        assert!(exporter.snapshot().stale);
        assert!(exporter.last_heartbeat_failed());

        recorder.record_success(2);
        assert!(!exporter.last_heartbeat_failed());
    }
}
