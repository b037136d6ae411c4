//! Heartbeat scheduler
//!
//! Fires a tick every interval while the store connection is Active. Each
//! tick stats the object root, builds a [`HeartbeatRecord`] and writes it
//! through whatever handle is current at write time. Ticks never overlap: a
//! tick that fires while the previous write is still outstanding is skipped.
//!
//! The scheduler never holds on to a store handle between ticks, and checks
//! the handle again right before writing, so a tick that races a connection
//! loss cannot write through a stale session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;
use crate::connection::ConnectionHandle;
use crate::health::HealthRecorder;
use crate::record::{HeartbeatRecord, Identity};
use crate::stats::{StatCollector, StatFailure};
use crate::store::{ActiveStore, StoreError};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    /// Mount point whose usage is reported.
    pub object_root: PathBuf,
    /// Bound on a single heartbeat write.
    pub write_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum TickError {
    #[error(transparent)]
    Stat(#[from] StatFailure),

    #[error("store connection not active; write skipped")]
    Paused,

    #[error("encode heartbeat: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("heartbeat write failed: {source}")]
    Write {
        /// Connection attempt the write went through.
        epoch: u64,
        #[source]
        source: StoreError,
    },
}

type TickResult = Result<HeartbeatRecord, TickError>;

pub struct HeartbeatScheduler {
    settings: SchedulerSettings,
    collector: StatCollector,
    identity: Arc<Identity>,
    health: HealthRecorder,
    connection: ConnectionHandle,
    link: watch::Receiver<Option<ActiveStore>>,
    ticker: Option<Interval>,
    in_flight: Option<JoinHandle<TickResult>>,
    skipped: u64,
}

impl HeartbeatScheduler {
    pub fn new(
        settings: SchedulerSettings,
        collector: StatCollector,
        identity: Identity,
        health: HealthRecorder,
        connection: ConnectionHandle,
    ) -> Result<Self, ConfigError> {
        if settings.interval.is_zero() {
            return Err(ConfigError::InvalidInterval(0));
        }
        let link = connection.watch_active();
        Ok(Self {
            settings,
            collector,
            identity: Arc::new(identity),
            health,
            connection,
            link,
            ticker: None,
            in_flight: None,
            skipped: 0,
        })
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    /// Ticks skipped because the previous one was still in flight.
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped
    }

    /// Stop firing ticks. Idempotent.
    pub fn pause(&mut self) {
        if self.ticker.take().is_some() {
            info!("heartbeat: paused");
        }
    }

    /// Start firing ticks, the first one immediately. Idempotent.
    pub fn resume(&mut self) {
        if self.ticker.is_none() {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            self.ticker = Some(ticker);
            info!(interval_ms = self.settings.interval.as_millis() as u64, "heartbeat: running");
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Follow the connection's handle until the connection manager stops.
    pub async fn run(mut self) {
        self.follow_link();
        loop {
            tokio::select! {
                changed = self.link.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.follow_link();
                }
                _ = next_tick(&mut self.ticker) => self.on_tick(),
                outcome = join_tick(&mut self.in_flight) => self.on_tick_done(outcome),
            }
        }

        self.pause();
        if let Some(tick) = self.in_flight.take() {
            tick.abort();
        }
        info!("heartbeat: scheduler stopped");
    }

    fn follow_link(&mut self) {
        if self.link.borrow_and_update().is_some() {
            self.resume();
        } else {
            self.pause();
        }
    }

    fn on_tick(&mut self) {
        if self.in_flight.is_some() {
            self.skipped += 1;
            warn!(skipped = self.skipped, "heartbeat: previous tick still in flight; skipping");
            return;
        }

        let tick = Tick {
            collector: self.collector.clone(),
            identity: Arc::clone(&self.identity),
            object_root: self.settings.object_root.clone(),
            write_timeout: self.settings.write_timeout,
            link: self.link.clone(),
        };
        self.in_flight = Some(tokio::spawn(tick.run()));
    }

    fn on_tick_done(&mut self, outcome: Result<TickResult, JoinError>) {
        match outcome {
            Ok(Ok(record)) => {
                self.health.record_success(record.timestamp);
                info!(
                    key = %record.hostname,
                    available_mb = record.available_mb,
                    percent_used = record.percent_used,
                    "heartbeat: complete"
                );
            }
            Ok(Err(TickError::Paused)) => {
                debug!("heartbeat: connection withdrawn before write; tick dropped");
            }
            Ok(Err(err)) => {
                error!(error = %err, "heartbeat: failed");
                self.health.record_failure(err.to_string());
                if let TickError::Write { epoch, source } = &err {
                    if source.is_connection_loss() {
                        self.connection.report_write_failure(*epoch, source.to_string());
                    }
                }
            }
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => {
                error!(error = %join_err, "heartbeat: tick task failed");
                self.health.record_failure(join_err.to_string());
            }
        }
    }
}

/// Everything one tick needs, detached from the scheduler.
struct Tick {
    collector: StatCollector,
    identity: Arc<Identity>,
    object_root: PathBuf,
    write_timeout: Duration,
    link: watch::Receiver<Option<ActiveStore>>,
}

impl Tick {
    async fn run(self) -> TickResult {
        let usage = self.collector.collect(&self.object_root).await?;
        let record = HeartbeatRecord::new(&self.identity, usage);
        let value = serde_json::to_value(&record)?;

        let current = self.link.borrow().clone();
        let Some(store) = current else {
            return Err(TickError::Paused);
        };

        let write = store.session.put_object(&store.bucket, self.identity.key(), value);
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => Ok(record),
            Ok(Err(source)) => Err(TickError::Write { epoch: store.epoch, source }),
            Err(_) => Err(TickError::Write {
                epoch: store.epoch,
                source: StoreError::Timeout(self.write_timeout),
            }),
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn join_tick(
    in_flight: &mut Option<JoinHandle<TickResult>>,
) -> Result<TickResult, JoinError> {
    let outcome = match in_flight {
        Some(tick) => tick.await,
        None => std::future::pending().await,
    };
    *in_flight = None;
    outcome
}
