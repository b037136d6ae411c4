//! Store connection lifecycle
//!
//! A single actor task owns the connection state machine:
//! - connect, then provision the bucket, then publish the writable handle
//! - on connect/provision failure or a lost session, withdraw the handle and
//!   retry after a backoff delay, forever
//! - at most one connect/provision sequence is in flight
//!
//! Every decision goes through [`transition`], a pure function over
//! (state, event) so the machine can be exercised without any I/O. Long
//! running steps (connect, provision, backoff sleep) run as spawned tasks that
//! post their outcome back to the actor's queue, which keeps transitions
//! strictly sequential.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::{log_retry, BackoffPolicy};
use crate::store::{ActiveStore, BucketDescriptor, EventSink, StoreClient, StoreSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Provisioning,
    Active,
    Reconnecting,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 5] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Provisioning,
        ConnectionState::Active,
        ConnectionState::Reconnecting,
    ];
}

/// Inputs to the state machine.
pub enum ConnectionEvent {
    /// Start (or reconnect) trigger.
    Start,
    Connected(Arc<dyn StoreSession>),
    ConnectFailed(String),
    Provisioned,
    ProvisionFailed(String),
    /// The store client reported an error on the session.
    Errored(String),
    /// The store client reported the session closed.
    Closed,
    /// A heartbeat write failed in a way that implies the session is gone.
    WriteFailed(String),
    BackoffElapsed,
    Shutdown,
}

/// Payload-free view of [`ConnectionEvent`], used by [`transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    ConnectSucceeded,
    ConnectFailed,
    ProvisionSucceeded,
    ProvisionFailed,
    Errored,
    Closed,
    WriteFailed,
    BackoffElapsed,
    Shutdown,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::Start,
        EventKind::ConnectSucceeded,
        EventKind::ConnectFailed,
        EventKind::ProvisionSucceeded,
        EventKind::ProvisionFailed,
        EventKind::Errored,
        EventKind::Closed,
        EventKind::WriteFailed,
        EventKind::BackoffElapsed,
        EventKind::Shutdown,
    ];
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Start => EventKind::Start,
            ConnectionEvent::Connected(_) => EventKind::ConnectSucceeded,
            ConnectionEvent::ConnectFailed(_) => EventKind::ConnectFailed,
            ConnectionEvent::Provisioned => EventKind::ProvisionSucceeded,
            ConnectionEvent::ProvisionFailed(_) => EventKind::ProvisionFailed,
            ConnectionEvent::Errored(_) => EventKind::Errored,
            ConnectionEvent::Closed => EventKind::Closed,
            ConnectionEvent::WriteFailed(_) => EventKind::WriteFailed,
            ConnectionEvent::BackoffElapsed => EventKind::BackoffElapsed,
            ConnectionEvent::Shutdown => EventKind::Shutdown,
        }
    }

    fn reason(&self) -> Option<&str> {
        match self {
            ConnectionEvent::ConnectFailed(r)
            | ConnectionEvent::ProvisionFailed(r)
            | ConnectionEvent::Errored(r)
            | ConnectionEvent::WriteFailed(r) => Some(r),
            ConnectionEvent::Closed => Some("connection closed"),
            _ => None,
        }
    }
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{:?}({reason})", self.kind()),
            None => write!(f, "{:?}", self.kind()),
        }
    }
}

/// An event on the actor queue. `epoch` is the connection attempt the event
/// belongs to; `None` for external triggers that apply to whatever is current.
#[derive(Debug)]
pub struct Envelope {
    pub epoch: Option<u64>,
    pub event: ConnectionEvent,
}

impl Envelope {
    pub fn tagged(epoch: u64, event: ConnectionEvent) -> Self {
        Self { epoch: Some(epoch), event }
    }

    pub fn external(event: ConnectionEvent) -> Self {
        Self { epoch: None, event }
    }
}

/// Side effects requested by a transition, performed in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Open a new session (new epoch).
    Connect,
    /// Provision the bucket on the current session.
    Provision,
    /// Publish the handle; resumes the scheduler.
    Activate,
    /// Withdraw the handle, close the session, abort pending work; pauses the scheduler.
    Deactivate,
    /// Arm the backoff timer.
    ScheduleRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(ConnectionState, &'static [Action]),
    /// No effect in this state (duplicate trigger, or a late event).
    Ignored,
}

const RETRY: &[Action] = &[Action::Deactivate, Action::ScheduleRetry];

/// The connection state machine. Total over every (state, event) pair.
pub fn transition(state: ConnectionState, event: EventKind) -> Transition {
    use ConnectionState::*;

    match (state, event) {
        (Disconnected, EventKind::Shutdown) => Transition::Ignored,
        (_, EventKind::Shutdown) => Transition::To(Disconnected, &[Action::Deactivate]),

        (Disconnected, EventKind::Start) => Transition::To(Connecting, &[Action::Connect]),

        (Connecting, EventKind::ConnectSucceeded) => {
            Transition::To(Provisioning, &[Action::Provision])
        }
        (Connecting, EventKind::ConnectFailed | EventKind::Errored | EventKind::Closed) => {
            Transition::To(Reconnecting, RETRY)
        }

        (Provisioning, EventKind::ProvisionSucceeded) => {
            Transition::To(Active, &[Action::Activate])
        }
        (Provisioning, EventKind::ProvisionFailed | EventKind::Errored | EventKind::Closed) => {
            Transition::To(Reconnecting, RETRY)
        }

        (Active, EventKind::Errored | EventKind::Closed | EventKind::WriteFailed) => {
            Transition::To(Reconnecting, RETRY)
        }

        (Reconnecting, EventKind::BackoffElapsed) => Transition::To(Connecting, &[Action::Connect]),

        _ => Transition::Ignored,
    }
}

/// Read-only view published on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive failed attempts since the connection was last Active.
    pub failed_attempts: u32,
    pub epoch: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub bucket: BucketDescriptor,
    pub backoff: BackoffPolicy,
    /// Bound on each connect and each provision request.
    pub connect_timeout: Duration,
}

/// Cloneable handle for triggering and observing the connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Envelope>,
    status: watch::Receiver<ConnectionStatus>,
    link: watch::Receiver<Option<ActiveStore>>,
}

impl ConnectionHandle {
    /// Begin connecting. No-op unless Disconnected.
    pub fn start(&self) {
        self.send(Envelope::external(ConnectionEvent::Start));
    }

    pub fn shutdown(&self) {
        self.send(Envelope::external(ConnectionEvent::Shutdown));
    }

    /// Report a write through the session of `epoch` that failed because the
    /// session appears to be gone.
    pub fn report_write_failure(&self, epoch: u64, reason: impl Into<String>) {
        self.send(Envelope::tagged(epoch, ConnectionEvent::WriteFailed(reason.into())));
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// The handle to write through, present only while Active.
    pub fn active(&self) -> Option<ActiveStore> {
        self.link.borrow().clone()
    }

    pub fn watch_active(&self) -> watch::Receiver<Option<ActiveStore>> {
        self.link.clone()
    }

    fn send(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            debug!("store connection manager already stopped");
        }
    }
}

pub struct StoreConnection {
    client: Arc<dyn StoreClient>,
    settings: ConnectionSettings,
    state: ConnectionState,
    epoch: u64,
    failed_attempts: u32,
    last_failure: Option<String>,
    session: Option<Arc<dyn StoreSession>>,
    pending: Option<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    status_tx: watch::Sender<ConnectionStatus>,
    link_tx: watch::Sender<Option<ActiveStore>>,
}

impl StoreConnection {
    pub fn new(
        client: Arc<dyn StoreClient>,
        settings: ConnectionSettings,
    ) -> (Self, ConnectionHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            failed_attempts: 0,
            epoch: 0,
            last_failure: None,
        });
        let (link_tx, link_rx) = watch::channel(None);

        let handle = ConnectionHandle {
            tx: tx.clone(),
            status: status_rx,
            link: link_rx,
        };
        let connection = Self {
            client,
            settings,
            state: ConnectionState::Disconnected,
            epoch: 0,
            failed_attempts: 0,
            last_failure: None,
            session: None,
            pending: None,
            tx,
            rx,
            status_tx,
            link_tx,
        };
        (connection, handle)
    }

    /// Spawn the actor and trigger the first connection attempt.
    pub fn spawn(
        client: Arc<dyn StoreClient>,
        settings: ConnectionSettings,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (connection, handle) = Self::new(client, settings);
        let task = tokio::spawn(connection.run());
        handle.start();
        (handle, task)
    }

    /// Process events until shutdown. Dropping the actor closes the handle
    /// channel, which ends the heartbeat scheduler.
    pub async fn run(mut self) {
        info!(bucket = %self.settings.bucket.name, "store: connection manager started");
        while let Some(envelope) = self.rx.recv().await {
            let shutdown = matches!(envelope.event, ConnectionEvent::Shutdown);
            self.dispatch(envelope);
            if shutdown {
                break;
            }
        }
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        info!("store: connection manager stopped");
    }

    fn dispatch(&mut self, envelope: Envelope) {
        if let Some(epoch) = envelope.epoch {
            if epoch != self.epoch {
                debug!(
                    epoch,
                    current = self.epoch,
                    event = ?envelope.event,
                    "store: discarding stale event"
                );
                Self::discard(envelope.event);
                return;
            }
        }

        let event = envelope.event;
        match transition(self.state, event.kind()) {
            Transition::Ignored => {
                debug!(
                    state = ?self.state,
                    event = ?event,
                    "store: event has no effect in this state"
                );
                Self::discard(event);
            }
            Transition::To(next, actions) => {
                if let Some(reason) = event.reason() {
                    self.last_failure = Some(reason.to_string());
                }
                if let ConnectionEvent::Connected(session) = event {
                    self.session = Some(session);
                }
                debug!(from = ?self.state, to = ?next, "store: state transition");
                self.state = next;
                for action in actions {
                    self.perform(*action);
                }
                self.publish_status();
            }
        }
    }

    // A session handed to us that we will not use still has to be closed.
    fn discard(event: ConnectionEvent) {
        if let ConnectionEvent::Connected(session) = event {
            tokio::spawn(async move { session.close().await });
        }
    }

    fn perform(&mut self, action: Action) {
        match action {
            Action::Connect => self.connect(),
            Action::Provision => self.provision(),
            Action::Activate => self.activate(),
            Action::Deactivate => self.deactivate(),
            Action::ScheduleRetry => self.schedule_retry(),
        }
    }

    fn connect(&mut self) {
        self.abort_pending();
        self.epoch += 1;
        let epoch = self.epoch;
        let client = Arc::clone(&self.client);
        let sink = EventSink::new(epoch, self.tx.clone());
        let tx = self.tx.clone();
        let timeout = self.settings.connect_timeout;

        info!(epoch, "store: connecting");
        self.pending = Some(tokio::spawn(async move {
            let event = match tokio::time::timeout(timeout, client.connect(sink)).await {
                Ok(Ok(session)) => ConnectionEvent::Connected(session),
                Ok(Err(e)) => ConnectionEvent::ConnectFailed(e.to_string()),
                Err(_) => {
                    ConnectionEvent::ConnectFailed(format!("connect timed out after {timeout:?}"))
                }
            };
            let _ = tx.send(Envelope::tagged(epoch, event));
        }));
    }

    fn provision(&mut self) {
        self.abort_pending();
        let epoch = self.epoch;
        let tx = self.tx.clone();
        let Some(session) = self.session.clone() else {
            let failed = ConnectionEvent::ProvisionFailed("no session".into());
            let _ = tx.send(Envelope::tagged(epoch, failed));
            return;
        };
        let bucket = self.settings.bucket.clone();
        let timeout = self.settings.connect_timeout;

        debug!(epoch, bucket = %bucket.name, "store: provisioning bucket");
        self.pending = Some(tokio::spawn(async move {
            let event = match tokio::time::timeout(timeout, session.provision(&bucket)).await {
                Ok(Ok(())) => ConnectionEvent::Provisioned,
                Ok(Err(e)) => ConnectionEvent::ProvisionFailed(e.to_string()),
                Err(_) => ConnectionEvent::ProvisionFailed(format!(
                    "provision timed out after {timeout:?}"
                )),
            };
            let _ = tx.send(Envelope::tagged(epoch, event));
        }));
    }

    fn activate(&mut self) {
        let Some(session) = self.session.clone() else {
            warn!("store: activated without a session");
            return;
        };
        self.pending = None;
        self.failed_attempts = 0;
        self.last_failure = None;
        info!(epoch = self.epoch, bucket = %self.settings.bucket.name, "store: connected");
        self.link_tx.send_replace(Some(ActiveStore {
            epoch: self.epoch,
            bucket: self.settings.bucket.name.clone(),
            session,
        }));
    }

    fn deactivate(&mut self) {
        self.abort_pending();
        if self.link_tx.send_replace(None).is_some() {
            info!(epoch = self.epoch, "store: connection lost; heartbeats paused");
        }
        if let Some(session) = self.session.take() {
            tokio::spawn(async move { session.close().await });
        }
    }

    fn schedule_retry(&mut self) {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        let attempt = self.failed_attempts;
        let delay = self.settings.backoff.delay_for_attempt(attempt);
        log_retry(attempt, delay, self.last_failure.as_deref().unwrap_or("unknown"));

        let epoch = self.epoch;
        let tx = self.tx.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Envelope::tagged(epoch, ConnectionEvent::BackoffElapsed));
        }));
    }

    fn abort_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(ConnectionStatus {
            state: self.state,
            failed_attempts: self.failed_attempts,
            epoch: self.epoch,
            last_failure: self.last_failure.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use super::ConnectionState::*;

    #[test]
    fn test_transition_table_is_total() {
        for state in ConnectionState::ALL {
            for event in EventKind::ALL {
                let expected = match (state, event) {
                    (Disconnected, EventKind::Start) => Some(Connecting),
                    (Connecting, EventKind::ConnectSucceeded) => Some(Provisioning),
                    (
                        Connecting,
                        EventKind::ConnectFailed | EventKind::Errored | EventKind::Closed,
                    ) => Some(Reconnecting),
                    (Provisioning, EventKind::ProvisionSucceeded) => Some(Active),
                    (
                        Provisioning,
                        EventKind::ProvisionFailed | EventKind::Errored | EventKind::Closed,
                    ) => Some(Reconnecting),
                    (
                        Active,
                        EventKind::Errored | EventKind::Closed | EventKind::WriteFailed,
                    ) => Some(Reconnecting),
                    (Reconnecting, EventKind::BackoffElapsed) => Some(Connecting),
                    (Disconnected, EventKind::Shutdown) => None,
                    (_, EventKind::Shutdown) => Some(Disconnected),
                    _ => None,
                };
                match (transition(state, event), expected) {
                    (Transition::To(next, _), Some(want)) => {
                        assert_eq!(next, want, "{state:?} + {event:?}")
                    }
                    (Transition::Ignored, None) => {}
                    (got, want) => panic!("{state:?} + {event:?}: got {got:?}, want {want:?}"),
                }
            }
        }
    }

    #[test]
    fn test_retry_withdraws_handle_before_backoff() {
        assert_eq!(
            transition(Active, EventKind::Closed),
            Transition::To(Reconnecting, &[Action::Deactivate, Action::ScheduleRetry])
        );
        assert_eq!(
            transition(Provisioning, EventKind::ProvisionSucceeded),
            Transition::To(Active, &[Action::Activate])
        );
    }

    #[test]
    fn test_duplicate_triggers_are_ignored() {
        for state in [Connecting, Provisioning, Active, Reconnecting] {
            assert_eq!(transition(state, EventKind::Start), Transition::Ignored);
        }
    }

    struct Session;

    #[async_trait]
    impl StoreSession for Session {
        async fn provision(&self, _bucket: &BucketDescriptor) -> Result<(), StoreError> {
            Ok(())
        }
        async fn put_object(
            &self,
            _bucket: &str,
            _key: &str,
            _value: serde_json::Value,
        ) -> Result<(), StoreError> {
            Ok(())
        }
        async fn get_object(
            &self,
            _bucket: &str,
            _key: &str,
        ) -> Result<Option<serde_json::Value>, StoreError> {
            Ok(None)
        }
        async fn close(&self) {}
    }

    /// Fails the first `failures` connects, then succeeds.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StoreClient for Flaky {
        async fn connect(&self, _events: EventSink) -> Result<Arc<dyn StoreSession>, StoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(StoreError::Connect("refused".into()))
            } else {
                Ok(Arc::new(Session))
            }
        }
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            bucket: BucketDescriptor {
                name: "manta_storage".into(),
                index: Default::default(),
                options: None,
            },
            backoff: BackoffPolicy::default(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaches_active_after_failures() {
        let client = Arc::new(Flaky {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let (handle, _task) = StoreConnection::spawn(client.clone(), settings());

        let mut status = handle.watch_status();
        status.wait_for(|s| s.state == Active).await.unwrap();

        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        let active = handle.active().expect("handle published");
        assert_eq!(active.epoch, 3);
        assert_eq!(active.bucket, "manta_storage");
        assert_eq!(handle.status().failed_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_withdraws_handle_and_stops() {
        let client = Arc::new(Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let (handle, task) = StoreConnection::spawn(client, settings());
        handle.watch_status().wait_for(|s| s.state == Active).await.unwrap();

        let mut link = handle.watch_active();
        handle.shutdown();
        task.await.unwrap();

        assert_eq!(handle.state(), Disconnected);
        assert!(link.borrow_and_update().is_none());
        assert!(link.changed().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_write_failure_is_discarded() {
        let client = Arc::new(Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let (handle, _task) = StoreConnection::spawn(client, settings());
        handle.watch_status().wait_for(|s| s.state == Active).await.unwrap();

        handle.report_write_failure(99, "broken pipe");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.state(), Active);

        handle.report_write_failure(1, "broken pipe");
        handle.watch_status().wait_for(|s| s.state == Reconnecting).await.unwrap();
        assert!(handle.active().is_none());
    }
}
