/*!
In-memory store for driving the agent without a broker

Implements the store contract with scriptable faults:
- connect failures and a gate holding connects open
- provision failures
- write faults (rejected request or lost session) and write latency
- dropping the live session from the outside

Every accepted write is recorded with the connection attempt it went through.
*/

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use minnow_agent::{BucketDescriptor, EventSink, StoreClient, StoreError, StoreEvent, StoreSession};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

/// One accepted `put_object`.
#[derive(Debug, Clone)]
pub struct PutRecord {
    pub epoch: u64,
    pub bucket: String,
    pub key: String,
    pub value: Value,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFault {
    /// The store refused this request; the session stays usable.
    Rejected,
    /// The session is gone.
    Closed,
}

#[derive(Debug, Clone)]
struct StoredBucket {
    descriptor: BucketDescriptor,
    version: u64,
}

#[derive(Default)]
struct StoreState {
    connect_failures: u32,
    provision_failures: u32,
    write_faults: VecDeque<WriteFault>,
    write_delay: Option<Duration>,
    connect_times: Vec<Instant>,
    provision_attempts: u32,
    write_attempts: u32,
    closed_sessions: u32,
    buckets: HashMap<String, StoredBucket>,
    objects: HashMap<(String, String), Value>,
    puts: Vec<PutRecord>,
    sessions: Vec<Weak<MemorySession>>,
}

struct Inner {
    state: Mutex<StoreState>,
    held: watch::Sender<bool>,
}

/// Cloneable; all clones share one store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (held, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(StoreState::default()),
                held,
            }),
        }
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_connects(&self, count: u32) -> &Self {
        self.inner.state.lock().connect_failures = count;
        self
    }

    /// Fail the next `count` provision requests.
    pub fn fail_provisions(&self, count: u32) -> &Self {
        self.inner.state.lock().provision_failures = count;
        self
    }

    /// Queue faults for the next writes, one per write.
    pub fn fail_writes(&self, count: usize, fault: WriteFault) -> &Self {
        let mut state = self.inner.state.lock();
        state.write_faults.extend(std::iter::repeat(fault).take(count));
        self
    }

    pub fn set_write_delay(&self, delay: Option<Duration>) -> &Self {
        self.inner.state.lock().write_delay = delay;
        self
    }

    /// Keep connect attempts pending until [`release_connects`](Self::release_connects).
    pub fn hold_connects(&self) -> &Self {
        self.inner.held.send_replace(true);
        self
    }

    pub fn release_connects(&self) -> &Self {
        self.inner.held.send_replace(false);
        self
    }

    /// Close the most recent live session and report it as closed, the way a
    /// broker dropping the connection would.
    pub fn drop_connection(&self) -> bool {
        self.end_session(StoreEvent::Closed)
    }

    /// Like [`drop_connection`](Self::drop_connection) but reported as a transport error.
    pub fn break_connection(&self, reason: &str) -> bool {
        self.end_session(StoreEvent::Error(reason.to_string()))
    }

    fn end_session(&self, event: StoreEvent) -> bool {
        let live = {
            let state = self.inner.state.lock();
            state
                .sessions
                .iter()
                .rev()
                .filter_map(Weak::upgrade)
                .find(|session| !session.is_closed())
        };
        match live {
            Some(session) => {
                session.closed.store(true, Ordering::SeqCst);
                session.events.emit(event);
                true
            }
            None => false,
        }
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.state.lock().connect_times.len() as u32
    }

    /// When each connect attempt reached the store.
    pub fn connect_times(&self) -> Vec<Instant> {
        self.inner.state.lock().connect_times.clone()
    }

    /// Every `put_object` call, accepted or not.
    pub fn write_attempts(&self) -> u32 {
        self.inner.state.lock().write_attempts
    }

    pub fn provision_attempts(&self) -> u32 {
        self.inner.state.lock().provision_attempts
    }

    /// Sessions closed by the agent itself.
    pub fn closed_sessions(&self) -> u32 {
        self.inner.state.lock().closed_sessions
    }

    pub fn puts(&self) -> Vec<PutRecord> {
        self.inner.state.lock().puts.clone()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Value> {
        self.inner
            .state
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Bumped every time the bucket is created or its descriptor changes.
    pub fn bucket_version(&self, name: &str) -> Option<u64> {
        self.inner.state.lock().buckets.get(name).map(|b| b.version)
    }

    pub fn bucket(&self, name: &str) -> Option<BucketDescriptor> {
        self.inner.state.lock().buckets.get(name).map(|b| b.descriptor.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn StoreSession>, StoreError> {
        let mut held = self.inner.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        let mut state = self.inner.state.lock();
        state.connect_times.push(Instant::now());
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(StoreError::Connect(format!(
                "scripted connect failure (attempt {})",
                state.connect_times.len()
            )));
        }

        let session = Arc::new(MemorySession {
            epoch: events.epoch(),
            closed: AtomicBool::new(false),
            events,
            store: Arc::clone(&self.inner),
        });
        state.sessions.push(Arc::downgrade(&session));
        Ok(session)
    }
}

pub struct MemorySession {
    epoch: u64,
    closed: AtomicBool,
    events: EventSink,
    store: Arc<Inner>,
}

impl MemorySession {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn provision(&self, bucket: &BucketDescriptor) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        let mut state = self.store.state.lock();
        state.provision_attempts += 1;
        if state.provision_failures > 0 {
            state.provision_failures -= 1;
            return Err(StoreError::Provision {
                bucket: bucket.name.clone(),
                reason: "scripted provision failure".into(),
            });
        }

        match state.buckets.get_mut(&bucket.name) {
            Some(existing) if existing.descriptor == *bucket => {}
            Some(existing) => {
                existing.descriptor = bucket.clone();
                existing.version += 1;
            }
            None => {
                state.buckets.insert(
                    bucket.name.clone(),
                    StoredBucket {
                        descriptor: bucket.clone(),
                        version: 1,
                    },
                );
            }
        }
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let delay = {
            let mut state = self.store.state.lock();
            state.write_attempts += 1;
            state.write_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_closed() {
            return Err(StoreError::Closed);
        }

        let mut state = self.store.state.lock();
        match state.write_faults.pop_front() {
            Some(WriteFault::Rejected) => {
                return Err(StoreError::Write {
                    key: key.to_string(),
                    reason: "scripted write rejection".into(),
                })
            }
            Some(WriteFault::Closed) => {
                self.closed.store(true, Ordering::SeqCst);
                return Err(StoreError::Closed);
            }
            None => {}
        }

        state.objects.insert((bucket.to_string(), key.to_string()), value.clone());
        state.puts.push(PutRecord {
            epoch: self.epoch,
            bucket: bucket.to_string(),
            key: key.to_string(),
            value,
            at: Instant::now(),
        });
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Value>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(self
            .store
            .state
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.store.state.lock().closed_sessions += 1;
        }
    }
}
