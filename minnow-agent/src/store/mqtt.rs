//! MQTT-backed key-value store
//!
//! Buckets and objects are retained QoS 1 messages:
//! - bucket descriptor at `<prefix>/buckets/<bucket>`
//! - object at `<prefix>/buckets/<bucket>/objects/<key>`
//!
//! A write completes when the broker acknowledges the packet (PUBACK).
//! Re-publishing an identical descriptor leaves the retained state as it was,
//! which makes provisioning idempotent. Each session owns one event loop; the
//! loop is never restarted in place: any error fails all outstanding writes
//! and is reported through the [`EventSink`], and the connection manager opens
//! a fresh session.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{BucketDescriptor, EventSink, StoreClient, StoreError, StoreEvent, StoreSession};

/// How long `close` waits for the DISCONNECT to go out.
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Fixed client id; a random one is generated per session when unset.
    pub client_id: Option<String>,
    pub keep_alive: Duration,
    pub topic_prefix: String,
    /// How long `get_object` waits for a retained message.
    pub read_timeout: Duration,
}

pub fn bucket_topic(prefix: &str, bucket: &str) -> String {
    format!("{prefix}/buckets/{bucket}")
}

pub fn object_topic(prefix: &str, bucket: &str, key: &str) -> String {
    format!("{prefix}/buckets/{bucket}/objects/{key}")
}

pub struct MqttStore {
    settings: MqttSettings,
}

impl MqttStore {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    fn client_id(&self) -> String {
        self.settings
            .client_id
            .clone()
            .unwrap_or_else(|| format!("minnow-{}", uuid::Uuid::new_v4().simple()))
    }
}

#[async_trait]
impl StoreClient for MqttStore {
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn StoreSession>, StoreError> {
        let client_id = self.client_id();
        let mut options = MqttOptions::new(&client_id, &self.settings.host, self.settings.port);
        options.set_keep_alive(self.settings.keep_alive);
        options.set_clean_session(true);

        debug!(
            host = %self.settings.host,
            port = self.settings.port,
            client_id = %client_id,
            epoch = events.epoch(),
            "store: opening mqtt session"
        );
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        // rumqttc connects lazily on the first poll
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(StoreError::Connect(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )));
                }
                Ok(_) => {}
                Err(e) => return Err(StoreError::Connect(e.to_string())),
            }
        }

        let inflight = Arc::new(Mutex::new(Inflight::default()));
        let driver = tokio::spawn(drive(eventloop, Arc::clone(&inflight), events));

        Ok(Arc::new(MqttSession {
            client,
            inflight,
            publish_lock: tokio::sync::Mutex::new(()),
            prefix: self.settings.topic_prefix.clone(),
            read_timeout: self.settings.read_timeout,
            driver: Mutex::new(Some(driver)),
        }))
    }
}

type Ack = oneshot::Sender<Result<(), StoreError>>;

/// Requests waiting on the broker.
#[derive(Default)]
struct Inflight {
    /// Publishes handed to the client, not yet given a packet id, in order.
    unassigned: VecDeque<Ack>,
    by_pkid: HashMap<u16, Ack>,
    readers: HashMap<String, Vec<oneshot::Sender<Vec<u8>>>>,
    closed: bool,
}

impl Inflight {
    fn assign(&mut self, pkid: u16) {
        if let Some(ack) = self.unassigned.pop_front() {
            self.by_pkid.insert(pkid, ack);
        }
    }

    fn complete(&mut self, pkid: u16) {
        if let Some(ack) = self.by_pkid.remove(&pkid) {
            let _ = ack.send(Ok(()));
        }
    }

    fn deliver(&mut self, topic: &str, payload: Vec<u8>) {
        if let Some(readers) = self.readers.remove(topic) {
            for reader in readers {
                let _ = reader.send(payload.clone());
            }
        }
    }

    fn fail_all(&mut self) {
        self.closed = true;
        for ack in self.unassigned.drain(..) {
            let _ = ack.send(Err(StoreError::Closed));
        }
        for (_, ack) in self.by_pkid.drain() {
            let _ = ack.send(Err(StoreError::Closed));
        }
        self.readers.clear();
    }
}

async fn drive(mut eventloop: EventLoop, inflight: Arc<Mutex<Inflight>>, events: EventSink) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => inflight.lock().assign(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => inflight.lock().complete(ack.pkid),
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                inflight.lock().deliver(&publish.topic, publish.payload.to_vec());
            }
            Ok(Event::Incoming(Packet::Disconnect))
            | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(epoch = events.epoch(), "store: mqtt session closed");
                inflight.lock().fail_all();
                events.emit(StoreEvent::Closed);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(epoch = events.epoch(), error = %e, "store: mqtt connection error");
                inflight.lock().fail_all();
                events.emit(StoreEvent::Error(e.to_string()));
                break;
            }
        }
    }
}

struct MqttSession {
    client: AsyncClient,
    inflight: Arc<Mutex<Inflight>>,
    /// Keeps ack slots in the same order as requests reach the event loop.
    publish_lock: tokio::sync::Mutex<()>,
    prefix: String,
    read_timeout: Duration,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// An ack slot queued ahead of its publish. Removed again on drop unless the
/// request reached the client, so a cancelled publish cannot shift later
/// packet ids onto the wrong waiter. Only valid under `publish_lock`.
struct QueuedAck<'a> {
    inflight: &'a Mutex<Inflight>,
    sent: bool,
}

impl<'a> QueuedAck<'a> {
    fn push(inflight: &'a Mutex<Inflight>, ack: Ack) -> Result<Self, StoreError> {
        let mut guard = inflight.lock();
        if guard.closed {
            return Err(StoreError::Closed);
        }
        guard.unassigned.push_back(ack);
        Ok(Self { inflight, sent: false })
    }

    fn sent(mut self) {
        self.sent = true;
    }
}

impl Drop for QueuedAck<'_> {
    fn drop(&mut self) {
        if !self.sent {
            self.inflight.lock().unassigned.pop_back();
        }
    }
}

impl MqttSession {
    async fn publish_acked(&self, topic: String, payload: Vec<u8>) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.publish_lock.lock().await;
            let slot = QueuedAck::push(&self.inflight, tx)?;
            self.client
                .publish(topic, QoS::AtLeastOnce, true, payload)
                .await
                .map_err(|e| StoreError::Transport(e.to_string()))?;
            slot.sent();
        }
        rx.await.unwrap_or(Err(StoreError::Closed))
    }
}

#[async_trait]
impl StoreSession for MqttSession {
    async fn provision(&self, bucket: &BucketDescriptor) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(bucket)?;
        self.publish_acked(bucket_topic(&self.prefix, &bucket.name), payload)
            .await
            .map_err(|e| match e {
                StoreError::Transport(reason) => StoreError::Provision {
                    bucket: bucket.name.clone(),
                    reason,
                },
                other => other,
            })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(&value)?;
        self.publish_acked(object_topic(&self.prefix, bucket, key), payload).await
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let topic = object_topic(&self.prefix, bucket, key);
        let (tx, rx) = oneshot::channel();
        {
            let mut inflight = self.inflight.lock();
            if inflight.closed {
                return Err(StoreError::Closed);
            }
            inflight.readers.entry(topic.clone()).or_default().push(tx);
        }

        if let Err(e) = self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
            self.inflight.lock().readers.remove(&topic);
            return Err(StoreError::Transport(e.to_string()));
        }

        // a retained message arrives right after SUBACK; silence means no object
        let result = match tokio::time::timeout(self.read_timeout, rx).await {
            Ok(Ok(payload)) if payload.is_empty() => Ok(None),
            Ok(Ok(payload)) => {
                serde_json::from_slice(&payload)
                    .map(Some)
                    .map_err(|e| StoreError::Read {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })
            }
            Ok(Err(_)) => Err(StoreError::Closed),
            Err(_) => Ok(None),
        };

        self.inflight.lock().readers.remove(&topic);
        let _ = self.client.unsubscribe(topic).await;
        result
    }

    async fn close(&self) {
        let _ = self.client.disconnect().await;
        let driver = self.driver.lock().take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(CLOSE_GRACE, &mut driver).await.is_err() {
                driver.abort();
            }
        }
        self.inflight.lock().fail_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        assert_eq!(bucket_topic("minnow", "manta_storage"), "minnow/buckets/manta_storage");
        assert_eq!(
            object_topic("minnow", "manta_storage", "stor-01.example.com"),
            "minnow/buckets/manta_storage/objects/stor-01.example.com"
        );
    }

    #[test]
    fn test_generated_client_ids_are_unique() {
        let store = MqttStore::new(MqttSettings {
            host: "localhost".into(),
            port: 1883,
            client_id: None,
            keep_alive: Duration::from_secs(30),
            topic_prefix: "minnow".into(),
            read_timeout: Duration::from_secs(1),
        });
        let a = store.client_id();
        assert!(a.starts_with("minnow-"));
        assert_ne!(a, store.client_id());
    }

    #[tokio::test]
    async fn test_acks_resolve_in_publish_order() {
        let mut inflight = Inflight::default();
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        inflight.unassigned.push_back(first_tx);
        inflight.unassigned.push_back(second_tx);

        inflight.assign(11);
        inflight.assign(12);
        inflight.complete(12);
        inflight.fail_all();

        assert!(matches!(second_rx.await.unwrap(), Ok(())));
        assert!(matches!(first_rx.await.unwrap(), Err(StoreError::Closed)));
        assert!(inflight.closed);
    }

    #[tokio::test]
    async fn test_retained_message_reaches_reader() {
        let mut inflight = Inflight::default();
        let (tx, rx) = oneshot::channel();
        inflight.readers.entry("t".into()).or_default().push(tx);
        inflight.deliver("other", b"{}".to_vec());
        inflight.deliver("t", br#"{"timestamp":1}"#.to_vec());
        assert_eq!(rx.await.unwrap(), br#"{"timestamp":1}"#.to_vec());
        assert!(inflight.readers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_publish_releases_ack_slot() {
        // the event loop is never polled, so one queued request fills the channel
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("t", "localhost", 1883), 1);
        let session = MqttSession {
            client,
            inflight: Arc::new(Mutex::new(Inflight::default())),
            publish_lock: tokio::sync::Mutex::new(()),
            prefix: "minnow".into(),
            read_timeout: Duration::from_secs(1),
            driver: Mutex::new(None),
        };
        let wait = Duration::from_millis(50);

        // reaches the client, then waits for a PUBACK that never comes
        let first = tokio::time::timeout(wait, session.put_object("b", "k", 1.into())).await;
        assert!(first.is_err());
        assert_eq!(session.inflight.lock().unassigned.len(), 1);

        // cancelled while the request channel is full
        let second = tokio::time::timeout(wait, session.put_object("b", "k", 2.into())).await;
        assert!(second.is_err());
        assert_eq!(session.inflight.lock().unassigned.len(), 1);

        let (tx, rx) = oneshot::channel();
        session.inflight.lock().unassigned.push_back(tx);
        session.inflight.lock().assign(7);
        session.inflight.lock().assign(8);
        session.inflight.lock().complete(8);
        assert!(matches!(rx.await.unwrap(), Ok(())));
    }
}
