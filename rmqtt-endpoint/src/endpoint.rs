use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use itertools::Itertools;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use rmqtt_utils::{Clock, SystemClock, TimestampMillis};

use crate::client::{ClientState, ReconnectClient};
use crate::error::{EndpointError, Result};
use crate::format::{JsonMessageFormat, MessageFormats};
use crate::model::{Attribute, AttributeId, AttributeValue, Listener, Model, NodeId};
use crate::persistence::{self, PendingUpdate, PersistenceRef};
use crate::settings::Settings;
use crate::topic::{set_filter, validate_name, Action, Topic};
use crate::transaction::Transaction;
use crate::transport::{ConnectOptions, LastWill, PacketId, QoS, Transport, TransportHandler};

const WILL_PAYLOAD: &[u8] = b"DEAD";
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected and subscribed, waiting for the settle delay
    Connected,
    Ready,
}

#[derive(Debug, Clone)]
struct PendingMessage {
    topic: String,
    payload: Bytes,
    timestamp: TimestampMillis,
    qos: QoS,
    retain: bool,
}

#[derive(Debug)]
enum Inbound {
    Connected,
    Disconnected(String),
    Message { topic: String, payload: Bytes },
    Published(PacketId),
}

/// Forwards transport events to the worker
struct EndpointHandler {
    tx: UnboundedSender<Inbound>,
    wakeup: Arc<Notify>,
}

impl EndpointHandler {
    fn send(&self, event: Inbound) {
        if self.tx.send(event).is_ok() {
            self.wakeup.notify_one();
        } else {
            log::debug!("endpoint worker is gone, dropping transport event");
        }
    }
}

impl TransportHandler for EndpointHandler {
    fn on_connected(&self) {
        self.send(Inbound::Connected)
    }

    fn on_disconnected(&self, reason: &str) {
        self.send(Inbound::Disconnected(reason.into()))
    }

    fn on_message(&self, topic: &str, payload: Bytes) {
        self.send(Inbound::Message { topic: topic.into(), payload })
    }

    fn on_published(&self, packet_id: PacketId) {
        self.send(Inbound::Published(packet_id))
    }
}

pub struct EndpointBuilder {
    uuid: String,
    settings: Option<Settings>,
    transport: Option<Arc<dyn Transport>>,
    persistence: Option<Option<PersistenceRef>>,
    formats: Option<MessageFormats>,
    clock: Option<Arc<dyn Clock>>,
}

impl EndpointBuilder {
    fn new(uuid: String) -> Self {
        Self { uuid, settings: None, transport: None, persistence: None, formats: None, clock: None }
    }

    /// Defaults to [`Settings::load`] for the endpoint's UUID
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Overrides the store selected by the `persistence` setting, `None` disables it
    pub fn persistence(mut self, persistence: Option<PersistenceRef>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn formats(mut self, formats: MessageFormats) -> Self {
        self.formats = Some(formats);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Opens the store, spawns the worker and starts connecting.
    /// Must be called from within a tokio runtime.
    pub async fn build(self) -> Result<Endpoint> {
        let uuid = self.uuid;
        validate_name(&uuid)?;
        let settings = match self.settings {
            Some(settings) => settings,
            None => Settings::load(&uuid, None)?,
        };
        let transport = self.transport.ok_or_else(|| EndpointError::Configuration("transport".into()))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let formats =
            self.formats.unwrap_or_else(|| MessageFormats::new(Arc::new(JsonMessageFormat::new(clock.clone()))));

        let options = ConnectOptions {
            host_uri: settings.host_uri.clone(),
            client_id: format!("{}-endpoint-", uuid),
            clean_session: settings.clean_session,
            keep_alive: settings.keep_alive,
            username: settings.username.clone(),
            password: settings.password.clone(),
            tls: settings.ssl.to_options(),
            last_will: Some(LastWill {
                topic: Topic::new(Action::Offline, uuid.clone()).to_string(),
                payload: Bytes::from_static(WILL_PAYLOAD),
                qos: QoS::AtLeastOnce,
                retain: false,
            }),
        };

        let persistence = match self.persistence {
            Some(persistence) => persistence,
            None => persistence::build(settings.persistence, &settings.persistence_location)?,
        };
        if let Some(store) = persistence.as_ref() {
            store.open(&options.client_id, &options.host_uri)?;
        }

        let client =
            ReconnectClient::new(transport, options, settings.retry_interval, settings.auto_reconnect)?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let wakeup = Arc::new(Notify::new());
        client.set_handler(Arc::new(EndpointHandler { tx: inbound_tx, wakeup: wakeup.clone() }));

        let inner = Arc::new(EndpointInner {
            qos: settings.qos(),
            model: Mutex::new(Model::new(uuid.clone())),
            uuid,
            settings,
            client,
            persistence,
            formats,
            clock,
            state: RwLock::new(ConnectionState::Disconnected),
            outbound_tx,
            wakeup,
            running: AtomicBool::new(true),
            high_water_mark: AtomicUsize::new(0),
        });

        let worker = Worker {
            inner: inner.clone(),
            inbound_rx,
            outbound_rx,
            unacked: HashMap::default(),
            ready_at: None,
            subscribed: false,
        };
        inner.set_state(ConnectionState::Connecting);
        inner.client.start();
        let handle = tokio::spawn(worker.run());
        log::info!("{} endpoint started, broker: {}", inner.uuid, inner.settings.host_uri);

        Ok(Endpoint { inner, worker: Mutex::new(Some(handle)) })
    }
}

struct EndpointInner {
    uuid: String,
    settings: Settings,
    model: Mutex<Model>,
    client: ReconnectClient,
    persistence: Option<PersistenceRef>,
    formats: MessageFormats,
    clock: Arc<dyn Clock>,
    state: RwLock<ConnectionState>,
    outbound_tx: UnboundedSender<PendingMessage>,
    wakeup: Arc<Notify>,
    running: AtomicBool,
    high_water_mark: AtomicUsize,
    qos: QoS,
}

impl EndpointInner {
    #[inline]
    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        let old = std::mem::replace(&mut *self.state.write(), state);
        if old != state {
            log::debug!("{} state {:?} -> {:?}", self.uuid, old, state);
        }
    }

    #[inline]
    fn is_online(&self) -> bool {
        self.state() == ConnectionState::Ready && self.client.is_connected()
    }

    fn enqueue(&self, topic: Topic, payload: Bytes, timestamp: TimestampMillis, retain: bool) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(EndpointError::Closed);
        }
        let msg = PendingMessage { topic: topic.to_string(), payload, timestamp, qos: self.qos, retain };
        self.outbound_tx.send(msg).map_err(|_| EndpointError::Closed)?;
        self.wakeup.notify_one();
        Ok(())
    }
}

/// A device endpoint: the attribute tree plus the connection that mirrors it to the cloud
pub struct Endpoint {
    inner: Arc<EndpointInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    pub fn builder<U: Into<String>>(uuid: U) -> EndpointBuilder {
        EndpointBuilder::new(uuid.into())
    }

    #[inline]
    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    #[inline]
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Connected, subscribed and past the settle delay
    #[inline]
    pub fn is_online(&self) -> bool {
        self.inner.is_online()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.inner.client.is_connected()
    }

    /// Locks the attribute tree. Do not hold the guard across an `.await`.
    #[inline]
    pub fn model(&self) -> MutexGuard<'_, Model> {
        self.inner.model.lock()
    }

    #[inline]
    pub fn get_node(&self, name: &str) -> Option<NodeId> {
        self.inner.model.lock().node_by_name(name)
    }

    pub fn add_node<N: Into<String>>(&self, name: N, node: NodeId) -> Result<()> {
        let name = name.into();
        let message = {
            let mut model = self.inner.model.lock();
            model.attach_node(name.clone(), node)?;
            if self.inner.state() == ConnectionState::Ready {
                let path = model.topic_path(node)?;
                let payload = self.inner.formats.default_format().serialize_node(&model, node)?;
                Some((Topic::new(Action::NodeAdded, path), payload))
            } else {
                None
            }
        };
        match message {
            Some((topic, payload)) => self.inner.enqueue(topic, payload, self.inner.clock.now_millis(), false),
            None => {
                log::info!("{} node {} added while offline, not announcing it", self.inner.uuid, name);
                Ok(())
            }
        }
    }

    /// Local write, stamped with the current time. Published as `@update` once the
    /// attribute's node is attached.
    pub fn set_value<V: Into<AttributeValue>>(&self, attribute: AttributeId, value: V) -> Result<()> {
        let now = self.inner.clock.now_millis();
        let message = {
            let mut model = self.inner.model.lock();
            model.attribute_mut(attribute)?.set_value(value, now)?;
            if model.is_registered(attribute) {
                let path = model.topic_path(attribute)?;
                let payload = self.inner.formats.default_format().serialize_attribute(model.attribute(attribute)?)?;
                Some((Topic::new(Action::Update, path), payload))
            } else {
                None
            }
        };
        match message {
            Some((topic, payload)) => self.inner.enqueue(topic, payload, now, false),
            None => Ok(()),
        }
    }

    /// Sets the value without a timestamp and without publishing
    pub fn set_static_value<V: Into<AttributeValue>>(&self, attribute: AttributeId, value: V) -> Result<()> {
        self.inner.model.lock().attribute_mut(attribute)?.set_static_value(value)
    }

    pub fn add_listener(&self, attribute: AttributeId, listener: Listener) -> Result<()> {
        self.inner.model.lock().attribute_mut(attribute)?.add_listener(listener);
        Ok(())
    }

    pub fn remove_listener(&self, attribute: AttributeId, listener: &Listener) -> Result<bool> {
        Ok(self.inner.model.lock().attribute_mut(attribute)?.remove_listener(listener))
    }

    /// Applies every change of `tx` and publishes them as one `@transaction` message.
    /// Nothing is applied if any change is rejected.
    pub fn commit(&self, tx: Transaction) -> Result<()> {
        if tx.is_empty() {
            return Ok(());
        }
        let now = self.inner.clock.now_millis();
        let payload = {
            let mut model = self.inner.model.lock();
            let mut staged: HashMap<AttributeId, Attribute> = HashMap::default();
            for (id, value) in tx.changes() {
                model.topic_path(*id)?;
                let attribute = match staged.entry(*id) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(e) => e.insert(model.attribute(*id)?.clone()),
                };
                attribute.set_value(value.clone(), now)?;
            }
            for (id, staged) in staged {
                let attribute = model.attribute_mut(id)?;
                if let (Some(value), Some(ts)) = (staged.value(), staged.timestamp()) {
                    attribute.set_value(value.clone(), ts)?;
                }
            }
            self.inner.formats.default_format().serialize_transaction(&model, &tx.attributes())?
        };
        self.inner.enqueue(Topic::new(Action::Transaction, self.inner.uuid.clone()), payload, now, false)
    }

    /// Publishes the retained snapshot of the whole tree on `@online/<uuid>`.
    /// Call it once the tree is built.
    pub fn announce(&self) -> Result<()> {
        let (payload, nodes) = {
            let model = self.inner.model.lock();
            (self.inner.formats.default_format().serialize_endpoint(&model)?, model.nodes().keys().join(", "))
        };
        log::info!("{} announcing nodes: {}", self.inner.uuid, nodes);
        self.inner.enqueue(
            Topic::new(Action::Online, self.inner.uuid.clone()),
            payload,
            self.inner.clock.now_millis(),
            true,
        )
    }

    /// Queues a raw message. A zero `timestamp` means now.
    pub fn publish(&self, topic: &str, payload: Bytes, timestamp: TimestampMillis) -> Result<()> {
        let topic: Topic = topic.parse()?;
        let timestamp = if timestamp == 0 { self.inner.clock.now_millis() } else { timestamp };
        self.inner.enqueue(topic, payload, timestamp, false)
    }

    /// Most messages ever waiting for a delivery confirmation at the same time
    #[inline]
    pub fn unacknowledged_high_water_mark(&self) -> usize {
        self.inner.high_water_mark.load(Ordering::SeqCst)
    }

    /// Messages waiting in the persistence store
    pub fn pending_count(&self) -> Result<usize> {
        match self.inner.persistence.as_ref() {
            Some(store) => Ok(store.keys()?.len()),
            None => Ok(0),
        }
    }

    /// Stops the worker, disconnects and closes the store. Queued messages are
    /// published or stored first.
    pub async fn close(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.wakeup.notify_one();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                log::warn!("{} endpoint worker ended abnormally, {}", self.inner.uuid, e);
            }
        }
        let res = self.inner.client.stop().await;
        self.inner.set_state(ConnectionState::Disconnected);
        if let Some(store) = self.inner.persistence.as_ref() {
            if let Err(e) = store.close() {
                log::warn!("{} closing persistence failed, {}", self.inner.uuid, e);
            }
        }
        log::info!("{} endpoint closed", self.inner.uuid);
        res
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            self.inner.wakeup.notify_one();
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").field("uuid", &self.inner.uuid).field("state", &self.state()).finish()
    }
}

/// Sole consumer of both queues and sole user of the persistence store
struct Worker {
    inner: Arc<EndpointInner>,
    inbound_rx: UnboundedReceiver<Inbound>,
    outbound_rx: UnboundedReceiver<PendingMessage>,
    unacked: HashMap<PacketId, PendingMessage>,
    ready_at: Option<Instant>,
    subscribed: bool,
}

impl Worker {
    async fn run(mut self) {
        log::info!("{} endpoint worker running ...", self.inner.uuid);
        while self.inner.running.load(Ordering::SeqCst) {
            self.process_inbound().await;
            self.process_outbound().await;
            self.check_ready().await;
            self.check_persistent_store().await;

            let timeout = self.next_timeout();
            tokio::select! {
                _ = self.inner.wakeup.notified() => {},
                _ = sleep(timeout) => {},
            }
        }

        self.process_outbound().await;
        self.process_inbound().await;
        self.persist_unacked();
        log::info!("{} endpoint worker leaving", self.inner.uuid);
    }

    fn next_timeout(&self) -> Duration {
        let poll = self.inner.settings.poll_interval.max(MIN_POLL_INTERVAL);
        match self.ready_at {
            Some(at) => at.saturating_duration_since(Instant::now()).clamp(MIN_POLL_INTERVAL, poll),
            None => poll,
        }
    }

    async fn process_inbound(&mut self) {
        while let Ok(event) = self.inbound_rx.try_recv() {
            match event {
                Inbound::Connected => self.on_connected().await,
                Inbound::Disconnected(reason) => self.on_disconnected(&reason),
                Inbound::Message { topic, payload } => {
                    if let Err(e) = self.on_message(&topic, &payload) {
                        log::error!("{} failed to process message on {}, {}", self.inner.uuid, topic, e);
                    }
                }
                Inbound::Published(packet_id) => {
                    self.unacked.remove(&packet_id);
                }
            }
        }
    }

    async fn on_connected(&mut self) {
        self.inner.set_state(ConnectionState::Connected);
        self.subscribed = false;
        self.ready_at = None;
        self.subscribe().await;
    }

    async fn subscribe(&mut self) {
        let filter = set_filter(&self.inner.uuid);
        match self.inner.client.subscribe(&filter, QoS::AtLeastOnce).await {
            Ok(()) => {
                self.subscribed = true;
                self.ready_at = Some(Instant::now() + self.inner.settings.settle_delay);
                log::info!("{} subscribed to {}", self.inner.uuid, filter);
            }
            Err(e) => log::error!("{} could not subscribe to {}, {}", self.inner.uuid, filter, e),
        }
    }

    fn on_disconnected(&mut self, reason: &str) {
        let state =
            if self.inner.client.auto_reconnect() { ConnectionState::Connecting } else { ConnectionState::Disconnected };
        self.inner.set_state(state);
        self.subscribed = false;
        self.ready_at = None;
        log::warn!("{} connection lost, {}", self.inner.uuid, reason);
        self.persist_unacked();
    }

    fn on_message(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let topic: Topic = topic.parse()?;
        if topic.action() != Action::Set {
            return Err(EndpointError::UnsupportedAction(topic.action().to_string()));
        }
        let format = self.inner.formats.detect(payload)?;
        let changed = {
            let mut model = self.inner.model.lock();
            let id = model.resolve(&topic.levels())?;
            let attribute = model.attribute_mut(id)?;
            if format.deserialize_attribute(payload, attribute)? {
                Some(attribute.clone())
            } else {
                None
            }
        };
        if let Some(attribute) = changed {
            log::debug!("{} {} changed from the cloud", self.inner.uuid, topic.path());
            attribute.notify_listeners();
        }
        Ok(())
    }

    async fn process_outbound(&mut self) {
        while let Ok(msg) = self.outbound_rx.try_recv() {
            match self.inner.client.publish(&msg.topic, msg.payload.clone(), msg.qos, msg.retain).await {
                Ok(packet_id) => self.track(packet_id, msg),
                Err(e) => {
                    log::debug!("{} publish to {} failed, {}", self.inner.uuid, msg.topic, e);
                    self.persist(&msg);
                }
            }
        }
    }

    fn track(&mut self, packet_id: PacketId, msg: PendingMessage) {
        if msg.qos == QoS::AtMostOnce {
            return;
        }
        self.unacked.insert(packet_id, msg);
        self.inner.high_water_mark.fetch_max(self.unacked.len(), Ordering::SeqCst);
    }

    async fn check_ready(&mut self) {
        match self.inner.state() {
            ConnectionState::Connected => {
                if !self.subscribed {
                    if self.inner.client.is_connected() {
                        self.subscribe().await;
                    }
                    return;
                }
                if matches!(self.ready_at, Some(at) if Instant::now() >= at) {
                    self.ready_at = None;
                    self.inner.set_state(ConnectionState::Ready);
                    log::info!("{} endpoint is ready", self.inner.uuid);
                }
            }
            ConnectionState::Connecting if self.inner.client.state() == ClientState::Idle => {
                self.inner.set_state(ConnectionState::Disconnected);
            }
            _ => {}
        }
    }

    /// Republishes stored messages oldest first, stopping at the first failure
    async fn check_persistent_store(&mut self) {
        if !self.inner.is_online() {
            return;
        }
        let Some(store) = self.inner.persistence.clone() else {
            return;
        };
        let keys = match store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                log::error!("{} can not list persistence keys, {}", self.inner.uuid, e);
                return;
            }
        };
        if keys.is_empty() {
            return;
        }

        let mut pending = Vec::with_capacity(keys.len());
        for key in keys {
            match PendingUpdate::parse(&key) {
                Ok(p) => pending.push((p, key)),
                Err(e) => {
                    log::warn!("{} discarding stored message, {}", self.inner.uuid, e);
                    if let Err(e) = store.remove(&key) {
                        log::error!("{} can not remove {}, {}", self.inner.uuid, key, e);
                    }
                }
            }
        }
        pending.sort_by(|(a, ka), (b, kb)| a.timestamp.cmp(&b.timestamp).then_with(|| ka.cmp(kb)));
        log::info!("{} replaying {} stored messages", self.inner.uuid, pending.len());

        for (p, key) in pending {
            if !self.inner.is_online() {
                break;
            }
            let payload = match store.get(&key) {
                Ok(data) => Bytes::from(data),
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    log::error!("{} can not read {}, {}", self.inner.uuid, key, e);
                    break;
                }
            };
            let topic = p.topic().to_string();
            match self.inner.client.publish(&topic, payload.clone(), self.inner.qos, false).await {
                Ok(packet_id) => {
                    if let Err(e) = store.remove(&key) {
                        log::error!("{} can not remove {}, {}", self.inner.uuid, key, e);
                    }
                    let msg =
                        PendingMessage { topic, payload, timestamp: p.timestamp, qos: self.inner.qos, retain: false };
                    self.track(packet_id, msg);
                }
                Err(e) => {
                    log::warn!("{} replay of {} failed, {}, keeping the rest", self.inner.uuid, key, e);
                    break;
                }
            }
            tokio::task::yield_now().await;
        }
    }

    fn persist_unacked(&mut self) {
        if self.unacked.is_empty() {
            return;
        }
        let unacked = std::mem::take(&mut self.unacked);
        log::info!("{} storing {} unacknowledged messages", self.inner.uuid, unacked.len());
        for msg in unacked.into_values().sorted_by_key(|m| m.timestamp) {
            self.persist(&msg);
        }
    }

    fn persist(&self, msg: &PendingMessage) {
        let Some(store) = self.inner.persistence.as_ref() else {
            log::warn!("{} no persistence configured, dropping message for {}", self.inner.uuid, msg.topic);
            return;
        };
        let topic: Topic = match msg.topic.parse() {
            Ok(topic) => topic,
            Err(e) => {
                log::warn!("{} dropping message, {}", self.inner.uuid, e);
                return;
            }
        };
        let Some(mut pending) = PendingUpdate::from_topic(&topic, msg.timestamp) else {
            log::warn!("{} unknown action type {}, dropping message", self.inner.uuid, topic.action());
            return;
        };
        loop {
            match store.contains_key(&pending.key()) {
                Ok(true) => pending.timestamp += 1,
                Ok(false) => break,
                Err(e) => {
                    log::error!("{} persistence lookup failed, {}", self.inner.uuid, e);
                    break;
                }
            }
        }
        match store.put(&pending.key(), &msg.payload) {
            Ok(()) => log::debug!("{} stored {}", self.inner.uuid, pending),
            Err(e) => log::error!("{} can not store {}, {}", self.inner.uuid, pending, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use once_cell::sync::OnceCell;
    use rmqtt_utils::ManualClock;
    use serde_json::Value;

    use super::*;
    use crate::model::{AttributeConstraint, AttributeType};
    use crate::persistence::{MemoryPersistence, PendingKind, Persistence};
    use crate::settings::Properties;
    use crate::transport::mock::MockTransport;

    const SPEED: &str = "@set/dev-1/nodes/Pump/objects/Params/attributes/speed";

    fn init_logger() {
        static LOGGER: OnceCell<()> = OnceCell::new();
        LOGGER.get_or_init(|| {
            let _ = simple_logger::SimpleLogger::new().with_level(log::LevelFilter::Debug).init();
        });
    }

    fn settings() -> Settings {
        let props: Properties = [
            ("host_uri", "tcp://localhost:1883"),
            ("retry_interval", "10ms"),
            ("settle_delay", "10ms"),
            ("poll_interval", "10ms"),
            ("persistence", "memory"),
        ]
        .into_iter()
        .collect();
        Settings::from_source(&props).unwrap()
    }

    async fn endpoint(
        transport: Arc<MockTransport>,
        store: Option<PersistenceRef>,
        clock: Arc<ManualClock>,
    ) -> Endpoint {
        init_logger();
        Endpoint::builder("dev-1")
            .settings(settings())
            .transport(transport)
            .persistence(store)
            .clock(clock)
            .build()
            .await
            .unwrap()
    }

    /// Builds `Pump/Params/speed` and attaches the node
    fn pump(endpoint: &Endpoint) -> AttributeId {
        let speed = {
            let mut model = endpoint.model();
            let node = model.create_node();
            let params = model.add_object(node, "Params").unwrap();
            model.add_attribute(params, "speed", AttributeType::Integer, AttributeConstraint::Parameter).unwrap()
        };
        let node = endpoint.model().node_of(speed).unwrap();
        endpoint.add_node("Pump", node).unwrap();
        speed
    }

    async fn wait_for<F: Fn() -> bool>(f: F) {
        for _ in 0..1000 {
            if f() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn payload_value(payload: &Bytes) -> Value {
        serde_json::from_slice::<Value>(payload).unwrap()["value"].clone()
    }

    #[tokio::test]
    async fn test_cloud_write_reaches_listener() {
        let transport = MockTransport::new();
        let clock = Arc::new(ManualClock::new(1_600_000_000_000));
        let endpoint = endpoint(transport.clone(), Some(Arc::new(MemoryPersistence::new())), clock).await;
        let speed = pump(&endpoint);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        let (c, s) = (calls.clone(), seen.clone());
        let listener: Listener = Arc::new(move |a: &Attribute| {
            c.fetch_add(1, Ordering::SeqCst);
            *s.lock() = a.value().cloned().zip(a.timestamp());
        });
        endpoint.add_listener(speed, listener).unwrap();

        wait_for(|| endpoint.is_online()).await;
        assert_eq!(transport.subscriptions(), vec!["@set/dev-1/#".to_string()]);

        transport.inject(SPEED, br#"{"timestamp":1700000000.0,"value":"42"}"#);
        wait_for(|| calls.load(Ordering::SeqCst) == 1).await;
        assert_eq!(*seen.lock(), Some((AttributeValue::Integer(42), 1_700_000_000_000)));
        {
            let model = endpoint.model();
            let attribute = model.attribute(speed).unwrap();
            assert_eq!(attribute.value(), Some(&AttributeValue::Integer(42)));
            assert_eq!(attribute.timestamp(), Some(1_700_000_000_000));
        }

        transport.inject(SPEED, br#"{"timestamp":1600000000.0,"value":7}"#);
        transport.inject(SPEED, br#"{"timestamp":1700000000.0,"value":8}"#);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.model().attribute(speed).unwrap().value(), Some(&AttributeValue::Integer(42)));

        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_messages_do_not_stop_the_worker() {
        let transport = MockTransport::new();
        let clock = Arc::new(ManualClock::new(1_600_000_000_000));
        let endpoint = endpoint(transport.clone(), None, clock).await;
        let speed = pump(&endpoint);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        endpoint
            .add_listener(speed, Arc::new(move |_: &Attribute| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        wait_for(|| endpoint.is_online()).await;

        transport.inject("@set/dev-1/nodes/Valve/objects/Params/attributes/speed", br#"{"value":1}"#);
        transport.inject(SPEED, b"\x82\x01");
        transport.inject(SPEED, b"");
        transport.inject(SPEED, br#"{"value":"fast"}"#);
        transport.inject("@update/dev-1/nodes/Pump/objects/Params/attributes/speed", br#"{"value":1}"#);
        transport.inject("garbage", b"{}");
        transport.inject(SPEED, br#"{"timestamp":1700000000.5,"value":3}"#);

        wait_for(|| calls.load(Ordering::SeqCst) == 1).await;
        assert_eq!(endpoint.model().attribute(speed).unwrap().value(), Some(&AttributeValue::Integer(3)));
        assert_eq!(endpoint.model().attribute(speed).unwrap().timestamp(), Some(1_700_000_000_500));
        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_options() {
        let transport = MockTransport::new();
        let clock = Arc::new(ManualClock::new(1));
        let endpoint = endpoint(transport.clone(), None, clock).await;
        wait_for(|| endpoint.is_online()).await;

        let options = transport.options().unwrap();
        assert_eq!(options.client_id, "dev-1-endpoint-");
        assert_eq!(options.host_uri, "tcp://localhost:1883");
        let will = options.last_will.unwrap();
        assert_eq!(will.topic, "@offline/dev-1");
        assert_eq!(will.payload, Bytes::from_static(b"DEAD"));
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(!will.retain);

        endpoint.close().await.unwrap();
        assert_eq!(endpoint.state(), ConnectionState::Disconnected);
        assert!(!transport.is_connected());
        assert!(matches!(endpoint.publish("@update/dev-1/x", Bytes::new(), 0), Err(EndpointError::Closed)));
        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_waits_for_subscription() {
        let transport = MockTransport::new();
        transport.set_fail_subscribe(true);
        let clock = Arc::new(ManualClock::new(1));
        let endpoint = endpoint(transport.clone(), None, clock).await;

        wait_for(|| endpoint.is_connected()).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(endpoint.state(), ConnectionState::Connected);
        assert!(!endpoint.is_online());

        transport.set_fail_subscribe(false);
        wait_for(|| endpoint.is_online()).await;
        assert_eq!(transport.subscriptions(), vec!["@set/dev-1/#".to_string()]);
        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_node_added_only_when_ready() {
        let transport = MockTransport::new();
        let clock = Arc::new(ManualClock::new(1));
        let endpoint = endpoint(transport.clone(), Some(Arc::new(MemoryPersistence::new())), clock).await;
        pump(&endpoint);
        assert!(endpoint.add_node("Pump", endpoint.get_node("Pump").unwrap()).unwrap_err().is_modification());

        wait_for(|| endpoint.is_online()).await;
        let valve = {
            let mut model = endpoint.model();
            let node = model.create_node();
            model.declare_interface(node, "Valve").unwrap();
            node
        };
        endpoint.add_node("Valve", valve).unwrap();
        wait_for(|| transport.published_topics().contains(&"@nodeAdded/dev-1/nodes/Valve".to_string())).await;

        assert!(!transport.published_topics().iter().any(|t| t.contains("Pump")));
        let published = transport.published();
        let node = published.iter().find(|p| p.topic == "@nodeAdded/dev-1/nodes/Valve").unwrap();
        let doc: Value = serde_json::from_slice(&node.payload).unwrap();
        assert_eq!(doc["implements"], serde_json::json!(["Valve"]));
        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_announce_is_retained() {
        let transport = MockTransport::new();
        let clock = Arc::new(ManualClock::new(1));
        let endpoint = endpoint(transport.clone(), None, clock).await;
        pump(&endpoint);
        wait_for(|| endpoint.is_online()).await;

        endpoint.announce().unwrap();
        wait_for(|| transport.published_topics().contains(&"@online/dev-1".to_string())).await;
        let published = transport.published();
        let online = published.iter().find(|p| p.topic == "@online/dev-1").unwrap();
        assert!(online.retain);
        assert_eq!(online.qos, QoS::AtLeastOnce);
        let doc: Value = serde_json::from_slice(&online.payload).unwrap();
        assert_eq!(doc["version"], "v0.2");
        assert!(doc["nodes"]["Pump"]["objects"]["Params"]["attributes"]["speed"].is_object());
        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_updates_are_replayed_in_order() {
        let transport = MockTransport::new();
        transport.refuse_connects(usize::MAX);
        let store = MemoryPersistence::new();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let endpoint = endpoint(transport.clone(), Some(Arc::new(store.clone())), clock.clone()).await;
        let speed = pump(&endpoint);

        for i in 0..5 {
            clock.advance(1);
            endpoint.set_value(speed, i).unwrap();
        }
        wait_for(|| store.len() == 5).await;
        let keys = store.keys().unwrap();
        for (i, key) in keys.iter().enumerate() {
            let p = PendingUpdate::parse(key).unwrap();
            assert_eq!(p.kind, PendingKind::Update);
            assert_eq!(p.path, "dev-1/nodes/Pump/objects/Params/attributes/speed");
            assert_eq!(p.timestamp, 1_700_000_000_001 + i as i64);
        }
        assert!(transport.published().is_empty());

        transport.refuse_connects(0);
        wait_for(|| store.is_empty().unwrap()).await;
        let published = transport.published();
        assert_eq!(published.len(), 5);
        for (i, p) in published.iter().enumerate() {
            assert_eq!(p.topic, "@update/dev-1/nodes/Pump/objects/Params/attributes/speed");
            assert_eq!(payload_value(&p.payload), Value::from(i as i64));
        }
        assert_eq!(endpoint.pending_count().unwrap(), 0);
        assert!(endpoint.unacknowledged_high_water_mark() >= 1);
        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_stops_at_first_failure() {
        let transport = MockTransport::new();
        transport.refuse_connects(usize::MAX);
        let store = MemoryPersistence::new();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let endpoint = endpoint(transport.clone(), Some(Arc::new(store.clone())), clock.clone()).await;
        let speed = pump(&endpoint);

        for i in 0..6 {
            clock.advance(1);
            endpoint.set_value(speed, i).unwrap();
        }
        wait_for(|| store.len() == 6).await;

        transport.set_publish_budget(Some(2));
        transport.refuse_connects(0);
        wait_for(|| transport.published().len() == 2).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(store.len(), 4);
        let values: Vec<Value> = transport.published().iter().map(|p| payload_value(&p.payload)).collect();
        assert_eq!(values, vec![Value::from(0), Value::from(1)]);

        transport.set_publish_budget(None);
        wait_for(|| store.is_empty().unwrap()).await;
        let values: Vec<Value> = transport.published().iter().map(|p| payload_value(&p.payload)).collect();
        assert_eq!(values, (0..6).map(Value::from).collect::<Vec<_>>());
        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_millisecond_updates_are_kept() {
        let transport = MockTransport::new();
        transport.refuse_connects(usize::MAX);
        let store = MemoryPersistence::new();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let endpoint = endpoint(transport.clone(), Some(Arc::new(store.clone())), clock).await;
        let speed = pump(&endpoint);

        endpoint.set_value(speed, 1).unwrap();
        endpoint.set_value(speed, 2).unwrap();
        wait_for(|| store.len() == 2).await;
        let timestamps: Vec<i64> =
            store.keys().unwrap().iter().map(|k| PendingUpdate::parse(k).unwrap().timestamp).collect();
        assert_eq!(timestamps, vec![1_700_000_000_000, 1_700_000_000_001]);
        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_without_persistence_offline_messages_are_dropped() {
        let transport = MockTransport::new();
        transport.refuse_connects(usize::MAX);
        let clock = Arc::new(ManualClock::new(1));
        let endpoint = endpoint(transport.clone(), None, clock).await;
        let speed = pump(&endpoint);
        endpoint.set_value(speed, 1).unwrap();
        sleep(Duration::from_millis(30)).await;
        assert_eq!(endpoint.pending_count().unwrap(), 0);

        transport.refuse_connects(0);
        wait_for(|| endpoint.is_online()).await;
        endpoint.set_value(speed, 2).unwrap();
        wait_for(|| transport.published().len() == 1).await;
        assert_eq!(payload_value(&transport.published()[0].payload), Value::from(2));
        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_after_connection_loss() {
        let transport = MockTransport::new();
        let store = MemoryPersistence::new();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let endpoint = endpoint(transport.clone(), Some(Arc::new(store.clone())), clock.clone()).await;
        let speed = pump(&endpoint);
        wait_for(|| endpoint.is_online()).await;

        transport.refuse_connects(usize::MAX);
        transport.drop_connection("broker restart");
        wait_for(|| endpoint.state() == ConnectionState::Connecting).await;
        assert!(!endpoint.is_online());
        clock.advance(5);
        endpoint.set_value(speed, 9).unwrap();
        wait_for(|| store.len() == 1).await;

        transport.refuse_connects(0);
        wait_for(|| store.is_empty().unwrap()).await;
        assert!(endpoint.is_online());
        assert_eq!(transport.subscriptions().len(), 2);
        let last = transport.published().pop().unwrap();
        assert_eq!(last.topic, "@update/dev-1/nodes/Pump/objects/Params/attributes/speed");
        assert_eq!(payload_value(&last.payload), Value::from(9));
        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unacknowledged_updates_survive_connection_loss() {
        let transport = MockTransport::new();
        transport.set_hold_acks(true);
        let store = MemoryPersistence::new();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let endpoint = endpoint(transport.clone(), Some(Arc::new(store.clone())), clock).await;
        let speed = pump(&endpoint);
        wait_for(|| endpoint.is_online()).await;

        endpoint.set_value(speed, 11).unwrap();
        wait_for(|| transport.published().len() == 1).await;
        assert!(store.is_empty().unwrap());
        assert_eq!(endpoint.unacknowledged_high_water_mark(), 1);

        transport.refuse_connects(usize::MAX);
        transport.drop_connection("broker restart");
        wait_for(|| store.len() == 1).await;
        let p = PendingUpdate::parse(&store.keys().unwrap()[0]).unwrap();
        assert_eq!(p.kind, PendingKind::Update);
        assert_eq!(p.path, "dev-1/nodes/Pump/objects/Params/attributes/speed");
        assert_eq!(p.timestamp, 1_700_000_000_000);

        transport.set_hold_acks(false);
        transport.refuse_connects(0);
        wait_for(|| store.is_empty().unwrap()).await;
        let published = transport.published();
        assert_eq!(published.len(), 2);
        for p in published {
            assert_eq!(p.topic, "@update/dev-1/nodes/Pump/objects/Params/attributes/speed");
            assert_eq!(payload_value(&p.payload), Value::from(11));
        }
        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_transaction_is_stored_and_replayed() {
        let transport = MockTransport::new();
        transport.refuse_connects(usize::MAX);
        let store = MemoryPersistence::new();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let endpoint = endpoint(transport.clone(), Some(Arc::new(store.clone())), clock).await;
        let speed = pump(&endpoint);

        let mut tx = Transaction::new();
        tx.set(speed, 21);
        endpoint.commit(tx).unwrap();
        wait_for(|| store.len() == 1).await;
        let p = PendingUpdate::parse(&store.keys().unwrap()[0]).unwrap();
        assert_eq!(p.kind, PendingKind::Transaction);
        assert_eq!(p.path, "dev-1");
        assert_eq!(p.timestamp, 1_700_000_000_000);

        transport.refuse_connects(0);
        wait_for(|| store.is_empty().unwrap()).await;
        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "@transaction/dev-1");
        let doc: Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(doc["attributes"]["dev-1/nodes/Pump/objects/Params/attributes/speed"]["value"], 21);
        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_node_added_is_stored_and_replayed() {
        let transport = MockTransport::new();
        let store = MemoryPersistence::new();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let endpoint = endpoint(transport.clone(), Some(Arc::new(store.clone())), clock).await;
        wait_for(|| endpoint.is_online()).await;

        transport.set_publish_budget(Some(0));
        let valve = {
            let mut model = endpoint.model();
            let node = model.create_node();
            model.declare_interface(node, "Valve").unwrap();
            node
        };
        endpoint.add_node("Valve", valve).unwrap();
        wait_for(|| store.len() == 1).await;
        let p = PendingUpdate::parse(&store.keys().unwrap()[0]).unwrap();
        assert_eq!(p.kind, PendingKind::NodeAdded);
        assert_eq!(p.path, "dev-1/nodes/Valve");
        assert!(transport.published().is_empty());

        transport.set_publish_budget(None);
        wait_for(|| store.is_empty().unwrap()).await;
        assert_eq!(transport.published_topics(), vec!["@nodeAdded/dev-1/nodes/Valve".to_string()]);
        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_transaction() {
        let transport = MockTransport::new();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let endpoint = endpoint(transport.clone(), None, clock).await;
        let speed = pump(&endpoint);
        let (enabled, label) = {
            let mut model = endpoint.model();
            let node = model.create_node();
            let state = model.add_object(node, "State").unwrap();
            let enabled =
                model.add_attribute(state, "enabled", AttributeType::Boolean, AttributeConstraint::Status).unwrap();
            let label =
                model.add_attribute(state, "label", AttributeType::String, AttributeConstraint::Parameter).unwrap();
            model.attach_node("Motor", node).unwrap();
            (enabled, label)
        };
        wait_for(|| endpoint.is_online()).await;

        let mut rejected = Transaction::new();
        rejected.set(speed, 5).set(enabled, "not a bool");
        assert!(endpoint.commit(rejected).is_err());
        assert_eq!(endpoint.model().attribute(speed).unwrap().value(), Some(&AttributeValue::Integer(0)));

        let mut tx = Transaction::new();
        tx.set(speed, 5).set(enabled, true).set(label, "main");
        endpoint.commit(tx).unwrap();
        wait_for(|| transport.published_topics().contains(&"@transaction/dev-1".to_string())).await;

        let published = transport.published();
        let msg = published.iter().find(|p| p.topic == "@transaction/dev-1").unwrap();
        let doc: Value = serde_json::from_slice(&msg.payload).unwrap();
        let attributes = doc["attributes"].as_object().unwrap();
        assert_eq!(attributes.len(), 3);
        assert_eq!(attributes["dev-1/nodes/Pump/objects/Params/attributes/speed"]["value"], 5);
        assert_eq!(attributes["dev-1/nodes/Motor/objects/State/attributes/enabled"]["value"], true);
        assert_eq!(endpoint.model().attribute(label).unwrap().value(), Some(&AttributeValue::from("main")));
        endpoint.close().await.unwrap();
    }
}
