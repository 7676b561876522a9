use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::error::{EndpointError, Result};
use crate::transport::{
    ConnectOptions, PacketId, QoS, Transport, TransportHandler, TransportHandlerRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
}

/// Transport wrapper that keeps reconnecting in a background task
#[derive(Clone)]
pub struct ReconnectClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    options: ConnectOptions,
    retry_interval: Duration,
    auto_reconnect: AtomicBool,
    state: RwLock<ClientState>,
    connect_signal: Notify,
    retry: Mutex<Option<RetryTask>>,
    restart_requested: AtomicBool,
    handler: RwLock<Option<TransportHandlerRef>>,
    runtime: Handle,
}

struct RetryTask {
    id: tokio::task::Id,
    looping: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ReconnectClient {
    /// Must be called from within a tokio runtime, the retry task is spawned onto it.
    /// A zero `retry_interval` means a single connection attempt.
    pub fn new(
        transport: Arc<dyn Transport>,
        options: ConnectOptions,
        retry_interval: Duration,
        auto_reconnect: bool,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| anyhow!(e))?;
        let inner = Arc::new(ClientInner {
            transport,
            options,
            retry_interval,
            auto_reconnect: AtomicBool::new(auto_reconnect),
            state: RwLock::new(ClientState::Idle),
            connect_signal: Notify::new(),
            retry: Mutex::new(None),
            restart_requested: AtomicBool::new(false),
            handler: RwLock::new(None),
            runtime,
        });
        inner.transport.set_handler(Arc::new(ClientHandler { inner: Arc::downgrade(&inner) }));
        Ok(Self { inner })
    }

    /// Receiver of connection events and messages, set before [`ReconnectClient::start`]
    pub fn set_handler(&self, handler: TransportHandlerRef) {
        *self.inner.handler.write() = Some(handler);
    }

    #[inline]
    pub fn client_id(&self) -> &str {
        &self.inner.options.client_id
    }

    #[inline]
    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    #[inline]
    pub fn state(&self) -> ClientState {
        *self.inner.state.read()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected && self.inner.transport.is_connected()
    }

    #[inline]
    pub fn auto_reconnect(&self) -> bool {
        self.inner.auto_reconnect.load(Ordering::SeqCst)
    }

    pub fn is_retrying(&self) -> bool {
        self.inner.retry.lock().as_ref().map(|t| !t.handle.is_finished()).unwrap_or(false)
    }

    /// Starts connecting in the background
    pub fn start(&self) {
        self.inner.start_retry_task();
    }

    /// Disables auto-reconnect, stops the retry task and disconnects.
    /// Refused with [`EndpointError::SelfJoin`] when called from the retry task itself.
    pub async fn stop(&self) -> Result<()> {
        if self.inner.is_retry_task() {
            log::warn!("{} stop requested from the reconnect task, refusing to join myself", self.client_id());
            return Err(EndpointError::SelfJoin);
        }
        self.inner.auto_reconnect.store(false, Ordering::SeqCst);

        let task = self.inner.retry.lock().take();
        if let Some(task) = task {
            task.looping.store(false, Ordering::SeqCst);
            self.inner.connect_signal.notify_one();
            if let Err(e) = task.handle.await {
                log::warn!("{} reconnect task ended abnormally, {}", self.client_id(), e);
            }
        }

        let res = self.inner.transport.disconnect().await;
        *self.inner.state.write() = ClientState::Idle;
        log::info!("{} stopped", self.client_id());
        res
    }

    pub async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<PacketId> {
        if !self.is_connected() {
            return Err(EndpointError::NotConnected);
        }
        self.inner.transport.publish(topic, payload, qos, retain).await
    }

    pub async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<()> {
        if !self.is_connected() {
            return Err(EndpointError::NotConnected);
        }
        self.inner.transport.subscribe(topic_filter, qos).await
    }
}

impl fmt::Debug for ReconnectClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectClient")
            .field("client_id", &self.client_id())
            .field("host_uri", &self.inner.options.host_uri)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientInner {
    fn is_retry_task(&self) -> bool {
        match tokio::task::try_id() {
            Some(id) => self.retry.lock().as_ref().map(|t| t.id == id).unwrap_or(false),
            None => false,
        }
    }

    fn start_retry_task(self: &Arc<Self>) {
        if self.is_retry_task() {
            log::debug!("{} restart requested from the reconnect task, looping again", self.options.client_id);
            self.restart_requested.store(true, Ordering::SeqCst);
            return;
        }

        let mut retry = self.retry.lock();
        if let Some(task) = retry.as_ref() {
            if !task.handle.is_finished() {
                log::warn!("{} reconnect task is already running", self.options.client_id);
                self.restart_requested.store(true, Ordering::SeqCst);
                return;
            }
        }

        *self.state.write() = ClientState::Connecting;
        let looping = Arc::new(AtomicBool::new(true));
        let handle = self.runtime.spawn(self.clone().retry_loop(looping.clone()));
        *retry = Some(RetryTask { id: handle.id(), looping, handle });
    }

    async fn retry_loop(self: Arc<Self>, looping: Arc<AtomicBool>) {
        log::info!("{} reconnect task running ...", self.options.client_id);
        loop {
            self.restart_requested.store(false, Ordering::SeqCst);
            if self.connect(&looping).await {
                *self.state.write() = ClientState::Connected;
                log::info!("{} connected to {}", self.options.client_id, self.options.host_uri);
                if let Some(h) = self.handler() {
                    h.on_connected();
                }
            } else {
                *self.state.write() = ClientState::Idle;
                if looping.load(Ordering::SeqCst) {
                    log::warn!("{} giving up connecting to {}", self.options.client_id, self.options.host_uri);
                }
            }

            // Decided under the slot lock, a later restart request then finds the slot empty
            let mut retry = self.retry.lock();
            let again = self.restart_requested.swap(false, Ordering::SeqCst)
                && looping.load(Ordering::SeqCst)
                && self.auto_reconnect.load(Ordering::SeqCst)
                && !self.transport.is_connected();
            if !again {
                let current = tokio::task::try_id();
                if current.is_some() && retry.as_ref().map(|t| Some(t.id) == current).unwrap_or(false) {
                    *retry = None;
                }
                break;
            }
            drop(retry);
            *self.state.write() = ClientState::Connecting;
        }
        log::info!("{} reconnect task leaving", self.options.client_id);
    }

    /// Tries until connected, stopped or out of attempts; returns whether connected
    async fn connect(&self, looping: &AtomicBool) -> bool {
        if let Err(e) = self.transport.disconnect().await {
            log::debug!("{} disconnect before connecting failed, {}", self.options.client_id, e);
        }
        while looping.load(Ordering::SeqCst) && !self.transport.is_connected() {
            log::info!("{} connecting to {} ...", self.options.client_id, self.options.host_uri);
            if let Err(e) = self.transport.connect(&self.options).await {
                log::warn!("{} connect to {} failed, {}", self.options.client_id, self.options.host_uri, e);
                if let Err(e) = self.transport.disconnect().await {
                    log::debug!("{} disconnect after failed connect, {}", self.options.client_id, e);
                }
            }
            if self.transport.is_connected() || !looping.load(Ordering::SeqCst) {
                break;
            }
            if self.retry_interval.is_zero() {
                break;
            }
            tokio::select! {
                _ = self.connect_signal.notified() => {},
                _ = sleep(self.retry_interval) => {},
            }
        }
        looping.load(Ordering::SeqCst) && self.transport.is_connected()
    }

    fn handler(&self) -> Option<TransportHandlerRef> {
        self.handler.read().clone()
    }
}

/// Receives transport events on behalf of the client
struct ClientHandler {
    inner: Weak<ClientInner>,
}

impl TransportHandler for ClientHandler {
    fn on_connected(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.connect_signal.notify_one();
        }
    }

    fn on_disconnected(&self, reason: &str) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        log::info!("{} connection lost, {}", inner.options.client_id, reason);
        if inner.auto_reconnect.load(Ordering::SeqCst) {
            inner.start_retry_task();
        } else {
            *inner.state.write() = ClientState::Idle;
        }
        if let Some(h) = inner.handler() {
            h.on_disconnected(reason);
        }
    }

    fn on_message(&self, topic: &str, payload: Bytes) {
        if let Some(h) = self.inner.upgrade().and_then(|inner| inner.handler()) {
            h.on_message(topic, payload);
        }
    }

    fn on_published(&self, packet_id: PacketId) {
        if let Some(h) = self.inner.upgrade().and_then(|inner| inner.handler()) {
            h.on_published(packet_id);
        }
    }
}
