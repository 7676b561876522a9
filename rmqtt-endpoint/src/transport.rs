//! Publish/subscribe transport consumed by the endpoint
//!
//! A concrete MQTT client implements [`Transport`] and reports connection events
//! and incoming messages to the registered [`TransportHandler`]. Handler callbacks
//! may run on the transport's own threads and must return quickly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub type PacketId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce = 0,
    #[default]
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = crate::error::EndpointError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(crate::error::EndpointError::Configuration(format!("qos = {}", v))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsOptions {
    pub authority_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectOptions {
    pub host_uri: String,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<TlsOptions>,
    pub last_will: Option<LastWill>,
}

/// Receiver of transport events
pub trait TransportHandler: Send + Sync {
    fn on_connected(&self);

    fn on_disconnected(&self, reason: &str);

    fn on_message(&self, topic: &str, payload: Bytes);

    /// Delivery of the publish with `packet_id` was confirmed
    fn on_published(&self, packet_id: PacketId);
}

pub type TransportHandlerRef = Arc<dyn TransportHandler>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Registers the receiver of all further events
    fn set_handler(&self, handler: TransportHandlerRef);

    async fn connect(&self, options: &ConnectOptions) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<PacketId>;

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<()>;

    fn is_connected(&self) -> bool;
}
