use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{EndpointError, Result};
use crate::model::{Attribute, AttributeId, Model, NodeId};

pub use self::json::JsonMessageFormat;

mod json;

/// Wire codec for model snapshots and attribute updates
pub trait MessageFormat: Send + Sync {
    /// Name announced in the endpoint's `supportedFormats`
    fn name(&self) -> &'static str;

    /// First payload bytes that identify this format
    fn discriminators(&self) -> &'static [u8];

    fn serialize_endpoint(&self, model: &Model) -> Result<Bytes>;

    fn serialize_node(&self, model: &Model, node: NodeId) -> Result<Bytes>;

    fn serialize_attribute(&self, attribute: &Attribute) -> Result<Bytes>;

    /// Several attribute updates keyed by their topic paths
    fn serialize_transaction(&self, model: &Model, attributes: &[AttributeId]) -> Result<Bytes>;

    /// Decodes a cloud write into `attribute` through [`Attribute::set_value_from_cloud`].
    /// Returns whether the attribute changed. On error the attribute is left untouched.
    fn deserialize_attribute(&self, data: &[u8], attribute: &mut Attribute) -> Result<bool>;
}

pub type MessageFormatRef = Arc<dyn MessageFormat>;

/// Registry of codecs keyed by discriminator byte, plus the codec used for outgoing messages
#[derive(Clone)]
pub struct MessageFormats {
    formats: HashMap<u8, MessageFormatRef>,
    default: MessageFormatRef,
}

impl MessageFormats {
    pub fn new(default: MessageFormatRef) -> Self {
        let mut formats = Self { formats: HashMap::new(), default: default.clone() };
        formats.register(default);
        formats
    }

    /// Registers `format` for each of its discriminators, replacing earlier registrations
    pub fn register(&mut self, format: MessageFormatRef) {
        for b in format.discriminators() {
            if let Some(old) = self.formats.insert(*b, format.clone()) {
                log::debug!("message format {} replaced by {} for byte {:#04x}", old.name(), format.name(), b);
            }
        }
    }

    #[inline]
    pub fn get(&self, discriminator: u8) -> Option<&MessageFormatRef> {
        self.formats.get(&discriminator)
    }

    /// Codec for an incoming payload, chosen by its first byte
    pub fn detect(&self, payload: &[u8]) -> Result<&MessageFormatRef> {
        let first = *payload.first().ok_or_else(|| EndpointError::Decode("empty payload".into()))?;
        self.get(first).ok_or(EndpointError::UnsupportedFormat(first))
    }

    #[inline]
    pub fn default_format(&self) -> &MessageFormatRef {
        &self.default
    }
}

impl Default for MessageFormats {
    fn default() -> Self {
        Self::new(Arc::new(JsonMessageFormat::default()))
    }
}

impl fmt::Debug for MessageFormats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys = self.formats.keys().collect::<Vec<_>>();
        keys.sort();
        f.debug_struct("MessageFormats")
            .field("discriminators", &keys)
            .field("default", &self.default.name())
            .finish()
    }
}
