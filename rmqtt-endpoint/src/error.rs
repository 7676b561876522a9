use thiserror::Error;

pub type Result<T, E = EndpointError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EndpointError {
    /// A write-once property was written twice, or a registered subtree was modified
    #[error("modification error, {0}")]
    Modification(String),
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("invalid attribute type, {0}")]
    InvalidAttributeType(String),
    #[error("invalid attribute value, {0}")]
    InvalidAttributeValue(String),
    #[error("configuration error, missing or invalid property {0:?}")]
    Configuration(String),
    #[error("not found, {0}")]
    NotFound(String),
    #[error("unsupported message format, discriminator byte {0:#04x}")]
    UnsupportedFormat(u8),
    #[error("unsupported action {0:?}")]
    UnsupportedAction(String),
    #[error("decoding error, {0}")]
    Decode(String),
    #[error("not connected")]
    NotConnected,
    #[error("transport error, {0}")]
    Transport(String),
    /// The reconnect task asked to stop and join itself
    #[error("refusing to join the reconnect task from inside itself")]
    SelfJoin,
    #[error("endpoint is closed")]
    Closed,
    #[error("io error, {0}")]
    Io(#[from] std::io::Error),
    #[error("json error, {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error, {0}")]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl EndpointError {
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, EndpointError::NotFound(_))
    }

    #[inline]
    pub fn is_modification(&self) -> bool {
        matches!(self, EndpointError::Modification(_))
    }
}
