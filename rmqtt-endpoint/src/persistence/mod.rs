//! Durable store of updates that could not be delivered
//!
//! Entries are keyed `<Prefix>-<escaped topic path>-<timestampMillis>` and hold the
//! encoded payload. The endpoint worker is the only user of a store.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use rmqtt_utils::TimestampMillis;

use crate::error::{EndpointError, Result};
use crate::topic::{escape, unescape, Action, Topic};

pub use self::file::FilePersistence;
pub use self::ram::MemoryPersistence;

mod file;
mod ram;

const KEY_SEPARATOR: char = '-';

/// Key/value store for pending messages
pub trait Persistence: Send + Sync {
    /// Selects the storage area for one client/server pair
    fn open(&self, client_id: &str, server_uri: &str) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// Stores `payload` under `key`, replacing any previous entry
    fn put(&self, key: &str, payload: &[u8]) -> Result<()>;

    /// Fails with [`EndpointError::NotFound`] for unknown keys
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Removing an unknown key is not an error
    fn remove(&self, key: &str) -> Result<()>;

    fn contains_key(&self, key: &str) -> Result<bool>;

    /// All keys in ascending order
    fn keys(&self) -> Result<Vec<String>>;

    fn clear(&self) -> Result<()>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.keys()?.is_empty())
    }
}

pub type PersistenceRef = Arc<dyn Persistence>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceType {
    Memory,
    #[default]
    File,
    None,
}

impl FromStr for PersistenceType {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(PersistenceType::Memory),
            "file" => Ok(PersistenceType::File),
            "none" => Ok(PersistenceType::None),
            _ => Err(EndpointError::Configuration(format!("persistence = {}", s))),
        }
    }
}

/// Builds the store selected by configuration, `None` when persistence is disabled
pub fn build(typ: PersistenceType, location: &str) -> Result<Option<PersistenceRef>> {
    let store: Option<PersistenceRef> = match typ {
        PersistenceType::Memory => Some(Arc::new(MemoryPersistence::new())),
        PersistenceType::File => {
            let location = if location.is_empty() { None } else { Some(location) };
            Some(Arc::new(FilePersistence::new(location)?))
        }
        PersistenceType::None => None,
    };
    Ok(store)
}

/// Kind of a pending message, stored as the key prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingKind {
    Update,
    NodeAdded,
    Transaction,
}

impl PendingKind {
    #[inline]
    pub fn prefix(&self) -> &'static str {
        match self {
            PendingKind::Update => "PendingUpdate",
            PendingKind::NodeAdded => "PendingNodeAdded",
            PendingKind::Transaction => "PendingTransaction",
        }
    }

    #[inline]
    pub fn action(&self) -> Action {
        match self {
            PendingKind::Update => Action::Update,
            PendingKind::NodeAdded => Action::NodeAdded,
            PendingKind::Transaction => Action::Transaction,
        }
    }

    /// Kind for messages of `action`, `None` if such messages are never stored
    #[inline]
    pub fn from_action(action: Action) -> Option<PendingKind> {
        match action {
            Action::Update => Some(PendingKind::Update),
            Action::NodeAdded => Some(PendingKind::NodeAdded),
            Action::Transaction => Some(PendingKind::Transaction),
            Action::Online | Action::Offline | Action::Set => None,
        }
    }

    fn from_prefix(prefix: &str) -> Option<PendingKind> {
        match prefix {
            "PendingUpdate" => Some(PendingKind::Update),
            "PendingNodeAdded" => Some(PendingKind::NodeAdded),
            "PendingTransaction" => Some(PendingKind::Transaction),
            _ => None,
        }
    }
}

/// Decoded persistence key of an undelivered message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingUpdate {
    pub kind: PendingKind,
    /// Topic path without the action level
    pub path: String,
    pub timestamp: TimestampMillis,
}

impl PendingUpdate {
    #[inline]
    pub fn new<P: Into<String>>(kind: PendingKind, path: P, timestamp: TimestampMillis) -> Self {
        Self { kind, path: path.into(), timestamp }
    }

    /// Pending entry for a message published on `topic`, `None` if that kind of message is not stored
    pub fn from_topic(topic: &Topic, timestamp: TimestampMillis) -> Option<Self> {
        PendingKind::from_action(topic.action()).map(|kind| Self::new(kind, topic.path(), timestamp))
    }

    #[inline]
    pub fn key(&self) -> String {
        format!("{}{}{}{}{}", self.kind.prefix(), KEY_SEPARATOR, escape(&self.path), KEY_SEPARATOR, self.timestamp)
    }

    /// Topic the message is republished on
    #[inline]
    pub fn topic(&self) -> Topic {
        Topic::new(self.kind.action(), self.path.clone())
    }

    pub fn parse(key: &str) -> Result<Self> {
        let invalid = || EndpointError::Decode(format!("invalid persistence key {:?}", key));
        let (prefix, rest) = key.split_once(KEY_SEPARATOR).ok_or_else(invalid)?;
        let (path, timestamp) = rest.rsplit_once(KEY_SEPARATOR).ok_or_else(invalid)?;
        let kind = PendingKind::from_prefix(prefix).ok_or_else(invalid)?;
        let timestamp = timestamp.parse::<TimestampMillis>().map_err(|_| invalid())?;
        if path.is_empty() {
            return Err(invalid());
        }
        Ok(Self { kind, path: unescape(path), timestamp })
    }
}

impl fmt::Display for PendingUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key() {
        let p = PendingUpdate::new(
            PendingKind::Update,
            "dev-1/nodes/Pump/objects/Params/attributes/speed",
            1_700_000_000_000,
        );
        let key = p.key();
        assert_eq!(key, "PendingUpdate-dev-1;nodes;Pump;objects;Params;attributes;speed-1700000000000");
        assert_eq!(PendingUpdate::parse(&key).unwrap(), p);
        assert_eq!(p.topic().to_string(), "@update/dev-1/nodes/Pump/objects/Params/attributes/speed");

        let n = PendingUpdate::new(PendingKind::NodeAdded, "dev-1/nodes/Pump", 5);
        assert_eq!(n.key(), "PendingNodeAdded-dev-1;nodes;Pump-5");
        assert_eq!(PendingUpdate::parse(&n.key()).unwrap(), n);
        assert_eq!(n.topic().to_string(), "@nodeAdded/dev-1/nodes/Pump");
    }

    #[test]
    fn test_parse_invalid() {
        for key in [
            "PendingUpdate",
            "PendingUpdate-path",
            "PendingUpdate-path-abc",
            "PendingUpdate--12",
            "Other-a;b-12",
        ] {
            assert!(PendingUpdate::parse(key).is_err(), "{}", key);
        }
    }

    #[test]
    fn test_from_topic() {
        let t: Topic = "@transaction/dev-1".parse().unwrap();
        let p = PendingUpdate::from_topic(&t, 9).unwrap();
        assert_eq!(p.kind, PendingKind::Transaction);
        assert_eq!(p.key(), "PendingTransaction-dev-1-9");
        let online: Topic = "@online/dev-1".parse().unwrap();
        assert!(PendingUpdate::from_topic(&online, 9).is_none());
    }

    #[test]
    fn test_persistence_type() {
        assert_eq!("Memory".parse::<PersistenceType>().unwrap(), PersistenceType::Memory);
        assert_eq!("file".parse::<PersistenceType>().unwrap(), PersistenceType::File);
        assert_eq!("none".parse::<PersistenceType>().unwrap(), PersistenceType::None);
        assert!("disk".parse::<PersistenceType>().is_err());
        assert!(build(PersistenceType::None, "").unwrap().is_none());
        assert!(build(PersistenceType::Memory, "").unwrap().is_some());
    }
}
