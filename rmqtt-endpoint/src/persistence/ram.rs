use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::Persistence;
use crate::error::{EndpointError, Result};

/// Volatile store, entries are lost with the process. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    inner: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryPersistence {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }
}

impl Persistence for MemoryPersistence {
    fn open(&self, client_id: &str, server_uri: &str) -> Result<()> {
        log::debug!("memory persistence opened for {} at {}", client_id, server_uri);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn put(&self, key: &str, payload: &[u8]) -> Result<()> {
        self.inner.write().insert(key.into(), payload.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.read().get(key).cloned().ok_or_else(|| EndpointError::NotFound(format!("key {:?}", key)))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.inner.read().contains_key(key))
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.inner.read().keys().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        self.inner.write().clear();
        Ok(())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.inner.read().is_empty())
    }
}
