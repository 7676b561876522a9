use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use rmqtt_utils::sanitize_path_component;

use super::Persistence;
use crate::error::{EndpointError, Result};

const DEFAULT_DIR: &str = ".rmqtt-endpoint/persistence";
const TMP_PREFIX: char = '.';

/// One file per key in `<base>/<client_id-server_uri>`
#[derive(Debug)]
pub struct FilePersistence {
    base: PathBuf,
    dir: RwLock<PathBuf>,
}

impl FilePersistence {
    /// Without a location the store lives in `$HOME/.rmqtt-endpoint/persistence`
    pub fn new<P: AsRef<Path>>(location: Option<P>) -> Result<Self> {
        let base = match location {
            Some(location) => location.as_ref().to_path_buf(),
            None => std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir)
                .join(DEFAULT_DIR),
        };
        fs::create_dir_all(&base)?;
        let dir = base.join(uuid::Uuid::new_v4().simple().to_string());
        Ok(Self { base, dir: RwLock::new(dir) })
    }

    #[inline]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory of the currently open storage area
    #[inline]
    pub fn dir(&self) -> PathBuf {
        self.dir.read().clone()
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with(TMP_PREFIX) || key.contains(['/', '\\']) {
            return Err(EndpointError::InvalidName(key.into()));
        }
        Ok(self.dir.read().join(key))
    }
}

impl Persistence for FilePersistence {
    fn open(&self, client_id: &str, server_uri: &str) -> Result<()> {
        let dir = self.base.join(sanitize_path_component(&format!("{}-{}", client_id, server_uri)));
        fs::create_dir_all(&dir)?;
        log::debug!("file persistence opened at {:?}", dir);
        *self.dir.write() = dir;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn put(&self, key: &str, payload: &[u8]) -> Result<()> {
        let path = self.path(key)?;
        let dir = self.dir();
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!("{}{}.tmp", TMP_PREFIX, key));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        match fs::read(self.path(key)?) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(EndpointError::NotFound(format!("key {:?}", key))),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.path(key)?.is_file())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with(TMP_PREFIX) {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> Result<()> {
        for key in self.keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }
}
