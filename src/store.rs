//! File-backed JSON key/value store for plugin state.
//!
//! The store is a single JSON object whose keys are subsystem identifiers
//! and whose values are opaque payloads belonging to that subsystem. Reads
//! and writes operate on the whole object; writes go through a temp file and
//! an atomic rename so a crash mid-write leaves the previous document
//! readable.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Suffix appended to the store path to derive the process lock file.
pub const LOCK_SUFFIX: &str = ".lock";

#[derive(Debug)]
pub struct KeyValueStore {
    path: PathBuf,
    data: HashMap<String, Value>,
    modified: bool,
}

impl KeyValueStore {
    /// Opens the store at `path`, reading the existing document if present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoFailure`] on unreadable files and
    /// [`Error::ParseError`] on a corrupt document.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&contents)?
            }
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            data,
            modified: false,
        })
    }

    /// Path of the sibling lock file serializing access to this store.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(LOCK_SUFFIX);
        PathBuf::from(os)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads and decodes the payload stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParseError`] when the payload does not decode as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        match self.data.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Stores `value` under `key`, replacing any previous payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParseError`] when the value cannot be serialized.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), Error> {
        self.data.insert(key.to_string(), serde_json::to_value(value)?);
        self.modified = true;
        Ok(())
    }

    /// Removes the payload under `key`. Removing a missing key is a no-op.
    pub fn remove(&mut self, key: &str) {
        if self.data.remove(key).is_some() {
            self.modified = true;
        }
    }

    /// All keys and raw payloads currently in the store.
    #[must_use]
    pub fn get_all(&self) -> &HashMap<String, Value> {
        &self.data
    }

    /// Writes the whole document back to disk. Durable (fsync) before the
    /// rename; a no-op when nothing changed since the last flush.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IoFailure`] on any filesystem failure.
    pub fn flush(&mut self) -> Result<(), Error> {
        if !self.modified {
            return Ok(());
        }
        let json = serde_json::to_string_pretty(&self.data)?;

        let tmp_path = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        self.modified = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::KeyValueStore;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct Record {
        id: String,
        count: u32,
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyValueStore::open(dir.path().join("azure-vnet.json")).unwrap();
        assert!(store.get_all().is_empty());
    }

    #[test]
    fn test_set_flush_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("azure-vnet.json");

        let mut store = KeyValueStore::open(&path).unwrap();
        store
            .set(
                "Network",
                &Record {
                    id: "azure".to_string(),
                    count: 1,
                },
            )
            .unwrap();
        store.flush().unwrap();

        let reopened = KeyValueStore::open(&path).unwrap();
        let record: Option<Record> = reopened.get("Network").unwrap();
        assert_eq!(
            record,
            Some(Record {
                id: "azure".to_string(),
                count: 1,
            })
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("azure-vnet.json");

        let mut store = KeyValueStore::open(&path).unwrap();
        store.set("key", &1u32).unwrap();
        store.remove("key");
        store.remove("key");
        store.flush().unwrap();

        let reopened = KeyValueStore::open(&path).unwrap();
        assert!(reopened.get::<u32>("key").unwrap().is_none());
    }

    #[test]
    fn test_lock_path_is_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("azure-vnet.json");
        let store = KeyValueStore::open(&path).unwrap();
        assert_eq!(
            store.lock_path(),
            dir.path().join("azure-vnet.json.lock")
        );
    }

    #[test]
    fn test_corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("azure-vnet.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(KeyValueStore::open(&path).is_err());
    }
}
