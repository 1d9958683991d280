//! Key/value state store the poller persists station data and cross-cycle records into.
//!
//! Keys are dot-separated paths (`cities.<city>.<station>.freePorts`). Deleting a key removes
//! the whole subtree below it.

use crate::api::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub value: Value,
    /// Last time the value changed.
    pub ts: DateTime<Utc>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StateEntry>, Error>;

    /// Upsert `value`; the timestamp only moves when the value actually changes.
    async fn set(&self, key: &str, value: Value) -> Result<(), Error>;

    /// Remove `key` and everything below it.
    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// All keys equal to or below `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, Error>;

    async fn value(&self, key: &str) -> Result<Option<Value>, Error> {
        Ok(self.get(key).await?.map(|e| e.value))
    }
}

/// Key of a per-station cross-cycle record field.
pub fn meta_key(station: &str, field: &str) -> String {
    format!("meta.{}.{}", station, field)
}

/// Root of a station's data subtree.
pub fn station_root(city: &str, station: &str) -> String {
    let city = match crate::model::station_key(city) {
        c if c.is_empty() => crate::model::station_key(crate::model::UNKNOWN_CITY),
        c => c,
    };
    format!("cities.{}.{}", city, station)
}

pub fn is_below(key: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || key == prefix
        || (key.starts_with(prefix) && key[prefix.len()..].starts_with('.'))
}

/// In-memory store, lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StateEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether anything changed.
    fn upsert(&self, key: &str, value: Value) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.value == value => false,
            Some(mut entry) => {
                entry.value = value;
                entry.ts = Utc::now();
                true
            }
            None => {
                self.entries.insert(
                    key.to_string(),
                    StateEntry {
                        value,
                        ts: Utc::now(),
                    },
                );
                true
            }
        }
    }

    fn remove_below(&self, prefix: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|k, _| !is_below(k, prefix));
        before != self.entries.len()
    }

    fn keys_below(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| is_below(e.key(), prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StateEntry>, Error> {
        Ok(self.entries.get(key).map(|e| e.clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), Error> {
        self.upsert(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.remove_below(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(self.keys_below(prefix))
    }
}

/// Durable store: an in-memory map written through to a JSON file on every change.
pub struct FileStore {
    path: PathBuf,
    memory: MemoryStore,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<FileStore, Error> {
        let path = path.into();
        let memory = MemoryStore::new();

        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                let entries: BTreeMap<String, StateEntry> = serde_json::from_str(&text)
                    .map_err(|e| Error::Store(format!("{}: {}", path.display(), e)))?;
                for (key, entry) in entries {
                    memory.entries.insert(key, entry);
                }
                log::info!(
                    "Loaded {} state entries from {}",
                    memory.entries.len(),
                    path.display()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No state file at {}, starting empty", path.display());
            }
            Err(e) => return Err(Error::Store(format!("{}: {}", path.display(), e))),
        }

        Ok(FileStore {
            path,
            memory,
            write_lock: Mutex::new(()),
        })
    }

    async fn persist(&self) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let snapshot: BTreeMap<String, StateEntry> = self
            .memory
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let text = serde_json::to_string_pretty(&snapshot)?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| Error::Store(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Store(format!("{}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<StateEntry>, Error> {
        self.memory.get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), Error> {
        if self.memory.upsert(key, value) {
            self.persist().await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        if self.memory.remove_below(key) {
            self.persist().await?;
        }
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(self.memory.keys_below(prefix))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn temp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "chargespot-{}-{}-{}.json",
            name,
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        p
    }

    #[test]
    fn prefix_matching() {
        assert!(is_below("meta.alpha.notified", "meta.alpha"));
        assert!(is_below("meta.alpha", "meta.alpha"));
        assert!(!is_below("meta.alphabet.notified", "meta.alpha"));
        assert!(is_below("anything", ""));
    }

    #[tokio::test]
    async fn set_only_moves_timestamp_on_change() {
        let store = MemoryStore::new();
        store.set("a.b", json!(1)).await.unwrap();
        let first = store.get("a.b").await.unwrap().unwrap();
        store.set("a.b", json!(1)).await.unwrap();
        assert_eq!(first, store.get("a.b").await.unwrap().unwrap());

        store.set("a.b", json!(2)).await.unwrap();
        let second = store.get("a.b").await.unwrap().unwrap();
        assert_eq!(json!(2), second.value);
        assert!(second.ts >= first.ts);
    }

    #[tokio::test]
    async fn delete_is_recursive() {
        let store = MemoryStore::new();
        store.set("cities.x.alpha.status", json!("available")).await.unwrap();
        store.set("cities.x.alpha.ports.1.status", json!("available")).await.unwrap();
        store.set("cities.x.alphabet.status", json!("in_use")).await.unwrap();

        store.delete("cities.x.alpha").await.unwrap();

        assert_eq!(
            vec!["cities.x.alphabet.status".to_string()],
            store.keys("cities").await.unwrap()
        );
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let path = temp_path("reopen");
        {
            let store = FileStore::open(&path).await.unwrap();
            store.set("meta.beta.lastFreePorts", json!(0)).await.unwrap();
            store.set("meta.beta.notified", json!(true)).await.unwrap();
            store.delete("meta.beta.notified").await.unwrap();
        }

        let store = FileStore::open(&path).await.unwrap();
        assert_eq!(
            Some(json!(0)),
            store.value("meta.beta.lastFreePorts").await.unwrap()
        );
        assert_eq!(None, store.value("meta.beta.notified").await.unwrap());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn file_store_rejects_corrupt_file() {
        let path = temp_path("corrupt");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(FileStore::open(&path).await, Err(Error::Store(_))));
        let _ = std::fs::remove_file(&path);
    }
}
