//! Synchronous string key-value storage on the local device.
//!
//! This is the durable layer under the identity key and the local cache. The
//! [`KeyValueStore`] trait mirrors the shape of browser `localStorage`; plug in a
//! platform store by implementing it or by wrapping closures in a [`ClosureStore`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub mod error;
mod file;

pub use error::{StorageError, StorageErrorCode, StorageResult};
pub use file::FileStore;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
}

/// Volatile store; contents live as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

type DynGetFn = dyn Fn(&str) -> StorageResult<Option<String>> + Send + Sync;
type DynSetFn = dyn Fn(&str, &str) -> StorageResult<()> + Send + Sync;
type DynRemoveFn = dyn Fn(&str) -> StorageResult<()> + Send + Sync;

/// Store backed by caller-provided closures.
pub struct ClosureStore {
    get_fn: Arc<DynGetFn>,
    set_fn: Arc<DynSetFn>,
    remove_fn: Arc<DynRemoveFn>,
}

impl ClosureStore {
    pub fn new<Get, Set, Remove>(get: Get, set: Set, remove: Remove) -> Self
    where
        Get: Fn(&str) -> StorageResult<Option<String>> + Send + Sync + 'static,
        Set: Fn(&str, &str) -> StorageResult<()> + Send + Sync + 'static,
        Remove: Fn(&str) -> StorageResult<()> + Send + Sync + 'static,
    {
        Self {
            get_fn: Arc::new(get),
            set_fn: Arc::new(set),
            remove_fn: Arc::new(remove),
        }
    }

    /// A store whose every operation fails, as when storage is disabled by the host.
    pub fn unavailable() -> Self {
        Self::new(
            |_| Err(error::unavailable("Local storage is disabled")),
            |_, _| Err(error::unavailable("Local storage is disabled")),
            |_| Err(error::unavailable("Local storage is disabled")),
        )
    }
}

impl KeyValueStore for ClosureStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        (self.get_fn)(key)
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        (self.set_fn)(key, value)
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        (self.remove_fn)(key)
    }
}
