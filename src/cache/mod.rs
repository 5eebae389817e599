//! Last-known saved collection on the local device.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use crate::app::SyncApp;
use crate::collection::SavedCollection;
use crate::logger::Logger;
use crate::storage::error::serialization_error;
use crate::storage::{KeyValueStore, StorageError};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@saved-sync/cache"));

/// Synchronous cache of the whole collection under one local key.
///
/// If the local store starts failing the cache switches to degraded mode: the last
/// written collection is kept in memory for the rest of the session.
#[derive(Clone)]
pub struct LocalCache {
    inner: Arc<LocalCacheInner>,
}

struct LocalCacheInner {
    store: Arc<dyn KeyValueStore>,
    key: String,
    degraded: AtomicBool,
    session_copy: Mutex<Option<String>>,
}

impl fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCache")
            .field("key", &self.inner.key)
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl LocalCache {
    pub fn new(app: &SyncApp) -> Self {
        Self::with_store(app.store(), app.options().cache_key())
    }

    pub fn with_store(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LocalCacheInner {
                store,
                key: key.into(),
                degraded: AtomicBool::new(false),
                session_copy: Mutex::new(None),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Returns the cached collection, `None` if nothing was ever written.
    pub fn load(&self) -> Option<SavedCollection> {
        let raw = if self.is_degraded() {
            self.inner.session_copy.lock().unwrap().clone()
        } else {
            match self.inner.store.get(&self.inner.key) {
                Ok(raw) => raw,
                Err(err) => {
                    self.degrade(&err);
                    self.inner.session_copy.lock().unwrap().clone()
                }
            }
        }?;

        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(value) => Some(SavedCollection::from_remote_value(value).unwrap_or_default()),
            Err(err) => {
                LOGGER.warn(format!(
                    "Ignoring unreadable cached collection: {}",
                    serialization_error(err.to_string())
                ));
                None
            }
        }
    }

    /// Overwrites the cached collection.
    pub fn store(&self, collection: &SavedCollection) {
        let raw = match serde_json::to_string(collection) {
            Ok(raw) => raw,
            Err(err) => {
                LOGGER.error(format!(
                    "Failed to encode collection for the local cache: {err}"
                ));
                return;
            }
        };
        *self.inner.session_copy.lock().unwrap() = Some(raw.clone());

        if self.is_degraded() {
            return;
        }
        if let Err(err) = self.inner.store.set(&self.inner.key, &raw) {
            self.degrade(&err);
        }
    }

    /// Whether the cache fell back to session memory after a storage failure.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    fn degrade(&self, err: &StorageError) {
        if !self.inner.degraded.swap(true, Ordering::SeqCst) {
            LOGGER.warn(format!(
                "Local cache unavailable, keeping saved properties in memory for this session: {err}"
            ));
        }
    }
}
