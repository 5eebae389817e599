use std::path::PathBuf;
use std::sync::Arc;

use crate::app::errors::{AppError, AppResult};
use crate::database::Database;
use crate::storage::KeyValueStore;

pub const DEFAULT_APP_NAME: &str = "[DEFAULT]";
pub const DEFAULT_IDENTITY_KEY: &str = "sf-rental-user-id";
pub const DEFAULT_CACHE_KEY: &str = "saved-properties";
pub const DEFAULT_INACTIVITY_DAYS: u32 = 30;

pub const ENV_DATABASE_URL: &str = "SAVED_SYNC_DATABASE_URL";
pub const ENV_STORAGE_DIR: &str = "SAVED_SYNC_STORAGE_DIR";
pub const ENV_INACTIVITY_DAYS: &str = "SAVED_SYNC_INACTIVITY_DAYS";

/// Configuration for the sync engine. Every field is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Base URL of the Realtime Database, e.g. `https://demo.firebaseio.com`.
    pub database_url: Option<String>,
    /// Directory for durable local storage. `None` keeps everything in memory.
    pub storage_dir: Option<PathBuf>,
    pub identity_key: Option<String>,
    pub cache_key: Option<String>,
    /// Days without activity after which a remote partition is swept.
    pub inactivity_days: Option<u32>,
}

impl SyncOptions {
    /// Reads options from `SAVED_SYNC_*` environment variables.
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let inactivity_days = match non_empty(ENV_INACTIVITY_DAYS) {
            Some(raw) => Some(raw.trim().parse::<u32>().map_err(|err| {
                AppError::InvalidOption {
                    option: ENV_INACTIVITY_DAYS.to_string(),
                    message: format!("expected a whole number of days, got '{raw}': {err}"),
                }
            })?),
            None => None,
        };

        Ok(Self {
            database_url: non_empty(ENV_DATABASE_URL),
            storage_dir: non_empty(ENV_STORAGE_DIR).map(PathBuf::from),
            identity_key: None,
            cache_key: None,
            inactivity_days,
        })
    }

    pub fn identity_key(&self) -> &str {
        self.identity_key.as_deref().unwrap_or(DEFAULT_IDENTITY_KEY)
    }

    pub fn cache_key(&self) -> &str {
        self.cache_key.as_deref().unwrap_or(DEFAULT_CACHE_KEY)
    }

    pub fn inactivity_days(&self) -> u32 {
        self.inactivity_days.unwrap_or(DEFAULT_INACTIVITY_DAYS)
    }

    pub(crate) fn validate(&self) -> AppResult<()> {
        for (option, value) in [
            ("identity_key", self.identity_key.as_deref()),
            ("cache_key", self.cache_key.as_deref()),
        ] {
            if matches!(value, Some(key) if key.trim().is_empty()) {
                return Err(AppError::InvalidOption {
                    option: option.to_string(),
                    message: "local storage keys cannot be empty".to_string(),
                });
            }
        }
        if self.identity_key() == self.cache_key() {
            return Err(AppError::InvalidOption {
                option: "cache_key".to_string(),
                message: "must differ from identity_key".to_string(),
            });
        }
        if self.inactivity_days == Some(0) {
            return Err(AppError::InvalidOption {
                option: "inactivity_days".to_string(),
                message: "must be at least one day".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncAppSettings {
    pub name: Option<String>,
}

/// Context shared by every component of one sync engine instance.
///
/// Cloning is cheap; clones share the database handle and the local store.
#[derive(Clone)]
pub struct SyncApp {
    inner: Arc<SyncAppInner>,
}

struct SyncAppInner {
    name: String,
    options: SyncOptions,
    database: Database,
    store: Arc<dyn KeyValueStore>,
}

impl SyncApp {
    /// Builds a context over explicit storage and database handles.
    pub fn with_parts(
        options: SyncOptions,
        settings: SyncAppSettings,
        store: Arc<dyn KeyValueStore>,
        database: Database,
    ) -> AppResult<Self> {
        options.validate()?;
        let name = settings
            .name
            .unwrap_or_else(|| DEFAULT_APP_NAME.to_string());
        if name.trim().is_empty() {
            return Err(AppError::BadAppName { app_name: name });
        }
        Ok(Self {
            inner: Arc::new(SyncAppInner {
                name,
                options,
                database,
                store,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &SyncOptions {
        &self.inner.options
    }

    pub fn database(&self) -> &Database {
        &self.inner.database
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        self.inner.store.clone()
    }
}

impl std::fmt::Debug for SyncApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncApp")
            .field("name", &self.name())
            .field("options", self.options())
            .field("database", self.database())
            .finish()
    }
}
