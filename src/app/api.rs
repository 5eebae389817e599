use std::sync::Arc;

use crate::app::errors::AppResult;
use crate::app::logger::LOGGER;
use crate::app::types::{SyncApp, SyncAppSettings, SyncOptions};
use crate::database::Database;
use crate::storage::{FileStore, InMemoryStore, KeyValueStore};

pub static SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Builds the context for one sync engine instance.
///
/// Local storage lives under `options.storage_dir` when it is set and usable, and in
/// memory otherwise. The remote side is the REST backend for `options.database_url`,
/// or a process-local backend when no usable URL is configured.
pub fn initialize_app(options: SyncOptions, settings: Option<SyncAppSettings>) -> AppResult<SyncApp> {
    options.validate()?;
    let store = select_store(&options);
    let database = Database::from_url(options.database_url.as_deref());
    let app = SyncApp::with_parts(options, settings.unwrap_or_default(), store, database)?;
    LOGGER.debug(format!("Initialized sync app '{}' (v{SDK_VERSION})", app.name()));
    Ok(app)
}

fn select_store(options: &SyncOptions) -> Arc<dyn KeyValueStore> {
    if let Some(dir) = &options.storage_dir {
        match FileStore::new(dir) {
            Ok(store) => return Arc::new(store),
            Err(err) => {
                LOGGER.warn(format!(
                    "Local storage unavailable, keeping this session in memory: {err}"
                ));
            }
        }
    }
    Arc::new(InMemoryStore::new())
}
