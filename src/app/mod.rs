//! # App context
//!
//! [`SyncApp`] bundles what every sync component needs: the resolved
//! [`SyncOptions`], a [`Database`](crate::database::Database) handle and the local
//! [`KeyValueStore`](crate::storage::KeyValueStore). Build one with
//! [`initialize_app`] and pass it to the component constructors.
//!
//! ```
//! use saved_properties_sync::app::{initialize_app, SyncAppSettings, SyncOptions};
//!
//! let app = initialize_app(
//!     SyncOptions::default(),
//!     Some(SyncAppSettings { name: Some("tab-1".into()) }),
//! )?;
//! assert_eq!(app.name(), "tab-1");
//! assert_eq!(app.options().cache_key(), "saved-properties");
//! # Ok::<(), saved_properties_sync::app::AppError>(())
//! ```
mod api;
mod errors;
mod logger;
mod types;

#[doc(inline)]
pub use api::{initialize_app, SDK_VERSION};

#[doc(inline)]
pub use errors::{AppError, AppResult};

#[doc(inline)]
pub use types::{
    SyncApp, SyncAppSettings, SyncOptions, DEFAULT_APP_NAME, DEFAULT_CACHE_KEY,
    DEFAULT_IDENTITY_KEY, DEFAULT_INACTIVITY_DAYS, ENV_DATABASE_URL, ENV_INACTIVITY_DAYS,
    ENV_STORAGE_DIR,
};
