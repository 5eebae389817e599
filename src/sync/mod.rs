//! # Sync coordinator
//!
//! [`SyncCoordinator`] owns the in-memory saved collection of the current identity
//! and reconciles it with the local cache and the remote partition.
//!
//! - boot publishes the cached copy, then lets the remote copy win
//! - `save`/`delete` commit locally first and confirm remotely once
//! - pushes from other tabs or devices replace the collection wholesale
//! - partitions idle for longer than the configured number of days are swept
//!
//! ```
//! use saved_properties_sync::app::{initialize_app, SyncOptions};
//! use saved_properties_sync::collection::SavedProperty;
//! use saved_properties_sync::sync::{SyncCoordinator, SyncStatus};
//! use serde_json::json;
//!
//! # futures::executor::block_on(async {
//! let app = initialize_app(SyncOptions::default(), None)?;
//! let coordinator = SyncCoordinator::new(&app);
//! coordinator.boot().await;
//!
//! let property = SavedProperty::from_value(json!({"address": "1 Market St"})).unwrap();
//! let saved = coordinator.save(property).await;
//! assert_eq!(saved.len(), 1);
//! assert_eq!(coordinator.status(), SyncStatus::Synced);
//! # Ok::<(), saved_properties_sync::app::AppError>(())
//! # }).unwrap();
//! ```

mod coordinator;
mod state;

#[doc(inline)]
pub use coordinator::SyncCoordinator;

#[doc(inline)]
pub use state::{SweepOutcome, SyncEvent, SyncNotice, SyncStatus};
