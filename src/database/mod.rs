//! # Realtime Database client
//!
//! A small Realtime Database client used as the remote side of the sync engine.
//!
//! - [`Database`] handles with path references, whole-value `set`/`get`/`remove`
//! - value listeners that push full snapshots and detach on drop
//! - an [`InMemoryBackend`] that several handles can share (tabs, devices, tests)
//! - a [`RestBackend`] for the REST API, with push over `text/event-stream`
//!
//! Keys and path segments are validated on write: `. # $ / [ ]` and control
//! characters are rejected with `database/invalid-argument`.
//!
//! ## Example
//!
//! ```
//! use saved_properties_sync::database::Database;
//! use serde_json::json;
//!
//! # futures::executor::block_on(async {
//! let database = Database::in_memory();
//! let reference = database.reference("users/user_1/lastActive")?;
//! reference.set(json!(1_700_000_000_000_i64)).await?;
//! assert_eq!(reference.get().await?, json!(1_700_000_000_000_i64));
//! # Ok::<(), saved_properties_sync::database::error::DatabaseError>(())
//! # }).unwrap();
//! ```

mod api;
mod backend;
pub mod error;
mod event_stream;

#[doc(inline)]
pub use api::{DataSnapshot, Database, DatabaseReference, ListenerRegistration, FORBIDDEN_KEY_CHARS};

#[doc(inline)]
pub use backend::{DatabaseBackend, InMemoryBackend, RestBackend, WatchEvent, WatchSink};

#[doc(inline)]
pub use error::{DatabaseError, DatabaseErrorCode, DatabaseResult};
