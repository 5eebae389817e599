//! # saved-properties-sync
//!
//! Offline-first synchronization of a user's saved property collection between a
//! local cache, a Realtime Database partition and other open clients.
//!
//! Components, leaves first:
//!
//! - [`identity`]: self-assigned identity naming the remote partition
//! - [`cache`]: last-known collection on the device
//! - [`remote`]: whole-collection reads and writes against `users/{identity}`
//! - [`listener`]: push subscription delivering full snapshots
//! - [`sync`]: the coordinator tying them together
//!
//! Supporting modules: [`app`] (context and configuration), [`storage`] (local
//! key-value stores), [`database`] (Realtime Database client), [`collection`]
//! (record types), [`lookup`] (property-lookup envelope), [`logger`] and [`util`].

pub mod app;
pub mod cache;
pub mod collection;
pub mod database;
pub mod identity;
pub mod listener;
pub mod logger;
pub mod lookup;
pub mod platform;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod util;
