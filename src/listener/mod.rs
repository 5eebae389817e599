//! Push subscription to one partition's collection.

use std::fmt;
use std::sync::LazyLock;

use crate::collection::SavedCollection;
use crate::database::{DatabaseError, DatabaseResult, ListenerRegistration};
use crate::identity::Identity;
use crate::logger::Logger;
use crate::remote::RemoteStore;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@saved-sync/listener"));

/// Result delivered to a subscriber: the full collection, or a delivery failure.
pub type SnapshotResult = Result<SavedCollection, DatabaseError>;

#[derive(Clone, Debug)]
pub struct ChangeListener {
    remote: RemoteStore,
}

impl ChangeListener {
    pub fn new(remote: RemoteStore) -> Self {
        Self { remote }
    }

    /// Subscribes to `users/{identity}/properties`.
    ///
    /// `on_snapshot` runs once with the current collection (empty when none exists)
    /// and again after every change, including this client's own writes. A delivery
    /// failure arrives as `Err` and leaves the subscription attached.
    pub async fn subscribe<F>(&self, identity: &Identity, on_snapshot: F) -> DatabaseResult<Subscription>
    where
        F: Fn(SnapshotResult) + Send + Sync + 'static,
    {
        let reference = self.remote.properties_ref(identity)?;
        let label = identity.clone();
        let registration = reference
            .on_value(move |result| match result {
                Ok(snapshot) => {
                    let collection =
                        SavedCollection::from_remote_value(snapshot.into_value()).unwrap_or_default();
                    on_snapshot(Ok(collection));
                }
                Err(err) => {
                    LOGGER.warn(format!("Push delivery failed for {label}: {err}"));
                    on_snapshot(Err(err));
                }
            })
            .await?;
        LOGGER.debug(format!("Subscribed to saved properties of {identity}"));

        Ok(Subscription {
            identity: identity.clone(),
            registration: Some(registration),
        })
    }
}

/// Active push subscription. Disposing or dropping it detaches the listener; no
/// callback runs afterwards.
pub struct Subscription {
    identity: Identity,
    registration: Option<ListenerRegistration>,
}

impl Subscription {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.detach();
            LOGGER.debug(format!("Unsubscribed from saved properties of {}", self.identity));
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("identity", &self.identity)
            .field("attached", &self.registration.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
