//! Client for the per-identity partition in the remote store.
//!
//! Layout: `users/{identity}/properties` holds the whole collection and
//! `users/{identity}/lastActive` the epoch milliseconds of the last activity.

use std::sync::LazyLock;

use serde_json::Value;

use crate::app::SyncApp;
use crate::collection::{PropertyId, SavedCollection};
use crate::database::{Database, DatabaseReference, DatabaseResult};
use crate::identity::Identity;
use crate::logger::Logger;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@saved-sync/remote"));

pub const USERS_ROOT: &str = "users";
pub const PROPERTIES_CHILD: &str = "properties";
pub const LAST_ACTIVE_CHILD: &str = "lastActive";

#[derive(Clone, Debug)]
pub struct RemoteStore {
    database: Database,
}

impl RemoteStore {
    pub fn new(app: &SyncApp) -> Self {
        Self::with_database(app.database().clone())
    }

    pub fn with_database(database: Database) -> Self {
        Self { database }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub(crate) fn partition_ref(&self, identity: &Identity) -> DatabaseResult<DatabaseReference> {
        self.database
            .reference(USERS_ROOT)?
            .child(identity.as_str())
    }

    pub(crate) fn properties_ref(&self, identity: &Identity) -> DatabaseResult<DatabaseReference> {
        self.partition_ref(identity)?.child(PROPERTIES_CHILD)
    }

    fn last_active_ref(&self, identity: &Identity) -> DatabaseResult<DatabaseReference> {
        self.partition_ref(identity)?.child(LAST_ACTIVE_CHILD)
    }

    /// Replaces the remote collection. Failures are logged and reported as `false`.
    pub async fn write_all(&self, identity: &Identity, collection: &SavedCollection) -> bool {
        match self.try_write_all(identity, collection).await {
            Ok(()) => true,
            Err(err) => {
                LOGGER.warn(format!(
                    "Failed to write saved properties for {identity}: {err}"
                ));
                false
            }
        }
    }

    async fn try_write_all(
        &self,
        identity: &Identity,
        collection: &SavedCollection,
    ) -> DatabaseResult<()> {
        let payload = collection.without_debug();
        self.properties_ref(identity)?.set(payload.to_value()).await
    }

    /// Reads the remote collection, `None` if it was never written.
    pub async fn read_all(&self, identity: &Identity) -> DatabaseResult<Option<SavedCollection>> {
        let value = self.properties_ref(identity)?.get().await?;
        Ok(SavedCollection::from_remote_value(value))
    }

    /// Removes one record by rewriting the collection without it.
    ///
    /// This is a read followed by a whole-collection write; a concurrent writer in
    /// another process between the two steps is overwritten.
    pub async fn delete_one(&self, identity: &Identity, id: &PropertyId) -> DatabaseResult<()> {
        let Some(mut collection) = self.read_all(identity).await? else {
            return Ok(());
        };
        collection.remove_by_id(id);
        self.properties_ref(identity)?
            .set(collection.without_debug().to_value())
            .await
    }

    pub async fn write_last_active(&self, identity: &Identity, millis: i64) -> DatabaseResult<()> {
        self.last_active_ref(identity)?.set(Value::from(millis)).await
    }

    pub async fn read_last_active(&self, identity: &Identity) -> DatabaseResult<Option<i64>> {
        let value = self.last_active_ref(identity)?.get().await?;
        Ok(match value {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().map(|float| float as i64)),
            _ => None,
        })
    }

    /// Removes the whole partition: collection and metadata.
    pub async fn delete_partition(&self, identity: &Identity) -> DatabaseResult<()> {
        self.partition_ref(identity)?.remove().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::SavedProperty;
    use crate::database::InMemoryBackend;
    use serde_json::json;
    use std::sync::Arc;

    fn identity(raw: &str) -> Identity {
        Identity::parse(raw).unwrap()
    }

    fn remote() -> (RemoteStore, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        (
            RemoteStore::with_database(Database::with_backend(backend.clone())),
            backend,
        )
    }

    fn collection(value: Value) -> SavedCollection {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn write_all_strips_debug() {
        let (remote, backend) = remote();
        let user = identity("user_1");
        let saved = collection(json!([
            {"id": 1, "debug": {"parcel_raw": [{"centroid.latitude": "1"}]}},
            {"id": 2}
        ]));

        assert!(remote.write_all(&user, &saved).await);
        assert_eq!(
            backend.dump(),
            json!({"users": {"user_1": {"properties": [{"id": 1}, {"id": 2}]}}})
        );
        assert_eq!(remote.read_all(&user).await.unwrap(), Some(saved.without_debug()));
    }

    #[tokio::test]
    async fn write_all_reports_failure_as_false() {
        let (remote, backend) = remote();
        backend.set_reachable(false);
        assert!(!remote.write_all(&identity("u"), &SavedCollection::new()).await);
    }

    #[tokio::test]
    async fn read_all_is_none_for_new_partition() {
        let (remote, _) = remote();
        assert_eq!(remote.read_all(&identity("fresh")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_one_filters_and_tolerates_absence() {
        let (remote, _) = remote();
        let user = identity("u");
        remote.delete_one(&user, &PropertyId::Number(1)).await.unwrap();
        assert_eq!(remote.read_all(&user).await.unwrap(), None);

        remote
            .write_all(&user, &collection(json!([{"id": 1}, {"id": "x"}])))
            .await;
        remote.delete_one(&user, &PropertyId::Number(1)).await.unwrap();
        let remaining = remote.read_all(&user).await.unwrap().unwrap();
        assert_eq!(remaining.ids(), vec![PropertyId::from("x")]);

        remote.delete_one(&user, &PropertyId::from("x")).await.unwrap();
        assert_eq!(remote.read_all(&user).await.unwrap(), None);
    }

    #[tokio::test]
    async fn last_active_and_partition_removal() {
        let (remote, backend) = remote();
        let user = identity("u");
        assert_eq!(remote.read_last_active(&user).await.unwrap(), None);

        remote.write_last_active(&user, 1_700_000_000_000).await.unwrap();
        assert_eq!(
            remote.read_last_active(&user).await.unwrap(),
            Some(1_700_000_000_000)
        );

        let mut saved = SavedCollection::new();
        saved.push(SavedProperty::from_value(json!({"id": 1})).unwrap());
        remote.write_all(&user, &saved).await;
        remote.delete_partition(&user).await.unwrap();
        assert_eq!(backend.dump(), Value::Null);
    }
}
