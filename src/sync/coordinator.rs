use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, Weak};

use async_lock::Mutex as AsyncMutex;

use crate::app::SyncApp;
use crate::cache::LocalCache;
use crate::collection::{IdGenerator, PropertyId, SavedCollection, SavedProperty};
use crate::identity::{Identity, IdentityProvider};
use crate::listener::{ChangeListener, SnapshotResult, Subscription};
use crate::logger::Logger;
use crate::remote::RemoteStore;
use crate::sync::state::{SweepOutcome, SyncEvent, SyncNotice, SyncStatus};
use crate::util::{now_millis, now_rfc3339, Disposer, Unsubscribe, DAY_MILLIS};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@saved-sync/coordinator"));

type Observer = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Keeps the saved collection consistent between memory, the local cache and the
/// remote partition of the current identity.
///
/// Mutations are applied to memory and the local cache immediately and confirmed
/// remotely afterwards; a failed remote step never rolls the local change back.
/// Remote work of one coordinator runs one operation at a time.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    identity_provider: IdentityProvider,
    cache: LocalCache,
    remote: RemoteStore,
    listener: ChangeListener,
    inactivity_millis: i64,
    ids: IdGenerator,
    state: Mutex<CoordinatorState>,
    observers: Arc<Mutex<Vec<(u64, Observer)>>>,
    next_observer_id: AtomicU64,
    // Bumped on every boot or shutdown; pushes and writes started under an older
    // value belong to a previous identity.
    generation: AtomicU64,
    subscription: Mutex<Option<Subscription>>,
    remote_lock: AsyncMutex<()>,
    next_mutation: AtomicU64,
}

#[derive(Default)]
struct CoordinatorState {
    identity: Option<Identity>,
    collection: SavedCollection,
    status: SyncStatus,
    // Local mutations whose remote step has not finished yet. They are replayed on
    // top of every remote replacement so a push cannot drop them.
    pending: Vec<PendingMutation>,
}

struct PendingMutation {
    seq: u64,
    generation: u64,
    change: LocalChange,
}

enum LocalChange {
    Save(SavedProperty),
    Delete(PropertyId),
}

impl LocalChange {
    fn apply(&self, collection: &mut SavedCollection) {
        match self {
            LocalChange::Save(record) => collection.upsert(record.clone()),
            LocalChange::Delete(id) => {
                collection.remove_by_id(id);
            }
        }
    }
}

impl fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("SyncCoordinator")
            .field("identity", &state.identity)
            .field("status", &state.status)
            .field("records", &state.collection.len())
            .finish()
    }
}

impl SyncCoordinator {
    pub fn new(app: &SyncApp) -> Self {
        Self::with_components(
            IdentityProvider::new(app),
            LocalCache::new(app),
            RemoteStore::new(app),
            app.options().inactivity_days(),
        )
    }

    pub fn with_components(
        identity_provider: IdentityProvider,
        cache: LocalCache,
        remote: RemoteStore,
        inactivity_days: u32,
    ) -> Self {
        let listener = ChangeListener::new(remote.clone());
        Self {
            inner: Arc::new(CoordinatorInner {
                identity_provider,
                cache,
                remote,
                listener,
                inactivity_millis: i64::from(inactivity_days) * DAY_MILLIS,
                ids: IdGenerator::new(),
                state: Mutex::new(CoordinatorState::default()),
                observers: Arc::new(Mutex::new(Vec::new())),
                next_observer_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                subscription: Mutex::new(None),
                remote_lock: AsyncMutex::new(()),
                next_mutation: AtomicU64::new(1),
            }),
        }
    }

    /// Loads the collection for the stored identity and starts listening for remote
    /// changes.
    ///
    /// The cached collection is published first. A reachable remote collection then
    /// replaces it. The expiry sweep runs before the remote read so it judges the
    /// partition by the activity recorded before this boot.
    pub async fn boot(&self) -> SavedCollection {
        let identity = self.inner.identity_provider.resolve_identity();
        self.start(identity).await
    }

    async fn start(&self, identity: Identity) -> SavedCollection {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.release_subscription();

        let cached = self.inner.cache.load();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.identity = Some(identity.clone());
            state.collection = cached.clone().unwrap_or_default();
            state.pending.clear();
        }
        self.set_status(SyncStatus::Loading);
        if let Some(cached) = cached.as_ref() {
            self.emit(SyncEvent::CollectionChanged(cached.clone()));
        }

        let _remote = self.inner.remote_lock.lock().await;
        if !self.is_current(generation) {
            return self.collection();
        }

        let now = now_millis();
        if let SweepOutcome::Swept { last_active } = self.sweep(&identity, now).await {
            self.emit(SyncEvent::Notice(SyncNotice::PartitionExpired {
                identity: identity.clone(),
                last_active,
            }));
        }

        let loaded = match self.inner.remote.read_all(&identity).await {
            Ok(Some(remote)) => {
                self.replace_collection(generation, remote);
                true
            }
            Ok(None) => {
                if cached.is_none() {
                    self.inner.cache.store(&SavedCollection::new());
                }
                true
            }
            Err(err) => {
                LOGGER.warn(format!(
                    "Failed to load saved properties for {identity}, using the local copy: {err}"
                ));
                false
            }
        };
        self.set_status(if loaded {
            SyncStatus::Synced
        } else {
            SyncStatus::Offline
        });

        self.attach_listener(&identity, generation).await;

        if loaded {
            self.touch_last_active(&identity).await;
        }
        self.collection()
    }

    async fn attach_listener(&self, identity: &Identity, generation: u64) {
        let weak: Weak<CoordinatorInner> = Arc::downgrade(&self.inner);
        let subscribed = self
            .inner
            .listener
            .subscribe(identity, move |result| {
                if let Some(inner) = weak.upgrade() {
                    SyncCoordinator { inner }.apply_push(generation, result);
                }
            })
            .await;

        match subscribed {
            Ok(subscription) if self.is_current(generation) => {
                *self.inner.subscription.lock().unwrap() = Some(subscription);
            }
            Ok(subscription) => subscription.dispose(),
            Err(err) => {
                LOGGER.warn(format!("Failed to listen for changes of {identity}: {err}"));
                self.set_status(SyncStatus::Offline);
            }
        }
    }

    fn apply_push(&self, generation: u64, result: SnapshotResult) {
        if !self.is_current(generation) {
            LOGGER.debug("Ignoring push for a previous identity");
            return;
        }
        match result {
            Ok(collection) => {
                self.replace_collection(generation, collection);
                self.set_status(SyncStatus::Synced);
            }
            Err(err) => {
                LOGGER.warn(format!("Remote change delivery failed: {err}"));
                self.set_status(SyncStatus::Offline);
            }
        }
    }

    /// Remote wins: `incoming` becomes the collection, keeping local `debug` payloads
    /// and the local mutations still waiting for their remote step.
    fn replace_collection(&self, generation: u64, mut incoming: SavedCollection) {
        let changed = {
            let mut state = self.inner.state.lock().unwrap();
            if !self.is_current(generation) {
                return;
            }
            incoming.carry_debug_from(&state.collection);
            for mutation in state
                .pending
                .iter()
                .filter(|mutation| mutation.generation == generation)
            {
                mutation.change.apply(&mut incoming);
            }
            self.inner.cache.store(&incoming);
            if state.collection == incoming {
                None
            } else {
                state.collection = incoming.clone();
                Some(incoming)
            }
        };
        if let Some(collection) = changed {
            self.emit(SyncEvent::CollectionChanged(collection));
        }
    }

    /// Adds `property` to the collection and returns the updated collection.
    ///
    /// The record gets an `id` when it has none and a fresh `saved_at`. A record whose
    /// id is already saved replaces the saved one in place. The local cache keeps
    /// `debug`; the remote copy never does.
    pub async fn save(&self, property: SavedProperty) -> SavedCollection {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let identity = self.current_identity();

        let mut record = property;
        let seq = self.inner.next_mutation.fetch_add(1, Ordering::SeqCst);
        let (id, updated) = {
            let mut state = self.inner.state.lock().unwrap();
            let id = match record.id() {
                Some(id) => id,
                None => {
                    let id = self.inner.ids.next_id(now_millis(), &state.collection);
                    record.set_id(&id);
                    id
                }
            };
            record.set_saved_at(now_rfc3339());
            record.derive_coordinates();
            state.pending.push(PendingMutation {
                seq,
                generation,
                change: LocalChange::Save(record.clone()),
            });
            state.collection.upsert(record);
            self.inner.cache.store(&state.collection);
            (id, state.collection.clone())
        };
        let _pending = self.settle_on_drop(seq);
        self.emit(SyncEvent::CollectionChanged(updated.clone()));

        let _remote = self.inner.remote_lock.lock().await;
        if !self.is_current(generation) {
            LOGGER.debug(format!("Skipping remote save of {id}: identity changed"));
            return updated;
        }

        let latest = self.collection();
        if self.inner.remote.write_all(&identity, &latest).await {
            self.touch_last_active(&identity).await;
        } else {
            self.set_status(SyncStatus::Offline);
            self.emit(SyncEvent::Notice(SyncNotice::SavedLocallyOnly { id }));
        }
        updated
    }

    /// Removes the record with `id` (nothing happens locally if it is absent) and
    /// returns the updated collection.
    ///
    /// The remote side reads, filters and rewrites the whole collection; a delete made
    /// by another client between those steps can be lost.
    pub async fn delete(&self, id: &PropertyId) -> SavedCollection {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let identity = self.current_identity();

        let seq = self.inner.next_mutation.fetch_add(1, Ordering::SeqCst);
        let (removed, updated) = {
            let mut state = self.inner.state.lock().unwrap();
            state.pending.push(PendingMutation {
                seq,
                generation,
                change: LocalChange::Delete(id.clone()),
            });
            let removed = state.collection.remove_by_id(id);
            self.inner.cache.store(&state.collection);
            (removed, state.collection.clone())
        };
        let _pending = self.settle_on_drop(seq);
        if removed {
            self.emit(SyncEvent::CollectionChanged(updated.clone()));
        }

        let _remote = self.inner.remote_lock.lock().await;
        if !self.is_current(generation) {
            LOGGER.debug(format!("Skipping remote delete of {id}: identity changed"));
            return updated;
        }

        match self.inner.remote.delete_one(&identity, id).await {
            Ok(()) => self.touch_last_active(&identity).await,
            Err(err) => {
                LOGGER.warn(format!("Failed to delete {id} for {identity}: {err}"));
                self.set_status(SyncStatus::Offline);
                self.emit(SyncEvent::Notice(SyncNotice::DeletedLocallyOnly { id: id.clone() }));
            }
        }
        updated
    }

    /// Drops pending mutation `seq` once the returned guard goes out of scope.
    fn settle_on_drop(&self, seq: u64) -> Disposer {
        let inner = Arc::downgrade(&self.inner);
        Disposer::new(move || {
            if let Some(inner) = inner.upgrade() {
                if let Ok(mut state) = inner.state.lock() {
                    state.pending.retain(|mutation| mutation.seq != seq);
                }
            }
        })
    }

    /// Removes the remote partition of the current identity when it has been idle for
    /// longer than the inactivity threshold. The local cache is left alone.
    pub async fn cleanup_inactive(&self) -> SweepOutcome {
        let identity = self.current_identity();
        let _remote = self.inner.remote_lock.lock().await;
        let outcome = self.sweep(&identity, now_millis()).await;
        if let SweepOutcome::Swept { last_active } = outcome {
            self.emit(SyncEvent::Notice(SyncNotice::PartitionExpired {
                identity,
                last_active,
            }));
        }
        outcome
    }

    async fn sweep(&self, identity: &Identity, now: i64) -> SweepOutcome {
        let last_active = match self.inner.remote.read_last_active(identity).await {
            Ok(last_active) => last_active,
            Err(err) => {
                LOGGER.warn(format!("Skipping expiry sweep for {identity}: {err}"));
                return SweepOutcome::Failed(err);
            }
        };
        let Some(last_active) = last_active else {
            return SweepOutcome::Kept { last_active: None };
        };
        if now - last_active <= self.inner.inactivity_millis {
            return SweepOutcome::Kept {
                last_active: Some(last_active),
            };
        }

        match self.inner.remote.delete_partition(identity).await {
            Ok(()) => {
                LOGGER.info(format!(
                    "Removed saved properties of {identity}, idle for {} days",
                    (now - last_active) / DAY_MILLIS
                ));
                SweepOutcome::Swept { last_active }
            }
            Err(err) => {
                LOGGER.warn(format!("Failed to remove expired partition {identity}: {err}"));
                SweepOutcome::Failed(err)
            }
        }
    }

    async fn touch_last_active(&self, identity: &Identity) {
        match self
            .inner
            .remote
            .write_last_active(identity, now_millis())
            .await
        {
            Ok(()) => self.set_status(SyncStatus::Synced),
            Err(err) => {
                LOGGER.warn(format!("Failed to record activity for {identity}: {err}"));
                self.set_status(SyncStatus::Offline);
            }
        }
    }

    /// Returns the stored identity, creating one on first use.
    pub fn resolve_identity(&self) -> Identity {
        self.inner.identity_provider.resolve_identity()
    }

    /// Stores a user-chosen identity and returns it after sanitizing.
    ///
    /// When the coordinator is running and the identity changed, the current
    /// subscription is dropped and the new partition is booted.
    pub async fn set_identity(&self, candidate: &str) -> Identity {
        let stored = self.inner.identity_provider.set_identity(candidate);
        let previous = self.identity();
        match previous {
            Some(previous) if previous != stored => {
                LOGGER.info(format!("Switching identity from {previous} to {stored}"));
                self.emit(SyncEvent::Notice(SyncNotice::IdentitySwitched {
                    from: previous,
                    to: stored.clone(),
                }));
                self.start(stored.clone()).await;
            }
            _ => {}
        }
        stored
    }

    pub fn collection(&self) -> SavedCollection {
        self.inner.state.lock().unwrap().collection.clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.state.lock().unwrap().status
    }

    /// Identity of the partition in use, `None` before [`SyncCoordinator::boot`].
    pub fn identity(&self) -> Option<Identity> {
        self.inner.state.lock().unwrap().identity.clone()
    }

    pub fn cache(&self) -> &LocalCache {
        &self.inner.cache
    }

    /// Registers an observer for collection, status and notice events.
    pub fn subscribe<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .observers
            .lock()
            .unwrap()
            .push((id, Arc::new(callback)));

        let observers = Arc::downgrade(&self.inner.observers);
        Disposer::new(move || {
            if let Some(observers) = observers.upgrade() {
                if let Ok(mut guard) = observers.lock() {
                    guard.retain(|(observer_id, _)| *observer_id != id);
                }
            }
        })
        .into_unsubscribe()
    }

    /// Detaches the remote change listener. Later pushes are ignored.
    pub fn shutdown(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.release_subscription();
    }

    fn release_subscription(&self) {
        let previous = self.inner.subscription.lock().unwrap().take();
        if let Some(subscription) = previous {
            subscription.dispose();
        }
    }

    fn current_identity(&self) -> Identity {
        let mut state = self.inner.state.lock().unwrap();
        match &state.identity {
            Some(identity) => identity.clone(),
            None => {
                let identity = self.inner.identity_provider.resolve_identity();
                state.identity = Some(identity.clone());
                identity
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    fn set_status(&self, status: SyncStatus) {
        let previous = {
            let mut state = self.inner.state.lock().unwrap();
            std::mem::replace(&mut state.status, status)
        };
        if previous != status {
            LOGGER.debug(format!("Sync status {previous} -> {status}"));
            self.emit(SyncEvent::StatusChanged(status));
        }
    }

    fn emit(&self, event: SyncEvent) {
        let observers: Vec<Observer> = self
            .inner
            .observers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer(&event);
        }
    }
}
