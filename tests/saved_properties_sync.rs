use saved_properties_sync::app::{initialize_app, SyncApp, SyncAppSettings, SyncOptions};
use saved_properties_sync::collection::{PropertyId, SavedCollection, SavedProperty};
use saved_properties_sync::database::{Database, InMemoryBackend};
use saved_properties_sync::storage::{InMemoryStore, KeyValueStore};
use saved_properties_sync::sync::{SweepOutcome, SyncCoordinator, SyncEvent, SyncNotice, SyncStatus};
use saved_properties_sync::util::{now_millis, DAY_MILLIS};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

const IDENTITY_KEY: &str = "sf-rental-user-id";
const CACHE_KEY: &str = "saved-properties";

fn unique_settings(name: &str) -> SyncAppSettings {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    SyncAppSettings {
        name: Some(format!("{name}-{}", COUNTER.fetch_add(1, Ordering::SeqCst))),
    }
}

/// One client: its own local store, talking to `backend`.
fn tab(backend: &Arc<InMemoryBackend>, store: &Arc<InMemoryStore>) -> SyncCoordinator {
    let app = SyncApp::with_parts(
        SyncOptions::default(),
        unique_settings("tab"),
        store.clone(),
        Database::with_backend(backend.clone()),
    )
    .expect("build app");
    SyncCoordinator::new(&app)
}

fn device(identity: &str) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.set(IDENTITY_KEY, identity).unwrap();
    store
}

fn property(value: Value) -> SavedProperty {
    SavedProperty::from_value(value).expect("object")
}

fn cached(store: &InMemoryStore) -> Option<SavedCollection> {
    store
        .get(CACHE_KEY)
        .unwrap()
        .map(|raw| serde_json::from_str(&raw).expect("cached json"))
}

fn remote_at(backend: &InMemoryBackend, pointer: &str) -> Value {
    backend.dump().pointer(pointer).cloned().unwrap_or(Value::Null)
}

async fn set_remote(backend: &Arc<InMemoryBackend>, path: &str, value: Value) {
    Database::with_backend(backend.clone())
        .reference(path)
        .unwrap()
        .set(value)
        .await
        .unwrap();
}

fn record_events(coordinator: &SyncCoordinator) -> Arc<Mutex<Vec<SyncEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let captured = events.clone();
    // Dropping the returned closure without calling it keeps the observer registered.
    let _unsubscribe = coordinator.subscribe(move |event| captured.lock().unwrap().push(event.clone()));
    events
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_matches_memory_after_every_mutation() {
    let backend = Arc::new(InMemoryBackend::new());
    let store = device("user_cache");
    let coordinator = tab(&backend, &store);
    coordinator.boot().await;

    let mut ids = Vec::new();
    for address in ["1 Market St", "2 Mission St", "3 Howard St"] {
        let saved = coordinator.save(property(json!({ "address": address }))).await;
        assert_eq!(cached(&store), Some(saved.clone()));
        assert_eq!(coordinator.collection(), saved);
        ids.push(saved.records().last().unwrap().id().unwrap());
    }

    let after = coordinator.delete(&ids[1]).await;
    assert_eq!(cached(&store), Some(after.clone()));
    assert_eq!(coordinator.collection(), after);
    assert_eq!(after.ids(), vec![ids[0].clone(), ids[2].clone()]);

    let unchanged = coordinator.delete(&PropertyId::from("missing")).await;
    assert_eq!(unchanged, after);
    assert_eq!(cached(&store), Some(after));
}

#[tokio::test(flavor = "multi_thread")]
async fn save_then_delete_restores_previous_collection() {
    let backend = Arc::new(InMemoryBackend::new());
    let store = device("user_roundtrip");
    let coordinator = tab(&backend, &store);
    coordinator.boot().await;
    coordinator.save(property(json!({"id": "keep"}))).await;
    let before = coordinator.collection();
    let remote_before = remote_at(&backend, "/users/user_roundtrip/properties");

    let saved = coordinator.save(property(json!({"address": "temp"}))).await;
    let id = saved.records()[1].id().unwrap();
    let restored = coordinator.delete(&id).await;

    assert_eq!(restored, before);
    assert_eq!(remote_at(&backend, "/users/user_roundtrip/properties"), remote_before);
}

#[tokio::test(flavor = "multi_thread")]
async fn generated_ids_never_repeat() {
    let backend = Arc::new(InMemoryBackend::new());
    let store = device("user_ids");
    let coordinator = tab(&backend, &store);
    coordinator.boot().await;

    for index in 0..50 {
        coordinator.save(property(json!({ "n": index }))).await;
    }
    let ids = coordinator.collection().ids();
    let distinct: HashSet<PropertyId> = ids.iter().cloned().collect();
    assert_eq!(ids.len(), 50);
    assert_eq!(distinct.len(), 50);
}

#[tokio::test(flavor = "multi_thread")]
async fn debug_is_cached_locally_but_never_sent() {
    let backend = Arc::new(InMemoryBackend::new());
    let store = device("user_debug");
    let coordinator = tab(&backend, &store);
    coordinator.boot().await;

    let debug = json!({
        "parcel_raw": [{"centroid_latitude": "37.78", "centroid_longitude": "-122.41", "blklot.id": "x"}]
    });
    coordinator
        .save(property(json!({"address": "1 Market St", "debug": debug})))
        .await;

    let remote = remote_at(&backend, "/users/user_debug/properties/0");
    assert!(remote.get("debug").is_none());
    assert_eq!(remote["lat"], json!(37.78));
    assert_eq!(remote["lon"], json!(-122.41));

    let local = cached(&store).unwrap();
    assert_eq!(local.records()[0].debug(), Some(&debug));
}

#[tokio::test(flavor = "multi_thread")]
async fn set_identity_sanitizes_and_switches_partition() {
    let backend = Arc::new(InMemoryBackend::new());
    let store = device("user_first");
    set_remote(&backend, "users/a_b_c/properties", json!([{"id": 42}])).await;

    let coordinator = tab(&backend, &store);
    let events = record_events(&coordinator);
    coordinator.boot().await;
    coordinator.save(property(json!({"id": 1}))).await;

    let stored = coordinator.set_identity("a.b#c").await;
    assert_eq!(stored.as_str(), "a_b_c");
    assert_eq!(store.get(IDENTITY_KEY).unwrap().as_deref(), Some("a_b_c"));
    assert_eq!(coordinator.identity(), Some(stored.clone()));
    assert_eq!(coordinator.collection().ids(), vec![PropertyId::Number(42)]);

    // Pushes for the previous partition no longer reach this coordinator.
    set_remote(&backend, "users/user_first/properties", json!([{"id": 7}])).await;
    assert_eq!(coordinator.collection().ids(), vec![PropertyId::Number(42)]);

    let switched = events.lock().unwrap().iter().any(|event| {
        matches!(
            event,
            SyncEvent::Notice(SyncNotice::IdentitySwitched { from, to })
                if from.as_str() == "user_first" && to.as_str() == "a_b_c"
        )
    });
    assert!(switched);

    let same = coordinator.set_identity("a_b_c").await;
    assert_eq!(same, stored);
}

#[tokio::test(flavor = "multi_thread")]
async fn boot_lets_remote_win_over_cache() {
    let backend = Arc::new(InMemoryBackend::new());
    let store = device("user_boot");
    store.set(CACHE_KEY, r#"[{"id":1}]"#).unwrap();
    set_remote(&backend, "users/user_boot/properties", json!([{"id": 2}])).await;

    let coordinator = tab(&backend, &store);
    let events = record_events(&coordinator);
    let booted = coordinator.boot().await;

    assert_eq!(booted.ids(), vec![PropertyId::Number(2)]);
    assert_eq!(coordinator.collection().ids(), vec![PropertyId::Number(2)]);
    assert_eq!(cached(&store).unwrap().ids(), vec![PropertyId::Number(2)]);

    let events = events.lock().unwrap();
    let collections: Vec<Vec<PropertyId>> = events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::CollectionChanged(collection) => Some(collection.ids()),
            _ => None,
        })
        .collect();
    assert_eq!(
        collections,
        vec![vec![PropertyId::Number(1)], vec![PropertyId::Number(2)]]
    );
    assert!(events.contains(&SyncEvent::StatusChanged(SyncStatus::Synced)));
}

#[tokio::test(flavor = "multi_thread")]
async fn boot_without_any_copy_starts_empty() {
    let backend = Arc::new(InMemoryBackend::new());
    let store = device("user_new");
    let coordinator = tab(&backend, &store);

    assert!(coordinator.boot().await.is_empty());
    assert_eq!(cached(&store), Some(SavedCollection::new()));
    assert_eq!(coordinator.status(), SyncStatus::Synced);
    assert!(remote_at(&backend, "/users/user_new/lastActive").is_i64());
}

#[tokio::test(flavor = "multi_thread")]
async fn cleanup_sweeps_only_idle_partitions() {
    let backend = Arc::new(InMemoryBackend::new());
    let store = device("user_idle");
    let coordinator = tab(&backend, &store);
    coordinator.boot().await;
    coordinator.save(property(json!({"id": 1}))).await;

    set_remote(
        &backend,
        "users/user_idle/lastActive",
        json!(now_millis() - 2 * DAY_MILLIS),
    )
    .await;
    let before = backend.dump();
    let outcome = coordinator.cleanup_inactive().await;
    assert!(matches!(outcome, SweepOutcome::Kept { last_active: Some(_) }));
    assert_eq!(backend.dump(), before);

    set_remote(
        &backend,
        "users/user_idle/lastActive",
        json!(now_millis() - 31 * DAY_MILLIS),
    )
    .await;
    let outcome = coordinator.cleanup_inactive().await;
    assert!(outcome.is_swept());
    assert_eq!(remote_at(&backend, "/users/user_idle"), Value::Null);

    let again = coordinator.cleanup_inactive().await;
    assert!(matches!(again, SweepOutcome::Kept { last_active: None }));
}

#[tokio::test(flavor = "multi_thread")]
async fn boot_sweeps_partition_idle_since_last_session() {
    let backend = Arc::new(InMemoryBackend::new());
    let store = device("user_away");
    set_remote(
        &backend,
        "users/user_away",
        json!({"properties": [{"id": 5}], "lastActive": now_millis() - 45 * DAY_MILLIS}),
    )
    .await;

    let coordinator = tab(&backend, &store);
    let events = record_events(&coordinator);
    coordinator.boot().await;

    assert!(remote_at(&backend, "/users/user_away/properties").is_null());
    assert!(events.lock().unwrap().iter().any(|event| matches!(
        event,
        SyncEvent::Notice(SyncNotice::PartitionExpired { .. })
    )));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_remote_write_keeps_the_local_save() {
    let backend = Arc::new(InMemoryBackend::new());
    let store = device("user_offline");
    let coordinator = tab(&backend, &store);
    let events = record_events(&coordinator);
    coordinator.boot().await;

    backend.set_reachable(false);
    let saved = coordinator.save(property(json!({"id": "p"}))).await;

    assert_eq!(saved.ids(), vec![PropertyId::from("p")]);
    assert_eq!(cached(&store), Some(saved));
    assert_eq!(coordinator.status(), SyncStatus::Offline);
    assert!(events.lock().unwrap().contains(&SyncEvent::Notice(
        SyncNotice::SavedLocallyOnly {
            id: PropertyId::from("p")
        }
    )));

    let removed = coordinator.delete(&PropertyId::from("p")).await;
    assert!(removed.is_empty());
    assert_eq!(cached(&store), Some(SavedCollection::new()));
    assert!(events.lock().unwrap().contains(&SyncEvent::Notice(
        SyncNotice::DeletedLocallyOnly {
            id: PropertyId::from("p")
        }
    )));
}

#[tokio::test(flavor = "multi_thread")]
async fn two_tabs_converge_through_pushes() {
    let backend = Arc::new(InMemoryBackend::new());
    let first_store = device("user_shared");
    let second_store = device("user_shared");
    let first = tab(&backend, &first_store);
    let second = tab(&backend, &second_store);
    first.boot().await;
    second.boot().await;

    let saved = first.save(property(json!({"address": "1 Market St"}))).await;
    assert_eq!(second.collection(), saved);
    assert_eq!(cached(&second_store), Some(saved.clone()));

    let id = saved.records()[0].id().unwrap();
    second.delete(&id).await;
    assert!(first.collection().is_empty());
    assert_eq!(cached(&first_store), Some(SavedCollection::new()));

    // Whole-collection writes: the last writer's view wins.
    first.save(property(json!({"id": "a"}))).await;
    second.save(property(json!({"id": "b"}))).await;
    assert_eq!(
        first.collection().ids(),
        vec![PropertyId::from("a"), PropertyId::from("b")]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn file_backed_app_keeps_identity_and_cache_across_restarts() {
    let mut dir = std::env::temp_dir();
    dir.push(format!("saved-sync-restart-{}", std::process::id()));
    let options = SyncOptions {
        storage_dir: Some(dir.clone()),
        ..Default::default()
    };

    let first_app = initialize_app(options.clone(), Some(unique_settings("restart"))).unwrap();
    let first = SyncCoordinator::new(&first_app);
    first.boot().await;
    first.save(property(json!({"id": 1}))).await;
    let identity = first.identity().unwrap();
    first.shutdown();

    // A new process gets a fresh in-memory remote; the cache is all that is left.
    let second_app = initialize_app(options, Some(unique_settings("restart"))).unwrap();
    let second = SyncCoordinator::new(&second_app);
    assert_eq!(second.resolve_identity(), identity);
    second_app.database().go_offline();
    let booted = second.boot().await;
    assert_eq!(booted.ids(), vec![PropertyId::Number(1)]);

    let _ = std::fs::remove_dir_all(dir);
}
