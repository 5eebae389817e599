//! Two clients of the same identity saving and deleting properties.
//!
//! Without configuration both "tabs" share one in-memory backend. Set
//! `SAVED_SYNC_DATABASE_URL` (for example `http://127.0.0.1:9000/?ns=saved-demo` for the
//! emulator) to run against a real Realtime Database instead.

use std::sync::Arc;
use std::time::Duration;

use saved_properties_sync::app::{initialize_app, SyncApp, SyncAppSettings, SyncOptions};
use saved_properties_sync::database::{Database, InMemoryBackend};
use saved_properties_sync::lookup::LookupResponse;
use saved_properties_sync::storage::{InMemoryStore, KeyValueStore};
use saved_properties_sync::sync::{SyncCoordinator, SyncEvent};
use serde_json::json;

fn settings(name: &str) -> Option<SyncAppSettings> {
    Some(SyncAppSettings {
        name: Some(name.to_string()),
    })
}

fn build_apps(options: SyncOptions) -> Result<(SyncApp, SyncApp), Box<dyn std::error::Error>> {
    if options.database_url.is_some() {
        let first = initialize_app(options.clone(), settings("tab-1"))?;
        let second = initialize_app(options, settings("tab-2"))?;
        // Same device identity in both tabs.
        let identity = "user_demo";
        first.store().set(first.options().identity_key(), identity)?;
        second.store().set(second.options().identity_key(), identity)?;
        return Ok((first, second));
    }

    let backend = Arc::new(InMemoryBackend::new());
    let store = Arc::new(InMemoryStore::new());
    let first = SyncApp::with_parts(
        options.clone(),
        settings("tab-1").unwrap_or_default(),
        store.clone(),
        Database::with_backend(backend.clone()),
    )?;
    let second = SyncApp::with_parts(
        options,
        settings("tab-2").unwrap_or_default(),
        store,
        Database::with_backend(backend),
    )?;
    Ok((first, second))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (first_app, second_app) = build_apps(SyncOptions::from_env()?)?;

    let first = SyncCoordinator::new(&first_app);
    let second = SyncCoordinator::new(&second_app);

    let _observer = second.subscribe(|event| match event {
        SyncEvent::CollectionChanged(collection) => {
            println!("[tab-2] collection now has {} properties", collection.len())
        }
        SyncEvent::StatusChanged(status) => println!("[tab-2] status: {status}"),
        SyncEvent::Notice(notice) => println!("[tab-2] {notice}"),
    });

    first.boot().await;
    second.boot().await;
    println!("identity: {}", first.identity().map(|id| id.to_string()).unwrap_or_default());

    let response = LookupResponse::from_body(json!({
        "address": "1 Market St, San Francisco",
        "zoning": "C-3-O",
        "debug": {
            "parcel_raw": [{"centroid_latitude": "37.7937", "centroid_longitude": "-122.3952"}]
        }
    }))?;
    if let Some(warning) = &response.warning {
        println!("lookup warning: {warning}");
    }

    let Some(property) = response.property else {
        println!("lookup returned no property");
        return Ok(());
    };
    let saved = first.save(property).await;
    println!("[tab-1] saved; status {}", first.status());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let (lat, lon) = second.collection().map_center();
    println!("[tab-2] sees {} properties centred at ({lat:.4}, {lon:.4})", second.collection().len());

    if let Some(id) = saved.records().last().and_then(|record| record.id()) {
        second.delete(&id).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        println!("[tab-1] after delete in tab-2: {} properties", first.collection().len());
    }

    first.shutdown();
    second.shutdown();
    Ok(())
}
