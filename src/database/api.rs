use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::database::backend::{
    get_at_path, select_backend, DatabaseBackend, InMemoryBackend, WatchEvent, WatchSink,
};
use crate::database::error::{invalid_argument, unavailable, DatabaseResult};
use crate::util::Disposer;

/// Characters the remote store rejects inside keys and path segments.
pub const FORBIDDEN_KEY_CHARS: [char; 6] = ['.', '#', '$', '/', '[', ']'];

type ValueListenerCallback = Arc<dyn Fn(DatabaseResult<DataSnapshot>) + Send + Sync>;

/// Handle to a Realtime Database. Cloning is cheap; clones share the backend.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    backend: Arc<dyn DatabaseBackend>,
    online: AtomicBool,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("backend", &"dynamic")
            .field("online", &self.is_online())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct DatabaseReference {
    database: Database,
    path: Vec<String>,
}

/// Point-in-time value of a location, delivered by reads and listeners.
#[derive(Clone, Debug)]
pub struct DataSnapshot {
    reference: DatabaseReference,
    value: Value,
}

impl DataSnapshot {
    pub fn reference(&self) -> &DatabaseReference {
        &self.reference
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn exists(&self) -> bool {
        !self.value.is_null()
    }

    pub fn key(&self) -> Option<&str> {
        self.reference.key()
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Returns a snapshot for the provided relative path.
    pub fn child(&self, relative_path: &str) -> DatabaseResult<DataSnapshot> {
        let segments = normalize_path(relative_path)?;
        let reference = self.reference.child(relative_path)?;
        let value = get_at_path(&self.value, &segments)
            .cloned()
            .unwrap_or(Value::Null);
        Ok(DataSnapshot { reference, value })
    }

    /// Returns the number of direct children.
    pub fn size(&self) -> usize {
        match &self.value {
            Value::Object(map) => map.len(),
            Value::Array(array) => array.iter().filter(|item| !item.is_null()).count(),
            _ => 0,
        }
    }
}

struct ListenerState {
    active: AtomicBool,
    // Set once the backend pushed anything; the initial read is then stale.
    pushed: AtomicBool,
    last_delivered: Mutex<Option<Value>>,
}

/// RAII-style listener registration; dropping the handle detaches the
/// underlying listener.
pub struct ListenerRegistration {
    state: Arc<ListenerState>,
    watch: Option<Disposer>,
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("active", &self.state.active.load(Ordering::SeqCst))
            .finish()
    }
}

impl ListenerRegistration {
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.state.active.store(false, Ordering::SeqCst);
        if let Some(watch) = self.watch.take() {
            watch.dispose();
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.release();
    }
}

impl Database {
    /// Creates a handle over an explicit backend.
    pub fn with_backend(backend: Arc<dyn DatabaseBackend>) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                backend,
                online: AtomicBool::new(true),
            }),
        }
    }

    /// Creates a handle over a fresh, unshared in-memory backend.
    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(InMemoryBackend::default()))
    }

    /// Uses the REST backend for `database_url`, or an in-memory backend when the URL is
    /// absent or invalid.
    pub fn from_url(database_url: Option<&str>) -> Self {
        Self::with_backend(select_backend(database_url))
    }

    /// Stops network traffic for this handle: reads and writes fail with
    /// `database/unavailable` and pushes are dropped until [`Database::go_online`].
    pub fn go_offline(&self) {
        self.inner.online.store(false, Ordering::SeqCst);
    }

    pub fn go_online(&self) {
        self.inner.online.store(true, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn reference(&self, path: &str) -> DatabaseResult<DatabaseReference> {
        let segments = normalize_path(path)?;
        Ok(DatabaseReference {
            database: self.clone(),
            path: segments,
        })
    }

    fn backend(&self) -> DatabaseResult<&Arc<dyn DatabaseBackend>> {
        if self.is_online() {
            Ok(&self.inner.backend)
        } else {
            Err(unavailable("Database client is offline"))
        }
    }
}

impl DatabaseReference {
    pub fn child(&self, relative: &str) -> DatabaseResult<DatabaseReference> {
        let mut segments = self.path.clone();
        segments.extend(normalize_path(relative)?);
        Ok(DatabaseReference {
            database: self.database.clone(),
            path: segments,
        })
    }

    pub fn key(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }

    /// Slash-separated absolute path, `/` for the root.
    pub fn path(&self) -> String {
        format!("/{}", self.path.join("/"))
    }

    /// Replaces the value at this location. `null` removes it.
    pub async fn set(&self, value: Value) -> DatabaseResult<()> {
        validate_value(&value)?;
        self.database.backend()?.set(&self.path, value).await
    }

    pub async fn get(&self) -> DatabaseResult<Value> {
        self.database.backend()?.get(&self.path).await
    }

    pub async fn remove(&self) -> DatabaseResult<()> {
        self.database.backend()?.delete(&self.path).await
    }

    /// Registers a value listener for this reference.
    ///
    /// The callback fires once with the current value, then with the full value after
    /// every change below this location, whichever client made it. Identical consecutive
    /// values are delivered once. Delivery failures arrive as `Err` and leave the
    /// listener attached.
    pub async fn on_value<F>(&self, callback: F) -> DatabaseResult<ListenerRegistration>
    where
        F: Fn(DatabaseResult<DataSnapshot>) + Send + Sync + 'static,
    {
        let callback: ValueListenerCallback = Arc::new(callback);
        let state = Arc::new(ListenerState {
            active: AtomicBool::new(true),
            pushed: AtomicBool::new(false),
            last_delivered: Mutex::new(None),
        });

        let sink: WatchSink = {
            let state = state.clone();
            let callback = callback.clone();
            let reference = self.clone();
            Arc::new(move |event| {
                state.pushed.store(true, Ordering::SeqCst);
                deliver(&state, &callback, &reference, event)
            })
        };
        let watch = self.database.inner.backend.watch(&self.path, sink)?;
        let registration = ListenerRegistration {
            state: state.clone(),
            watch: Some(watch),
        };

        let initial = match self.get().await {
            Ok(value) => WatchEvent::Value(value),
            Err(err) => WatchEvent::Error(err),
        };
        if !state.pushed.load(Ordering::SeqCst) {
            deliver(&state, &callback, self, initial);
        }

        Ok(registration)
    }
}

fn deliver(
    state: &ListenerState,
    callback: &ValueListenerCallback,
    reference: &DatabaseReference,
    event: WatchEvent,
) {
    if !state.active.load(Ordering::SeqCst) {
        return;
    }

    match event {
        WatchEvent::Value(_) if !reference.database.is_online() => {
            state.last_delivered.lock().unwrap().take();
        }
        WatchEvent::Value(value) => {
            {
                let mut last = state.last_delivered.lock().unwrap();
                if last.as_ref() == Some(&value) {
                    return;
                }
                *last = Some(value.clone());
            }
            callback(Ok(DataSnapshot {
                reference: reference.clone(),
                value,
            }));
        }
        WatchEvent::Error(err) => {
            state.last_delivered.lock().unwrap().take();
            callback(Err(err));
        }
    }
}

fn normalize_path(path: &str) -> DatabaseResult<Vec<String>> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        if segment.is_empty() {
            return Err(invalid_argument(
                "Database path cannot contain empty segments",
            ));
        }
        if let Some(bad) = segment.chars().find(|ch| is_forbidden_key_char(*ch)) {
            return Err(invalid_argument(format!(
                "Database path segment \"{segment}\" contains forbidden character '{bad}'"
            )));
        }
        segments.push(segment.to_string());
    }
    Ok(segments)
}

fn is_forbidden_key_char(ch: char) -> bool {
    FORBIDDEN_KEY_CHARS.contains(&ch) || ch.is_ascii_control()
}

/// Rejects object keys the remote store cannot hold.
fn validate_value(value: &Value) -> DatabaseResult<()> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key.is_empty() {
                    return Err(invalid_argument("Database keys cannot be empty"));
                }
                if let Some(bad) = key.chars().find(|ch| is_forbidden_key_char(*ch)) {
                    return Err(invalid_argument(format!(
                        "Database key \"{key}\" contains forbidden character '{bad}'"
                    )));
                }
                validate_value(child)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(validate_value),
        _ => Ok(()),
    }
}
