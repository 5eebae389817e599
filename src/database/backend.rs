use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable};
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::header::ACCEPT;
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use url::Url;

use crate::database::error::{
    internal_error, invalid_argument, permission_denied, unavailable, DatabaseError,
    DatabaseResult,
};
use crate::database::event_stream::{EventStreamParser, StreamEvent};
use crate::logger::Logger;
use crate::platform::runtime::{sleep, spawn_detached};
use crate::util::{calculate_backoff_millis, Disposer};

/// Characters escaped inside a single URL path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Push notification delivered to a watcher: the full value at the watched path,
/// or a delivery failure.
#[derive(Clone, Debug)]
pub enum WatchEvent {
    Value(Value),
    Error(DatabaseError),
}

pub type WatchSink = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Storage engine behind a [`Database`](crate::database::Database) handle.
///
/// Implementations must notify watchers of every change that affects the watched
/// path, including changes made through the same handle.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    async fn set(&self, path: &[String], value: Value) -> DatabaseResult<()>;
    async fn get(&self, path: &[String]) -> DatabaseResult<Value>;
    async fn delete(&self, path: &[String]) -> DatabaseResult<()>;

    /// Starts pushing changes below `path` into `sink` until the returned guard is dropped.
    fn watch(&self, path: &[String], sink: WatchSink) -> DatabaseResult<Disposer>;
}

/// Picks the REST backend when a database URL is configured, falling back to an
/// in-memory store otherwise.
pub(crate) fn select_backend(database_url: Option<&str>) -> Arc<dyn DatabaseBackend> {
    if let Some(url) = database_url {
        match RestBackend::new(url) {
            Ok(backend) => return Arc::new(backend),
            Err(err) => {
                LOGGER.warn(format!(
                    "Falling back to in-memory Realtime Database backend: {err}"
                ));
            }
        }
    }
    Arc::new(InMemoryBackend::default())
}

struct Watcher {
    id: u64,
    path: Vec<String>,
    sink: WatchSink,
}

/// Process-local backend. Sharing one instance between several `Database` handles
/// models several tabs or devices talking to the same remote store.
pub struct InMemoryBackend {
    data: Mutex<Value>,
    watchers: Arc<Mutex<Vec<Watcher>>>,
    next_watcher_id: AtomicU64,
    reachable: AtomicBool,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            data: Mutex::new(Value::Null),
            watchers: Arc::new(Mutex::new(Vec::new())),
            next_watcher_id: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
        }
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("reachable", &self.is_reachable())
            .finish()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates loss (`false`) or recovery (`true`) of the network path to the store.
    /// While unreachable every read and write fails with `database/unavailable`.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Returns a copy of the whole tree.
    pub fn dump(&self) -> Value {
        self.data.lock().unwrap().clone()
    }

    fn ensure_reachable(&self) -> DatabaseResult<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(unavailable("In-memory database backend is unreachable"))
        }
    }

    fn notify(&self, changed_path: &[String]) {
        let pending: Vec<(WatchSink, Value)> = {
            let watchers = self.watchers.lock().unwrap();
            let data = self.data.lock().unwrap();
            watchers
                .iter()
                .filter(|watcher| paths_related(&watcher.path, changed_path))
                .map(|watcher| {
                    let value = get_at_path(&data, &watcher.path)
                        .cloned()
                        .unwrap_or(Value::Null);
                    (watcher.sink.clone(), value)
                })
                .collect()
        };

        for (sink, value) in pending {
            sink(WatchEvent::Value(value));
        }
    }
}

#[async_trait]
impl DatabaseBackend for InMemoryBackend {
    async fn set(&self, path: &[String], value: Value) -> DatabaseResult<()> {
        self.ensure_reachable()?;
        {
            let mut data = self.data.lock().unwrap();
            let value = normalize_value(value);
            if value.is_null() {
                delete_at_path(&mut data, path);
            } else {
                set_at_path(&mut data, path, value);
            }
            prune_empty(&mut data);
        }
        self.notify(path);
        Ok(())
    }

    async fn get(&self, path: &[String]) -> DatabaseResult<Value> {
        self.ensure_reachable()?;
        let data = self.data.lock().unwrap();
        Ok(get_at_path(&data, path).cloned().unwrap_or(Value::Null))
    }

    async fn delete(&self, path: &[String]) -> DatabaseResult<()> {
        self.ensure_reachable()?;
        {
            let mut data = self.data.lock().unwrap();
            delete_at_path(&mut data, path);
            prune_empty(&mut data);
        }
        self.notify(path);
        Ok(())
    }

    fn watch(&self, path: &[String], sink: WatchSink) -> DatabaseResult<Disposer> {
        let id = self.next_watcher_id.fetch_add(1, Ordering::SeqCst);
        self.watchers.lock().unwrap().push(Watcher {
            id,
            path: path.to_vec(),
            sink,
        });

        let watchers = Arc::downgrade(&self.watchers);
        Ok(Disposer::new(move || {
            if let Some(watchers) = watchers.upgrade() {
                if let Ok(mut guard) = watchers.lock() {
                    guard.retain(|watcher| watcher.id != id);
                }
            }
        }))
    }
}

/// Backend speaking the Realtime Database REST protocol, with push delivered over
/// `text/event-stream`.
#[derive(Clone)]
pub struct RestBackend {
    client: Client,
    base_url: Url,
    base_query: Vec<(String, String)>,
}

impl std::fmt::Debug for RestBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBackend")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl RestBackend {
    pub fn new(raw_url: &str) -> DatabaseResult<Self> {
        let mut url = Url::parse(raw_url)
            .map_err(|err| invalid_argument(format!("Invalid database_url '{raw_url}': {err}")))?;

        // Ensure the base URL ends with a slash so joins behave predictably.
        if !url.path().ends_with('/') {
            let mut path = url.path().trim_end_matches('/').to_owned();
            path.push('/');
            url.set_path(&path);
        }

        let base_query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        url.set_query(None);

        let client = Client::builder()
            .build()
            .map_err(|err| internal_error(format!("Failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            base_url: url,
            base_query,
        })
    }

    fn url_for_path(&self, path: &[String], query: &[(String, String)]) -> DatabaseResult<Url> {
        let relative = if path.is_empty() {
            ".json".to_string()
        } else {
            let encoded: Vec<String> = path
                .iter()
                .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
                .collect();
            format!("{}.json", encoded.join("/"))
        };
        let mut url = self
            .base_url
            .join(&relative)
            .map_err(|err| internal_error(format!("Failed to compose database URL: {err}")))?;

        {
            let mut pairs = url.query_pairs_mut();
            pairs.clear();
            for (key, value) in self.base_query.iter().chain(query.iter()) {
                pairs.append_pair(key, value);
            }
        }

        Ok(url)
    }

    async fn send_request(
        &self,
        method: Method,
        path: &[String],
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> DatabaseResult<Response> {
        let url = self.url_for_path(path, query)?;
        let mut request = self.client.request(method, url);
        if let Some(payload) = body {
            request = request.json(payload);
        }

        request.send().await.map_err(request_error)
    }

    async fn ensure_success(response: Response) -> DatabaseResult<Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.ok();
            Err(error_for_status(status, body))
        }
    }
}

fn silent() -> Vec<(String, String)> {
    vec![("print".to_string(), "silent".to_string())]
}

#[async_trait]
impl DatabaseBackend for RestBackend {
    async fn set(&self, path: &[String], value: Value) -> DatabaseResult<()> {
        let response = self
            .send_request(Method::PUT, path, &silent(), Some(&value))
            .await?;
        Self::ensure_success(response).await.map(|_| ())
    }

    async fn get(&self, path: &[String]) -> DatabaseResult<Value> {
        let response = self.send_request(Method::GET, path, &[], None).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Value::Null);
        }

        let response = Self::ensure_success(response).await?;

        response
            .json()
            .await
            .map_err(|err| internal_error(format!("Failed to decode database response: {err}")))
    }

    async fn delete(&self, path: &[String]) -> DatabaseResult<()> {
        let response = self
            .send_request(Method::DELETE, path, &silent(), None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::ensure_success(response).await.map(|_| ())
    }

    fn watch(&self, path: &[String], sink: WatchSink) -> DatabaseResult<Disposer> {
        let url = self.url_for_path(path, &[])?;
        let client = self.client.clone();
        let (abort_handle, registration) = AbortHandle::new_pair();
        let task = Abortable::new(run_event_stream(client, url, sink), registration);
        spawn_detached(async move {
            let _ = task.await;
        });
        Ok(Disposer::new(move || abort_handle.abort()))
    }
}

/// Keeps one streaming connection open, reconnecting with backoff after failures.
async fn run_event_stream(client: Client, url: Url, sink: WatchSink) {
    let mut failures = 0u32;
    loop {
        match stream_once(&client, url.clone(), &sink).await {
            Ok(()) => {
                failures = 0;
                LOGGER.debug(format!("event stream for {url} closed by the server"));
            }
            Err(err) => {
                LOGGER.warn(format!("event stream for {url} failed: {err}"));
                sink(WatchEvent::Error(err));
                failures = failures.saturating_add(1);
            }
        }
        sleep(Duration::from_millis(calculate_backoff_millis(failures))).await;
    }
}

async fn stream_once(client: &Client, url: Url, sink: &WatchSink) -> DatabaseResult<()> {
    let response = client
        .get(url)
        .header(ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(request_error)?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.ok();
        return Err(error_for_status(status, body));
    }

    let mut parser = EventStreamParser::default();
    let mut snapshot = Value::Null;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(request_error)?;
        for event in parser.push(&chunk) {
            match StreamEvent::parse(event)? {
                StreamEvent::Cancel(reason) => {
                    return Err(permission_denied(format!("Listen cancelled: {reason}")));
                }
                StreamEvent::AuthRevoked(reason) => {
                    return Err(permission_denied(format!("Credential revoked: {reason}")));
                }
                change => {
                    if change.apply(&mut snapshot) {
                        sink(WatchEvent::Value(normalize_value(snapshot.clone())));
                    }
                }
            }
        }
    }
    Ok(())
}

fn request_error(err: reqwest::Error) -> DatabaseError {
    if let Some(status) = err.status() {
        return error_for_status(status, None);
    }
    unavailable(format!("Database request failed: {err}"))
}

fn error_for_status(status: StatusCode, body: Option<String>) -> DatabaseError {
    let message = body.as_deref().and_then(extract_error_message);

    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => invalid_argument(
            message.unwrap_or_else(|| "Invalid data payload".to_string()),
        ),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            permission_denied(message.unwrap_or_else(|| "Permission denied".to_string()))
        }
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => unavailable(format!(
            "Database is unavailable (status {})",
            status.as_str()
        )),
        _ => internal_error(format!(
            "Database request failed with status {}{}",
            status.as_str(),
            message.map(|b| format!(": {b}")).unwrap_or_default()
        )),
    }
}

fn extract_error_message(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }

    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(raw) {
        if let Some(Value::String(message)) = obj.get("error") {
            return Some(message.clone());
        }
    }

    Some(raw.to_string())
}

/// Drops `null` children and empty containers, the way the remote store does on write.
pub(crate) fn normalize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let cleaned: serde_json::Map<String, Value> = map
                .into_iter()
                .map(|(key, child)| (key, normalize_value(child)))
                .filter(|(_, child)| !child.is_null())
                .collect();
            if cleaned.is_empty() {
                Value::Null
            } else {
                Value::Object(cleaned)
            }
        }
        Value::Array(items) => {
            let cleaned: Vec<Value> = items.into_iter().map(normalize_value).collect();
            if cleaned.iter().all(Value::is_null) {
                Value::Null
            } else {
                Value::Array(cleaned)
            }
        }
        other => other,
    }
}

fn prune_empty(root: &mut Value) {
    let current = std::mem::take(root);
    *root = normalize_value(current);
}

pub(crate) fn set_at_path(root: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return;
    };

    let mut current = root;
    for segment in parents {
        current = child_slot(current, segment);
    }
    *child_slot(current, last) = value;
}

/// Returns the child slot for `segment`, creating containers as needed. Arrays are
/// indexed numerically; any other non-object value is replaced by an object.
fn child_slot<'a>(current: &'a mut Value, segment: &str) -> &'a mut Value {
    // Indices far past the end turn the array into an object, as the remote store does
    // for sparse arrays.
    if let (Value::Array(items), Ok(index)) = (&*current, segment.parse::<usize>()) {
        if index <= items.len() + 64 {
            let Value::Array(items) = current else {
                unreachable!("checked above");
            };
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            return &mut items[index];
        }
    }

    if let Value::Array(items) = current {
        let converted = std::mem::take(items)
            .into_iter()
            .enumerate()
            .filter(|(_, item)| !item.is_null())
            .map(|(index, item)| (index.to_string(), item))
            .collect();
        *current = Value::Object(converted);
    }
    if !current.is_object() {
        *current = Value::Object(Default::default());
    }
    match current {
        Value::Object(map) => map.entry(segment.to_string()).or_insert(Value::Null),
        _ => unreachable!("converted to an object above"),
    }
}

pub(crate) fn get_at_path<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = match current {
            Value::Object(obj) => obj.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub(crate) fn delete_at_path(root: &mut Value, path: &[String]) {
    let Some((last, parents)) = path.split_last() else {
        *root = Value::Null;
        return;
    };

    let mut current = root;
    for segment in parents {
        let next = match current {
            Value::Object(obj) => obj.get_mut(segment),
            Value::Array(items) => match segment.parse::<usize>() {
                Ok(index) => items.get_mut(index),
                Err(_) => None,
            },
            _ => None,
        };
        match next {
            Some(next) => current = next,
            None => return,
        }
    }

    match current {
        Value::Object(obj) => {
            obj.remove(last);
        }
        Value::Array(items) => {
            if let Ok(index) = last.parse::<usize>() {
                if let Some(slot) = items.get_mut(index) {
                    *slot = Value::Null;
                }
            }
        }
        _ => {}
    }
}

pub(crate) fn paths_related(a: &[String], b: &[String]) -> bool {
    is_prefix(a, b) || is_prefix(b, a)
}

fn is_prefix(prefix: &[String], path: &[String]) -> bool {
    if prefix.len() > path.len() {
        return false;
    }
    prefix
        .iter()
        .zip(path.iter())
        .all(|(left, right)| left == right)
}

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@saved-sync/database"));

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn segments(path: &str) -> Vec<String> {
        path.split('/').map(str::to_string).collect()
    }

    #[test]
    fn path_helpers_index_into_arrays() {
        let mut root = json!({"users": {"u1": {"properties": [{"id": 1}, {"id": 2}]}}});

        set_at_path(&mut root, &segments("users/u1/properties/1/note"), json!("corner unit"));
        assert_eq!(
            get_at_path(&root, &segments("users/u1/properties/1")),
            Some(&json!({"id": 2, "note": "corner unit"}))
        );

        delete_at_path(&mut root, &segments("users/u1/properties/0"));
        prune_empty(&mut root);
        assert_eq!(
            root,
            json!({"users": {"u1": {"properties": [null, {"id": 2, "note": "corner unit"}]}}})
        );
    }

    #[test]
    fn normalize_collapses_empty_containers() {
        assert_eq!(normalize_value(json!([])), Value::Null);
        assert_eq!(normalize_value(json!({"a": {}, "b": null})), Value::Null);
        assert_eq!(
            normalize_value(json!({"a": {"b": 1}, "c": []})),
            json!({"a": {"b": 1}})
        );
    }

    #[tokio::test]
    async fn in_memory_watchers_see_related_writes_only() {
        let backend = InMemoryBackend::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let guard = backend
            .watch(
                &segments("users/a/properties"),
                Arc::new(move |event| {
                    if let WatchEvent::Value(value) = event {
                        captured.lock().unwrap().push(value);
                    }
                }),
            )
            .unwrap();

        backend
            .set(&segments("users/a/properties"), json!([{"id": 1}]))
            .await
            .unwrap();
        backend
            .set(&segments("users/b/properties"), json!([{"id": 9}]))
            .await
            .unwrap();
        backend.delete(&segments("users/a")).await.unwrap();

        guard.dispose();
        backend
            .set(&segments("users/a/properties"), json!([{"id": 2}]))
            .await
            .unwrap();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[json!([{"id": 1}]), Value::Null]
        );
    }

    #[tokio::test]
    async fn unreachable_in_memory_backend_rejects_operations() {
        let backend = InMemoryBackend::new();
        backend.set_reachable(false);
        let err = backend.get(&segments("users")).await.unwrap_err();
        assert_eq!(err.code_str(), "database/unavailable");

        backend.set_reachable(true);
        assert_eq!(backend.get(&segments("users")).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn rest_backend_puts_silently_and_keeps_base_query() {
        let server = MockServer::start_async().await;
        let put_mock = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path("/users/user_1/properties.json")
                    .query_param("ns", "demo")
                    .query_param("print", "silent")
                    .json_body(json!([{"id": 1}]));
                then.status(204);
            })
            .await;

        let backend = RestBackend::new(&server.url("/?ns=demo")).unwrap();
        backend
            .set(&segments("users/user_1/properties"), json!([{"id": 1}]))
            .await
            .unwrap();

        put_mock.assert_async().await;
    }

    #[tokio::test]
    async fn rest_backend_maps_missing_paths_and_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/users/nobody/lastActive.json");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/users/locked.json");
                then.status(401).json_body(json!({"error": "Permission denied"}));
            })
            .await;

        let backend = RestBackend::new(&server.url("/")).unwrap();
        let value = backend
            .get(&segments("users/nobody/lastActive"))
            .await
            .unwrap();
        assert_eq!(value, Value::Null);

        let err = backend.delete(&segments("users/locked")).await.unwrap_err();
        assert_eq!(err.code_str(), "database/permission-denied");
        assert_eq!(err.message(), "Permission denied");
    }

    #[tokio::test]
    async fn rest_backend_streams_put_events_to_watchers() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/users/user_1/properties.json")
                    .header("accept", "text/event-stream");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(
                        "event: put\ndata: {\"path\":\"/\",\"data\":[{\"id\":1}]}\n\n\
                         event: keep-alive\ndata: null\n\n\
                         event: put\ndata: {\"path\":\"/1\",\"data\":{\"id\":2}}\n\n",
                    );
            })
            .await;

        let backend = RestBackend::new(&server.url("/")).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let guard = backend
            .watch(
                &segments("users/user_1/properties"),
                Arc::new(move |event| {
                    if let WatchEvent::Value(value) = event {
                        captured.lock().unwrap().push(value);
                    }
                }),
            )
            .unwrap();

        for _ in 0..100 {
            if seen.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        guard.dispose();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], json!([{"id": 1}]));
        assert_eq!(seen[1], json!([{"id": 1}, {"id": 2}]));
    }
}
