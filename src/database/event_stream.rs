//! Decoding of the Realtime Database REST streaming protocol.
//!
//! A streaming `GET` with `Accept: text/event-stream` yields server-sent events whose
//! `data` line is `{"path": "/relative/path", "data": <json>}`. `put` replaces the value
//! at `path`, `patch` merges the children of `data` below `path`.

use bytes::BytesMut;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::database::backend::{delete_at_path, set_at_path};
use crate::database::error::{internal_error, DatabaseResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ServerEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser; chunks may split lines anywhere.
#[derive(Debug, Default)]
pub(crate) struct EventStreamParser {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
}

impl EventStreamParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ServerEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw = self.buffer.split_to(newline + 1);
            let mut bytes = &raw[..newline];
            if bytes.ends_with(b"\r") {
                bytes = &bytes[..bytes.len() - 1];
            }
            let line = String::from_utf8_lossy(bytes).into_owned();

            if line.is_empty() {
                if let Some(event) = self.flush() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line.as_str(), ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        events
    }

    fn flush(&mut self) -> Option<ServerEvent> {
        if self.event.is_none() && self.data.is_empty() {
            return None;
        }
        let event = self.event.take().unwrap_or_else(|| "message".to_string());
        let data = std::mem::take(&mut self.data).join("\n");
        Some(ServerEvent { event, data })
    }
}

#[derive(Deserialize)]
struct PathPayload {
    path: String,
    data: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum StreamEvent {
    Put { path: Vec<String>, data: Value },
    Patch { path: Vec<String>, data: Map<String, Value> },
    KeepAlive,
    Cancel(String),
    AuthRevoked(String),
    Ignored(String),
}

impl StreamEvent {
    pub fn parse(event: ServerEvent) -> DatabaseResult<Self> {
        match event.event.as_str() {
            "put" => {
                let payload = decode_payload(&event.data)?;
                Ok(StreamEvent::Put {
                    path: split_path(&payload.path),
                    data: payload.data,
                })
            }
            "patch" => {
                let payload = decode_payload(&event.data)?;
                let Value::Object(data) = payload.data else {
                    return Err(internal_error("patch event data must be an object"));
                };
                Ok(StreamEvent::Patch {
                    path: split_path(&payload.path),
                    data,
                })
            }
            "keep-alive" => Ok(StreamEvent::KeepAlive),
            "cancel" => Ok(StreamEvent::Cancel(event.data)),
            "auth_revoked" => Ok(StreamEvent::AuthRevoked(event.data)),
            other => Ok(StreamEvent::Ignored(other.to_string())),
        }
    }

    /// Applies a `put`/`patch` to the locally mirrored value. Returns `false` for
    /// events that carry no data change.
    pub fn apply(self, snapshot: &mut Value) -> bool {
        match self {
            StreamEvent::Put { path, data } => {
                write_at(snapshot, &path, data);
                true
            }
            StreamEvent::Patch { path, data } => {
                for (key, value) in data {
                    let mut target = path.clone();
                    target.extend(split_path(&key));
                    write_at(snapshot, &target, value);
                }
                true
            }
            _ => false,
        }
    }
}

fn write_at(snapshot: &mut Value, path: &[String], value: Value) {
    if value.is_null() {
        delete_at_path(snapshot, path);
    } else {
        set_at_path(snapshot, path, value);
    }
}

fn decode_payload(raw: &str) -> DatabaseResult<PathPayload> {
    serde_json::from_str(raw)
        .map_err(|err| internal_error(format!("Malformed event stream payload: {err}")))
}

fn split_path(raw: &str) -> Vec<String> {
    raw.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}
