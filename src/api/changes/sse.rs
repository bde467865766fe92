/**
 * Server-sent events framing and decoding of syndesis change events.
 *
 * The server pushes `change-event` frames whose data is a JSON object
 * `{"action", "kind", "id"?, "version"?, "payload"?}` and plain `message`
 * frames for connection acknowledgements and heartbeats.
 */
use bytes::BytesMut;
use serde::Deserialize;
use serde_json::Value;

use super::errors::DecodeError;
use super::types::{ChangeKind, ChangeNotification, NotificationSource, ResourceKey, VersionMarker};
use crate::api::resources::collection_for_kind;

pub const CHANGE_EVENT: &str = "change-event";
pub const MESSAGE_EVENT: &str = "message";

/// One dispatched server-sent event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental SSE parser; feed it byte chunks as they arrive
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    corrupt: bool,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every event completed by it.
    /// A frame with invalid UTF-8 yields one `Err` and parsing continues.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<SseEvent, DecodeError>> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }

            if line.is_empty() {
                if let Some(result) = self.dispatch() {
                    out.push(result);
                }
                continue;
            }

            match std::str::from_utf8(&line) {
                Ok(text) => self.field(text),
                Err(_) => self.corrupt = true,
            }
        }

        out
    }

    fn field(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (name, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match name {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<Result<SseEvent, DecodeError>> {
        let event = self.event.take();
        let data = std::mem::take(&mut self.data);
        let id = self.id.take();

        if std::mem::take(&mut self.corrupt) {
            return Some(Err(DecodeError::Utf8));
        }
        if data.is_empty() && event.is_none() {
            return None;
        }

        Some(Ok(SseEvent {
            event: event.unwrap_or_else(|| MESSAGE_EVENT.to_string()),
            data: data.join("\n"),
            id,
        }))
    }
}

/// What an event means for the change layer
#[derive(Debug, Clone)]
pub enum Decoded {
    /// `refresh` names a collection whose snapshot is stale but whose new
    /// version the event does not carry
    Change {
        notification: ChangeNotification,
        refresh: Option<ResourceKey>,
    },
    Heartbeat,
    Ignored,
}

#[derive(Debug, Deserialize)]
struct ChangeEventWire {
    action: Option<String>,
    kind: Option<String>,
    id: Option<String>,
    version: Option<Value>,
    payload: Option<Value>,
}

/// Turn a server event into a notification.
///
/// A change to a single entity is addressed to the entity key
/// (`connections:abc`) only; its version says nothing about the collection,
/// so the collection key (`connections`) is marked for refresh instead.
/// Events without an id address the collection itself.
///
/// # Errors
///
/// Returns a `DecodeError` for invalid JSON, an unknown action, or a change
/// event without a usable version.
pub fn decode_event(event: &SseEvent) -> Result<Decoded, DecodeError> {
    match event.event.as_str() {
        CHANGE_EVENT => decode_change(event),
        MESSAGE_EVENT => Ok(Decoded::Heartbeat),
        _ => Ok(Decoded::Ignored),
    }
}

fn decode_change(event: &SseEvent) -> Result<Decoded, DecodeError> {
    let wire: ChangeEventWire = serde_json::from_str(&event.data)?;

    let kind: ChangeKind = wire.action.ok_or(DecodeError::MissingField("action"))?.parse()?;
    let resource = wire.kind.ok_or(DecodeError::MissingField("kind"))?;
    let version = match wire.version {
        Some(Value::String(s)) => VersionMarker::new(s),
        Some(Value::Number(n)) => VersionMarker::new(n.to_string()),
        Some(other) => return Err(DecodeError::Version(other.to_string())),
        None => event
            .id
            .clone()
            .map(VersionMarker::new)
            .ok_or(DecodeError::MissingField("version"))?,
    };

    let collection = ResourceKey::new(collection_for_kind(&resource));
    let (key, refresh) = match wire.id.filter(|id| !id.is_empty()) {
        Some(id) => (ResourceKey::entity(collection.as_str(), &id), Some(collection)),
        None => (collection, None),
    };

    let mut notification = ChangeNotification::new(key, kind, version).with_source(NotificationSource::EventStream);
    if let Some(payload) = wire.payload {
        notification = notification.with_payload(payload);
    }
    Ok(Decoded::Change { notification, refresh })
}

/// Best-effort resource keys for a change event that failed to decode,
/// most specific first
#[must_use]
pub fn key_hints(event: &SseEvent) -> Vec<ResourceKey> {
    if event.event != CHANGE_EVENT {
        return Vec::new();
    }
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&event.data) else {
        return Vec::new();
    };
    let Some(resource) = map.get("kind").and_then(Value::as_str).filter(|k| !k.is_empty()) else {
        return Vec::new();
    };

    let collection = collection_for_kind(resource);
    let mut hints = Vec::with_capacity(2);
    if let Some(id) = map.get("id").and_then(Value::as_str).filter(|id| !id.is_empty()) {
        hints.push(ResourceKey::entity(&collection, id));
    }
    hints.push(ResourceKey::new(collection));
    hints
}
