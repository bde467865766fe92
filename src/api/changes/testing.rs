/**
 * In-memory stand-ins for the event transport, the fetch gateway and
 * listeners, for driving the change layer without a server.
 */
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::broker::ChangeListener;
use super::errors::{ErrorRecord, SubscriberError, TransportError};
use super::event_stream::{ByteStream, EventTransport};
use super::types::{ChangeNotification, ResourceKey, Snapshot, VersionMarker};
use crate::api::gateway::{FetchGateway, GatewayError};

enum Scripted {
    Refuse(String),
    Open(mpsc::UnboundedReceiver<Result<Bytes, TransportError>>),
}

/// Hands out queued connection outcomes in order; once the script runs out
/// every connect succeeds with a channel that stays silent forever.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    attempts: AtomicUsize,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse(&self, message: impl Into<String>) {
        self.push(Scripted::Refuse(message.into()));
    }

    /// Queue a successful connect and return the server end of it
    #[must_use]
    pub fn open(&self) -> ServerConnection {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(Scripted::Open(rx));
        ServerConnection { tx }
    }

    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn push(&self, step: Scripted) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(step);
    }
}

#[async_trait]
impl EventTransport for ScriptedTransport {
    async fn connect(&self) -> Result<ByteStream, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match step {
            Some(Scripted::Refuse(message)) => Err(TransportError::Connect(message)),
            Some(Scripted::Open(rx)) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

/// Server side of a scripted connection. Dropping it closes the channel.
pub struct ServerConnection {
    tx: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
}

impl ServerConnection {
    pub fn send_raw(&self, frame: &str) {
        let _ = self.tx.send(Ok(Bytes::copy_from_slice(frame.as_bytes())));
    }

    /// Push a `change-event` frame
    pub fn send_change(&self, action: &str, kind: &str, id: Option<&str>, version: u64) {
        let mut data = json!({ "action": action, "kind": kind, "version": version });
        if let Some(id) = id {
            data["id"] = Value::String(id.to_string());
        }
        self.send_raw(&format!("event: change-event\ndata: {data}\n\n"));
    }

    pub fn heartbeat(&self) {
        self.send_raw("event: message\ndata: heartbeat\n\n");
    }

    pub fn fail(&self, error: TransportError) {
        let _ = self.tx.send(Err(error));
    }

    pub fn close(self) {}
}

#[derive(Default)]
struct GatewayEntry {
    current: Option<(VersionMarker, Value)>,
    failures: VecDeque<GatewayError>,
    delay: Option<Duration>,
    calls: usize,
}

/// Serves whatever snapshot was last set for a key
#[derive(Default)]
pub struct ScriptedGateway {
    entries: Mutex<HashMap<ResourceKey, GatewayEntry>>,
}

impl ScriptedGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<T>(&self, key: &ResourceKey, f: impl FnOnce(&mut GatewayEntry) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        f(entries.entry(key.clone()).or_default())
    }

    pub fn set(&self, key: &ResourceKey, version: impl Into<VersionMarker>, payload: Value) {
        let version = version.into();
        self.with_entry(key, |e| e.current = Some((version, payload)));
    }

    /// Fail the next fetch of `key` with `error`
    pub fn fail_next(&self, key: &ResourceKey, error: GatewayError) {
        self.with_entry(key, |e| e.failures.push_back(error));
    }

    /// Hold every fetch of `key` for `delay` before answering
    pub fn delay(&self, key: &ResourceKey, delay: Duration) {
        self.with_entry(key, |e| e.delay = Some(delay));
    }

    #[must_use]
    pub fn calls(&self, key: &ResourceKey) -> usize {
        self.with_entry(key, |e| e.calls)
    }
}

#[async_trait]
impl FetchGateway for ScriptedGateway {
    async fn fetch(&self, key: &ResourceKey) -> Result<Snapshot, GatewayError> {
        let (failure, delay) = self.with_entry(key, |e| {
            e.calls += 1;
            (e.failures.pop_front(), e.delay)
        });
        if let Some(error) = failure {
            return Err(error);
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with_entry(key, |e| e.current.clone())
            .map(|(version, payload)| Snapshot::new(key.clone(), version, payload))
            .ok_or_else(|| GatewayError::Network(format!("no resource at {key}")))
    }
}

/// Listener that records everything it is handed
pub struct RecordingListener {
    tx: mpsc::UnboundedSender<ChangeNotification>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChangeNotification>>,
    seen: Mutex<Vec<ChangeNotification>>,
    errors: Mutex<Vec<ErrorRecord>>,
    fail: bool,
}

impl Default for RecordingListener {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            seen: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            fail: false,
        }
    }
}

impl RecordingListener {
    /// Records like any other listener but returns an error from every call
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Wait for the next delivered notification
    pub async fn next(&self) -> Option<ChangeNotification> {
        self.rx.lock().await.recv().await
    }

    #[must_use]
    pub fn versions(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|n| n.version().as_str().to_string())
            .collect()
    }

    #[must_use]
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ChangeListener for RecordingListener {
    fn on_change(&self, notification: &ChangeNotification) -> Result<(), SubscriberError> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification.clone());
        let _ = self.tx.send(notification.clone());
        if self.fail {
            return Err(SubscriberError::failed("listener rejects everything"));
        }
        Ok(())
    }

    fn on_error(&self, record: &ErrorRecord) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}
