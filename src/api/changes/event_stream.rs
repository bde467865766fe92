/**
 * Event Stream Client
 *
 * Keeps one long-lived server-sent events channel open, reconnecting with
 * jittered exponential backoff, and forwards decoded change events for the
 * subscribed topics to the change broker. Entity events also ask the
 * poller, through [`EventStreamClient::refresh_requests`], to refetch their
 * collection when that collection is a topic.
 */
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, HeaderValue};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backoff::Backoff;
use super::broker::ChangeBroker;
use super::config::ChangeConfig;
use super::errors::{DecodeError, ErrorKind, ErrorRecord, TransportError};
use super::sse::{Decoded, SseDecoder, SseEvent, decode_event, key_hints};
use super::types::ResourceKey;
use crate::api::client::{self, ApiConfig};
use crate::error::Result;

pub type ByteStream = BoxStream<'static, core::result::Result<Bytes, TransportError>>;

/// Opens the raw server-push channel
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// # Errors
    ///
    /// Returns a `TransportError` if the channel cannot be opened
    async fn connect(&self) -> core::result::Result<ByteStream, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// How the SSE endpoint is located
#[derive(Debug, Clone)]
pub enum EventEndpoint {
    /// `POST event/reservations`, then `GET event/streams/{reservation}`
    Reservation,
    /// A fixed path relative to the API base
    Path(String),
}

/// Server-sent events over HTTP
#[derive(Debug, Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    config: ApiConfig,
    endpoint: EventEndpoint,
}

impl SseTransport {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built
    pub fn new(config: ApiConfig, endpoint: EventEndpoint) -> Result<Self> {
        let client = client::new(&config)?;
        Ok(Self {
            client,
            config,
            endpoint,
        })
    }

    async fn reserve(&self) -> core::result::Result<String, TransportError> {
        let url = self
            .config
            .base_url
            .join("event/reservations")
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        parse_reservation(&body).ok_or_else(|| TransportError::Connect("empty reservation".to_string()))
    }
}

/// Reservations come back as `{"data": "id"}`, a JSON string, or plain text
fn parse_reservation(body: &str) -> Option<String> {
    let id = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map.get("data").and_then(Value::as_str).map(str::to_string),
        Ok(Value::String(s)) => Some(s),
        _ => Some(body.trim().to_string()),
    }?;
    (!id.is_empty()).then_some(id)
}

#[async_trait]
impl EventTransport for SseTransport {
    async fn connect(&self) -> core::result::Result<ByteStream, TransportError> {
        let path = match &self.endpoint {
            EventEndpoint::Reservation => format!("event/streams/{}", self.reserve().await?),
            EventEndpoint::Path(path) => path.trim_start_matches('/').to_string(),
        };
        let url = self
            .config
            .base_url
            .join(&path)
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        debug!("Opening event stream at {}", url);
        let response = self
            .client
            .get(url)
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        Ok(response
            .bytes_stream()
            .map_err(|e| TransportError::Read(e.to_string()))
            .boxed())
    }
}

type Deliveries = Arc<Mutex<HashMap<ResourceKey, Instant>>>;

/// Read-only view of the stream's health, used by the poller to back off
#[derive(Debug, Clone)]
pub struct StreamHealth {
    state: watch::Receiver<StreamState>,
    deliveries: Deliveries,
}

impl StreamHealth {
    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Connected and has delivered something for `key` within `window`.
    /// Heartbeats and traffic for other keys do not count.
    #[must_use]
    pub fn is_fresh(&self, key: &ResourceKey, window: Duration) -> bool {
        if self.state() != StreamState::Connected {
            return false;
        }
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|at| at.elapsed() <= window)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub state: StreamState,
    pub topics: usize,
    pub connects: u64,
    pub reconnects: u64,
    pub events: u64,
    pub decode_failures: u64,
    pub forwarded: u64,
    pub refreshes: u64,
}

#[derive(Debug, Default)]
struct StreamCounters {
    connects: AtomicU64,
    reconnects: AtomicU64,
    events: AtomicU64,
    decode_failures: AtomicU64,
    forwarded: AtomicU64,
    refreshes: AtomicU64,
}

struct Shared {
    broker: Arc<ChangeBroker>,
    topics: Mutex<HashSet<ResourceKey>>,
    state: watch::Sender<StreamState>,
    deliveries: Deliveries,
    refresh: Mutex<Option<mpsc::UnboundedSender<ResourceKey>>>,
    counters: StreamCounters,
}

impl Shared {
    fn topics(&self) -> MutexGuard<'_, HashSet<ResourceKey>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliveries(&self) -> MutexGuard<'_, HashMap<ResourceKey, Instant>> {
        self.deliveries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_topic(&self, key: &ResourceKey) -> bool {
        self.topics().contains(key)
    }

    /// `Stopped` is terminal; only `EventStreamClient::stop` may set it
    fn set_state(&self, next: StreamState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == StreamState::Stopped || *current == next {
                return false;
            }
            debug!("Event stream {:?} -> {:?}", current, next);
            *current = next;
            true
        })
    }

    fn forget_deliveries(&self) {
        self.deliveries().clear();
    }

    fn touch(&self, key: &ResourceKey) {
        self.deliveries().insert(key.clone(), Instant::now());
    }

    fn handle_event(&self, event: core::result::Result<SseEvent, DecodeError>) {
        self.counters.events.fetch_add(1, Ordering::Relaxed);
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                self.decode_failed(&[], &e);
                return;
            }
        };

        match decode_event(&event) {
            Ok(Decoded::Change { notification, refresh }) => {
                if self.is_topic(notification.key()) {
                    self.touch(notification.key());
                    self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                    self.broker.publish(notification);
                } else {
                    trace!("No topic for {}, skipping", notification.key());
                }
                if let Some(collection) = refresh.filter(|k| self.is_topic(k)) {
                    self.request_refresh(collection);
                }
            }
            Ok(Decoded::Heartbeat) => trace!("Event stream heartbeat"),
            Ok(Decoded::Ignored) => {}
            Err(e) => self.decode_failed(&key_hints(&event), &e),
        }
    }

    fn request_refresh(&self, key: ResourceKey) {
        let sent = self
            .refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| tx.send(key.clone()).is_ok());
        if sent {
            self.touch(&key);
            self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
        } else {
            trace!("Nobody follows refresh requests, dropping {}", key);
        }
    }

    /// Scoped to the most specific hinted key that is a topic
    fn decode_failed(&self, hints: &[ResourceKey], error: &DecodeError) {
        self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
        let key = {
            let topics = self.topics();
            hints.iter().find(|k| topics.contains(*k)).or_else(|| hints.first()).cloned()
        };
        self.broker
            .report_error(ErrorRecord::new(key, ErrorKind::Decode, error.to_string()));
    }
}

/// Auto-reconnecting subscription to the server event channel.
///
/// `Disconnected -> Connecting -> Connected`, back to `Disconnected` on any
/// channel failure, and `Stopped` for good after [`EventStreamClient::stop`].
pub struct EventStreamClient {
    shared: Arc<Shared>,
    transport: Arc<dyn EventTransport>,
    config: ChangeConfig,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    runtime: Handle,
}

impl EventStreamClient {
    /// # Errors
    ///
    /// Returns an error when called outside of a tokio runtime
    pub fn new(
        transport: Arc<dyn EventTransport>,
        broker: Arc<ChangeBroker>,
        config: ChangeConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current()?;
        let (state, _) = watch::channel(StreamState::Disconnected);
        Ok(Self {
            shared: Arc::new(Shared {
                broker,
                topics: Mutex::new(HashSet::new()),
                state,
                deliveries: Arc::new(Mutex::new(HashMap::new())),
                refresh: Mutex::new(None),
                counters: StreamCounters::default(),
            }),
            transport,
            config,
            task: Mutex::new(None),
            runtime,
        })
    }

    fn task(&self) -> MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.shared.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.shared.state.subscribe()
    }

    #[must_use]
    pub fn health(&self) -> StreamHealth {
        StreamHealth {
            state: self.shared.state.subscribe(),
            deliveries: self.shared.deliveries.clone(),
        }
    }

    /// Collections to refetch because one of their entities changed. Only
    /// the most recently returned receiver gets requests.
    pub fn refresh_requests(&self) -> mpsc::UnboundedReceiver<ResourceKey> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.refresh.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Start the connection loop. Returns `false` if it is already running
    /// or the client has been stopped.
    pub fn start(&self) -> bool {
        let mut task = self.task();
        if task.is_some() || self.state() == StreamState::Stopped {
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = self.runtime.spawn(run(
            self.shared.clone(),
            self.transport.clone(),
            self.config.clone(),
            cancel.clone(),
        ));
        *task = Some((cancel, handle));
        info!("📡 Event stream client started");
        true
    }

    /// Close the channel and cancel any pending reconnect. Terminal.
    pub fn stop(&self) {
        self.shared.state.send_replace(StreamState::Stopped);
        if let Some((cancel, _handle)) = self.task().take() {
            cancel.cancel();
            info!("📡 Event stream client stopped");
        }
    }

    /// Forward notifications for `key`. Returns `false` if already subscribed.
    pub fn subscribe_topic(&self, key: &ResourceKey) -> bool {
        self.shared.topics().insert(key.clone())
    }

    pub fn unsubscribe_topic(&self, key: &ResourceKey) -> bool {
        self.shared.deliveries().remove(key);
        self.shared.topics().remove(key)
    }

    #[must_use]
    pub fn topics(&self) -> Vec<ResourceKey> {
        self.shared.topics().iter().cloned().collect()
    }

    #[must_use]
    pub fn stats(&self) -> StreamStats {
        let c = &self.shared.counters;
        StreamStats {
            state: self.state(),
            topics: self.shared.topics().len(),
            connects: c.connects.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
            events: c.events.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            refreshes: c.refreshes.load(Ordering::Relaxed),
        }
    }
}

impl Drop for EventStreamClient {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.task().take() {
            cancel.cancel();
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    transport: Arc<dyn EventTransport>,
    config: ChangeConfig,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(config.initial_backoff, config.max_backoff, config.backoff_jitter);

    loop {
        shared.set_state(StreamState::Connecting);

        let opened = tokio::select! {
            () = cancel.cancelled() => break,
            opened = timeout(config.connect_timeout, transport.connect()) => opened,
        };

        let failure = match opened {
            Ok(Ok(stream)) => {
                shared.forget_deliveries();
                shared.set_state(StreamState::Connected);
                shared.counters.connects.fetch_add(1, Ordering::Relaxed);
                backoff.reset();
                info!("📡 Event stream connected");
                match consume(&shared, stream, config.idle_timeout, &cancel).await {
                    Some(failure) => failure,
                    None => break,
                }
            }
            Ok(Err(e)) => e,
            Err(_) => TransportError::ConnectTimeout(config.connect_timeout),
        };

        shared.set_state(StreamState::Disconnected);
        shared
            .broker
            .report_error(ErrorRecord::new(None, ErrorKind::Transport, failure.to_string()));

        let delay = backoff.next_delay();
        warn!(
            "Event stream failed (attempt {}): {}, reconnecting in {:?}",
            backoff.attempts(),
            failure,
            delay
        );
        tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep(delay) => {}
        }
        shared.counters.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    debug!("Event stream loop exited");
}

/// Read until the channel fails. `None` means cancelled.
async fn consume(
    shared: &Shared,
    mut stream: ByteStream,
    idle: Option<Duration>,
    cancel: &CancellationToken,
) -> Option<TransportError> {
    let mut decoder = SseDecoder::new();

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return None,
            next = next_chunk(&mut stream, idle) => next,
        };

        match next {
            Ok(Some(chunk)) => {
                for event in decoder.feed(&chunk) {
                    shared.handle_event(event);
                }
            }
            Ok(None) => return Some(TransportError::Closed),
            Err(e) => return Some(e),
        }
    }
}

async fn next_chunk(
    stream: &mut ByteStream,
    idle: Option<Duration>,
) -> core::result::Result<Option<Bytes>, TransportError> {
    match idle {
        Some(limit) => timeout(limit, stream.next())
            .await
            .map_err(|_| TransportError::Idle(limit))?
            .transpose(),
        None => stream.next().await.transpose(),
    }
}
