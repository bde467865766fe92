/**
 * Subscriber Registry
 *
 * Tracks who listens to which resource key. The first subscriber of a key
 * starts its poller and event stream topic; the last one to leave tears
 * both down and clears the key's broker state. Entity events seen on the
 * stream make the poller refetch the entity's collection.
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use super::broker::{BrokerStats, ChangeBroker, ChangeListener, SubscriberId};
use super::config::ChangeConfig;
use super::errors::{ErrorChannel, ErrorRecord, SubscriberError};
use super::event_stream::{EventStreamClient, EventTransport, StreamStats};
use super::poller::{Poller, PollerStats};
use super::types::{ChangeNotification, ResourceKey};
use super::version::{NumericComparator, VersionComparator};
use crate::api::gateway::FetchGateway;
use crate::error::Result;

/// Adapts a pair of closures to [`ChangeListener`]
pub struct FnListener<C, E> {
    on_change: C,
    on_error: E,
}

impl<C, E> FnListener<C, E>
where
    C: Fn(&ChangeNotification) -> core::result::Result<(), SubscriberError> + Send + Sync,
    E: Fn(&ErrorRecord) + Send + Sync,
{
    pub const fn new(on_change: C, on_error: E) -> Self {
        Self { on_change, on_error }
    }
}

impl<C, E> ChangeListener for FnListener<C, E>
where
    C: Fn(&ChangeNotification) -> core::result::Result<(), SubscriberError> + Send + Sync,
    E: Fn(&ErrorRecord) + Send + Sync,
{
    fn on_change(&self, notification: &ChangeNotification) -> core::result::Result<(), SubscriberError> {
        (self.on_change)(notification)
    }

    fn on_error(&self, record: &ErrorRecord) {
        (self.on_error)(record);
    }
}

/// Forwards into a bounded channel without ever blocking the broker.
/// Unsubscribes itself once the receiving end is gone.
struct ChannelListener {
    id: SubscriberId,
    tx: mpsc::Sender<ChangeNotification>,
    registry: Weak<Inner>,
}

impl ChangeListener for ChannelListener {
    fn on_change(&self, notification: &ChangeNotification) -> core::result::Result<(), SubscriberError> {
        match self.tx.try_send(notification.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SubscriberError::Lagging),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                if let Some(inner) = self.registry.upgrade() {
                    if inner.unsubscribe(self.id) {
                        debug!("Receiver for {} dropped, released subscriber {}", notification.key(), self.id);
                    }
                }
                Err(SubscriberError::Closed)
            }
        }
    }
}

/// Releases one subscription. Calling [`Disposer::dispose`] more than once
/// is a no-op. Dropping a disposer does not unsubscribe.
pub struct Disposer {
    id: SubscriberId,
    key: ResourceKey,
    registry: Weak<Inner>,
    disposed: AtomicBool,
}

impl Disposer {
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    #[must_use]
    pub const fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Returns `true` only for the call that actually removed the subscriber
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.registry
            .upgrade()
            .is_some_and(|inner| inner.unsubscribe(self.id))
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_keys: usize,
    pub subscribers: usize,
    pub broker: BrokerStats,
    pub poller: PollerStats,
    pub stream: Option<StreamStats>,
}

#[derive(Default)]
struct Book {
    owners: HashMap<SubscriberId, ResourceKey>,
    by_key: HashMap<ResourceKey, Vec<SubscriberId>>,
}

struct Inner {
    broker: Arc<ChangeBroker>,
    poller: Poller,
    stream: Option<EventStreamClient>,
    config: ChangeConfig,
    book: Mutex<Book>,
}

impl Inner {
    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self, id: SubscriberId, key: &ResourceKey, listener: Arc<dyn ChangeListener>) {
        let mut book = self.book();
        let first = !book.by_key.contains_key(key);

        // Attach before activating so the initial fetch has somewhere to go
        self.broker.attach(key, id, listener);
        book.owners.insert(id, key.clone());
        book.by_key.entry(key.clone()).or_default().push(id);

        if first {
            self.poller.activate(key, self.config.poll_interval);
            if let Some(stream) = &self.stream {
                stream.subscribe_topic(key);
                stream.start();
            }
            info!("👀 Activated {}", key);
        }
        debug!("Subscriber {} added to {}", id, key);
    }

    fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut book = self.book();
        let Some(key) = book.owners.remove(&id) else {
            return false;
        };

        let last = match book.by_key.get_mut(&key) {
            Some(ids) => {
                ids.retain(|sid| *sid != id);
                ids.is_empty()
            }
            None => true,
        };
        self.broker.detach(&key, id);

        if last {
            book.by_key.remove(&key);
            self.teardown(&key);
        }
        debug!("Subscriber {} removed from {}", id, key);
        true
    }

    fn teardown(&self, key: &ResourceKey) {
        self.poller.deactivate(key);
        if let Some(stream) = &self.stream {
            stream.unsubscribe_topic(key);
        }
        self.broker.untrack(key);
        info!("💤 Deactivated {}", key);
    }
}

/// Entry point of the change layer: subscribe to resource keys and receive
/// deduplicated notifications from both the event stream and the poller.
#[derive(Clone)]
pub struct SubscriberRegistry {
    inner: Arc<Inner>,
}

impl SubscriberRegistry {
    /// Start building a registry on top of `gateway`
    #[must_use]
    pub fn builder(gateway: Arc<dyn FetchGateway>) -> RegistryBuilder {
        RegistryBuilder {
            gateway,
            transport: None,
            comparator: Arc::new(NumericComparator),
            config: ChangeConfig::default(),
        }
    }

    /// Subscribe a listener to `key`
    pub fn subscribe(&self, key: &ResourceKey, listener: Arc<dyn ChangeListener>) -> Disposer {
        self.subscribe_as(SubscriberId::new(), key, listener)
    }

    fn subscribe_as(&self, id: SubscriberId, key: &ResourceKey, listener: Arc<dyn ChangeListener>) -> Disposer {
        self.inner.subscribe(id, key, listener);
        Disposer {
            id,
            key: key.clone(),
            registry: Arc::downgrade(&self.inner),
            disposed: AtomicBool::new(false),
        }
    }

    /// Subscribe with closures for changes and key-scoped errors
    pub fn subscribe_fn<C, E>(&self, key: &ResourceKey, on_change: C, on_error: E) -> Disposer
    where
        C: Fn(&ChangeNotification) -> core::result::Result<(), SubscriberError> + Send + Sync + 'static,
        E: Fn(&ErrorRecord) + Send + Sync + 'static,
    {
        self.subscribe(key, Arc::new(FnListener::new(on_change, on_error)))
    }

    /// Subscribe and receive notifications as a stream. A consumer that
    /// falls more than the configured capacity behind misses notifications
    /// and a `Lagging` subscriber error is reported for each. Dropping the
    /// stream releases the subscription on the next notification for `key`.
    pub fn subscribe_channel(&self, key: &ResourceKey) -> (Disposer, ReceiverStream<ChangeNotification>) {
        let (tx, rx) = mpsc::channel(self.inner.config.subscriber_channel_capacity.max(1));
        let id = SubscriberId::new();
        let listener = ChannelListener {
            id,
            tx,
            registry: Arc::downgrade(&self.inner),
        };
        let disposer = self.subscribe_as(id, key, Arc::new(listener));
        (disposer, ReceiverStream::new(rx))
    }

    /// Remove a subscriber by id. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.unsubscribe(id)
    }

    /// Receive every reported failure
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<ErrorRecord> {
        self.inner.broker.errors().subscribe()
    }

    #[must_use]
    pub fn error_channel(&self) -> &ErrorChannel {
        self.inner.broker.errors()
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<ChangeBroker> {
        &self.inner.broker
    }

    #[must_use]
    pub fn stream(&self) -> Option<&EventStreamClient> {
        self.inner.stream.as_ref()
    }

    #[must_use]
    pub fn is_active(&self, key: &ResourceKey) -> bool {
        self.inner.book().by_key.contains_key(key)
    }

    #[must_use]
    pub fn subscriber_count(&self, key: &ResourceKey) -> usize {
        self.inner.book().by_key.get(key).map_or(0, Vec::len)
    }

    /// Drop every subscription and stop the event stream for good
    pub fn shutdown(&self) {
        let keys: Vec<ResourceKey> = {
            let mut book = self.inner.book();
            book.owners.clear();
            book.by_key.drain().map(|(key, _)| key).collect()
        };
        for key in &keys {
            self.inner.teardown(key);
        }
        self.inner.poller.shutdown();
        if let Some(stream) = &self.inner.stream {
            stream.stop();
        }
        info!("Change registry shut down ({} keys released)", keys.len());
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let (active_keys, subscribers) = {
            let book = self.inner.book();
            (book.by_key.len(), book.owners.len())
        };
        RegistryStats {
            active_keys,
            subscribers,
            broker: self.inner.broker.stats(),
            poller: self.inner.poller.stats(),
            stream: self.inner.stream.as_ref().map(EventStreamClient::stats),
        }
    }
}

/// Wires the broker, poller and optional event stream together
pub struct RegistryBuilder {
    gateway: Arc<dyn FetchGateway>,
    transport: Option<Arc<dyn EventTransport>>,
    comparator: Arc<dyn VersionComparator>,
    config: ChangeConfig,
}

impl RegistryBuilder {
    /// Listen for pushed changes over `transport`. Without one the registry
    /// relies on polling alone.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn EventTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn comparator(mut self, comparator: Arc<dyn VersionComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    #[must_use]
    pub fn config(mut self, config: ChangeConfig) -> Self {
        self.config = config.validated();
        self
    }

    /// # Errors
    ///
    /// Returns an error when called outside of a tokio runtime
    pub fn build(self) -> Result<SubscriberRegistry> {
        let errors = ErrorChannel::new(self.config.error_channel_capacity);
        let broker = Arc::new(ChangeBroker::new(self.comparator, errors));

        let stream = self
            .transport
            .map(|t| EventStreamClient::new(t, broker.clone(), self.config.clone()))
            .transpose()?;
        let health = stream.as_ref().map(EventStreamClient::health);
        let poller = Poller::new(self.gateway, broker.clone(), self.config.clone(), health)?;
        if let Some(stream) = &stream {
            poller.follow(stream.refresh_requests());
        }

        Ok(SubscriberRegistry {
            inner: Arc::new(Inner {
                broker,
                poller,
                stream,
                config: self.config,
                book: Mutex::new(Book::default()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::changes::errors::ErrorKind;
    use crate::api::changes::testing::{RecordingListener, ScriptedGateway};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn registry(gateway: Arc<ScriptedGateway>) -> SubscriberRegistry {
        SubscriberRegistry::builder(gateway).build().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_subscribe_activates_last_unsubscribe_tears_down() {
        let gateway = Arc::new(ScriptedGateway::new());
        let key = ResourceKey::integrations();
        gateway.set(&key, 1u64, json!([]));
        let registry = registry(gateway.clone());

        let a = Arc::new(RecordingListener::default());
        let b = Arc::new(RecordingListener::default());
        let da = registry.subscribe(&key, a.clone());
        let db = registry.subscribe(&key, b.clone());
        assert!(registry.is_active(&key));
        assert_eq!(registry.subscriber_count(&key), 2);

        assert_eq!(a.next().await.unwrap().version().as_str(), "1");
        assert_eq!(b.next().await.unwrap().version().as_str(), "1");
        assert_eq!(gateway.calls(&key), 1);

        assert!(da.dispose());
        assert!(registry.is_active(&key));
        assert!(db.dispose());
        assert!(!registry.is_active(&key));
        assert!(!registry.broker().is_tracked(&key));

        let calls = gateway.calls(&key);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(gateway.calls(&key), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_is_idempotent() {
        let gateway = Arc::new(ScriptedGateway::new());
        let key = ResourceKey::connections();
        gateway.set(&key, 1u64, json!([]));
        let registry = registry(gateway);

        let keep = registry.subscribe(&key, Arc::new(RecordingListener::default()));
        let gone = registry.subscribe(&key, Arc::new(RecordingListener::default()));

        assert!(gone.dispose());
        assert!(!gone.dispose());
        assert!(gone.is_disposed());
        assert!(!registry.unsubscribe(gone.id()));
        assert_eq!(registry.subscriber_count(&key), 1);
        assert!(registry.is_active(&key));
        drop(keep);
        assert!(registry.is_active(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_starts_from_scratch() {
        let gateway = Arc::new(ScriptedGateway::new());
        let key = ResourceKey::extensions();
        gateway.set(&key, 3u64, json!([]));
        let registry = registry(gateway);

        let first = Arc::new(RecordingListener::default());
        let d = registry.subscribe(&key, first.clone());
        first.next().await.unwrap();
        d.dispose();

        let second = Arc::new(RecordingListener::default());
        let _d = registry.subscribe(&key, second.clone());
        let again = second.next().await.unwrap();
        assert_eq!(again.version().as_str(), "3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_closure_and_channel_subscribers() {
        use futures::StreamExt;

        let gateway = Arc::new(ScriptedGateway::new());
        let key = ResourceKey::virtualizations();
        gateway.set(&key, 8u64, json!({"items": []}));
        let registry = registry(gateway);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _d1 = registry.subscribe_fn(
            &key,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            |_| {},
        );
        let (_d2, mut stream) = registry.subscribe_channel(&key);

        let got = stream.next().await.unwrap();
        assert_eq!(got.version().as_str(), "8");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stats().subscribers, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_channel_releases_its_subscription() {
        use futures::StreamExt;

        let gateway = Arc::new(ScriptedGateway::new());
        let key = ResourceKey::connectors();
        gateway.set(&key, 1u64, json!([]));
        let config = ChangeConfig {
            poll_interval: Duration::from_secs(5),
            ..Default::default()
        };
        let registry = SubscriberRegistry::builder(gateway.clone()).config(config).build().unwrap();
        let mut errors = registry.errors();

        let (disposer, mut stream) = registry.subscribe_channel(&key);
        assert_eq!(stream.next().await.unwrap().version().as_str(), "1");
        drop(stream);
        assert!(registry.is_active(&key));

        gateway.set(&key, 2u64, json!([]));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(errors.recv().await.unwrap().kind, ErrorKind::Subscriber);
        assert!(!registry.is_active(&key));
        assert_eq!(registry.stats().poller.active_keys, 0);
        assert!(!registry.broker().is_tracked(&key));
        assert!(!disposer.dispose());

        let calls = gateway.calls(&key);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(gateway.calls(&key), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_everything() {
        let gateway = Arc::new(ScriptedGateway::new());
        let a = ResourceKey::integrations();
        let b = ResourceKey::connectors();
        gateway.set(&a, 1u64, json!([]));
        gateway.set(&b, 1u64, json!([]));
        let registry = registry(gateway);

        let da = registry.subscribe(&a, Arc::new(RecordingListener::default()));
        let _db = registry.subscribe(&b, Arc::new(RecordingListener::default()));
        registry.shutdown();

        let stats = registry.stats();
        assert_eq!(stats.active_keys, 0);
        assert_eq!(stats.subscribers, 0);
        assert_eq!(stats.poller.active_keys, 0);
        assert_eq!(stats.broker.tracked_keys, 0);
        assert!(!da.dispose());
    }
}
