/**
 * Change Broker
 *
 * Merges notifications from the event stream and the poller, drops anything
 * that is not strictly newer than the last delivered version of its key, and
 * fans the rest out to the key's listeners in subscription order.
 */
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};
use uuid::Uuid;

use super::errors::{ErrorChannel, ErrorKind, ErrorRecord, SubscriberError};
use super::types::{ChangeNotification, ResourceKey, VersionMarker};
use super::version::{NumericComparator, VersionComparator};

/// Receives notifications for one resource key.
///
/// Callbacks run on the publishing task and must not block for long. A
/// returned error or a panic is isolated to this listener.
pub trait ChangeListener: Send + Sync {
    /// # Errors
    ///
    /// Any error is reported on the error channel; delivery to other
    /// listeners continues.
    fn on_change(&self, notification: &ChangeNotification) -> Result<(), SubscriberError>;

    /// Called for gateway and decode failures scoped to the listener's key
    fn on_error(&self, _record: &ErrorRecord) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What happened to a published notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Nobody tracks the key
    Untracked,
    /// Another dispatch for the key is running and will pick it up
    Queued,
    /// This call ran the dispatch loop
    Dispatched { accepted: usize, discarded: usize },
}

struct KeyState {
    last: Option<VersionMarker>,
    listeners: Vec<(SubscriberId, Arc<dyn ChangeListener>)>,
    queue: VecDeque<ChangeNotification>,
    dispatching: bool,
    generation: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    accepted: AtomicU64,
    discarded: AtomicU64,
    deliveries: AtomicU64,
    subscriber_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub tracked_keys: usize,
    pub listeners: usize,
    pub published: u64,
    pub accepted: u64,
    pub discarded: u64,
    pub deliveries: u64,
    pub subscriber_failures: u64,
}

pub struct ChangeBroker {
    keys: Mutex<HashMap<ResourceKey, KeyState>>,
    comparator: Arc<dyn VersionComparator>,
    errors: ErrorChannel,
    next_generation: AtomicU64,
    counters: Counters,
}

impl fmt::Debug for ChangeBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeBroker")
            .field("comparator", &self.comparator)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl ChangeBroker {
    #[must_use]
    pub fn new(comparator: Arc<dyn VersionComparator>, errors: ErrorChannel) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            comparator,
            errors,
            next_generation: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    /// Broker with numeric version markers
    #[must_use]
    pub fn numeric(errors: ErrorChannel) -> Self {
        Self::new(Arc::new(NumericComparator), errors)
    }

    fn keys(&self) -> MutexGuard<'_, HashMap<ResourceKey, KeyState>> {
        // Listener code never runs under this lock, so a poisoned guard still holds consistent state
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    /// Start tracking a key. Returns `false` if it was already tracked.
    pub fn track(&self, key: &ResourceKey) -> bool {
        let mut keys = self.keys();
        if keys.contains_key(key) {
            return false;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        keys.insert(
            key.clone(),
            KeyState {
                last: None,
                listeners: Vec::new(),
                queue: VecDeque::new(),
                dispatching: false,
                generation,
            },
        );
        debug!("Tracking {} (generation {})", key, generation);
        true
    }

    /// Drop all state for a key, including its last version and queued work.
    /// A dispatch already running for the key stops after its current delivery.
    pub fn untrack(&self, key: &ResourceKey) -> bool {
        let removed = self.keys().remove(key).is_some();
        if removed {
            debug!("Stopped tracking {}", key);
        }
        removed
    }

    #[must_use]
    pub fn is_tracked(&self, key: &ResourceKey) -> bool {
        self.keys().contains_key(key)
    }

    /// Append a listener for `key`, tracking the key if needed
    pub fn attach(&self, key: &ResourceKey, id: SubscriberId, listener: Arc<dyn ChangeListener>) {
        self.track(key);
        if let Some(state) = self.keys().get_mut(key) {
            state.listeners.push((id, listener));
        }
    }

    /// Remove a listener. Returns how many listeners remain on the key,
    /// or `None` if the listener was not attached.
    pub fn detach(&self, key: &ResourceKey, id: SubscriberId) -> Option<usize> {
        let mut keys = self.keys();
        let state = keys.get_mut(key)?;
        let before = state.listeners.len();
        state.listeners.retain(|(sid, _)| *sid != id);
        (state.listeners.len() < before).then_some(state.listeners.len())
    }

    #[must_use]
    pub fn last_version(&self, key: &ResourceKey) -> Option<VersionMarker> {
        self.keys().get(key).and_then(|s| s.last.clone())
    }

    /// Accept a notification from any source.
    ///
    /// Only one dispatch runs per key at a time; a publish that arrives while
    /// the key is being dispatched is queued and delivered by the running
    /// dispatch once the current notification has reached every listener.
    pub fn publish(&self, notification: ChangeNotification) -> PublishOutcome {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let key = notification.key().clone();

        let generation = {
            let mut keys = self.keys();
            let Some(state) = keys.get_mut(&key) else {
                trace!("Dropping notification for untracked key {}", key);
                return PublishOutcome::Untracked;
            };
            state.queue.push_back(notification);
            if state.dispatching {
                return PublishOutcome::Queued;
            }
            state.dispatching = true;
            state.generation
        };

        self.drain(&key, generation)
    }

    fn drain(&self, key: &ResourceKey, generation: u64) -> PublishOutcome {
        let mut accepted = 0;
        let mut discarded = 0;

        loop {
            let (notification, listeners) = {
                let mut keys = self.keys();
                let Some(state) = keys.get_mut(key) else {
                    break;
                };
                if state.generation != generation {
                    break;
                }
                let Some(notification) = state.queue.pop_front() else {
                    state.dispatching = false;
                    break;
                };

                if let Some(last) = &state.last {
                    match self.comparator.is_newer(notification.version(), last) {
                        Some(true) => {}
                        Some(false) => {
                            debug!(
                                "Discarding {} {} v{} (last delivered v{})",
                                key,
                                notification.kind(),
                                notification.version(),
                                last
                            );
                            discarded += 1;
                            continue;
                        }
                        None => {
                            discarded += 1;
                            let message = format!(
                                "version {} cannot be compared with {}",
                                notification.version(),
                                last
                            );
                            drop(keys);
                            self.report_error(ErrorRecord::new(
                                Some(key.clone()),
                                ErrorKind::Decode,
                                message,
                            ));
                            continue;
                        }
                    }
                }

                state.last = Some(notification.version().clone());
                accepted += 1;
                (notification, state.listeners.clone())
            };

            self.deliver(&notification, &listeners);
        }

        self.counters.accepted.fetch_add(accepted as u64, Ordering::Relaxed);
        self.counters.discarded.fetch_add(discarded as u64, Ordering::Relaxed);
        PublishOutcome::Dispatched { accepted, discarded }
    }

    fn deliver(
        &self,
        notification: &ChangeNotification,
        listeners: &[(SubscriberId, Arc<dyn ChangeListener>)],
    ) {
        debug!(
            "Delivering {} {} v{} to {} listener(s)",
            notification.key(),
            notification.kind(),
            notification.version(),
            listeners.len()
        );

        for (id, listener) in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_change(notification)))
                .unwrap_or_else(|panic| Err(SubscriberError::Panicked(panic_message(&*panic))));

            match result {
                Ok(()) => {
                    self.counters.deliveries.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.subscriber_failures.fetch_add(1, Ordering::Relaxed);
                    self.errors.report(ErrorRecord::new(
                        Some(notification.key().clone()),
                        ErrorKind::Subscriber,
                        format!("subscriber {id}: {e}"),
                    ));
                }
            }
        }
    }

    /// Report a failure on the error channel and hand key-scoped records to
    /// the listeners of that key.
    ///
    /// Subscriber failures only go to the channel.
    pub fn report_error(&self, record: ErrorRecord) {
        let listeners = match (&record.resource_key, record.kind) {
            (Some(key), kind) if kind != ErrorKind::Subscriber => self
                .keys()
                .get(key)
                .map(|s| s.listeners.clone())
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        for (_, listener) in &listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_error(&record))).is_err() {
                debug!("on_error callback panicked for {:?}", record.resource_key);
            }
        }
        self.errors.report(record);
    }

    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        let (tracked_keys, listeners) = {
            let keys = self.keys();
            (keys.len(), keys.values().map(|s| s.listeners.len()).sum())
        };
        BrokerStats {
            tracked_keys,
            listeners,
            published: self.counters.published.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            subscriber_failures: self.counters.subscriber_failures.load(Ordering::Relaxed),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::changes::testing::RecordingListener;
    use crate::api::changes::types::ChangeKind;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn versions(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ChangeListener for Recorder {
        fn on_change(&self, n: &ChangeNotification) -> Result<(), SubscriberError> {
            self.seen.lock().unwrap().push(n.version().to_string());
            Ok(())
        }
    }

    struct Failing;

    impl ChangeListener for Failing {
        fn on_change(&self, _: &ChangeNotification) -> Result<(), SubscriberError> {
            Err(SubscriberError::failed("nope"))
        }
    }

    struct Panicking;

    impl ChangeListener for Panicking {
        fn on_change(&self, _: &ChangeNotification) -> Result<(), SubscriberError> {
            panic!("listener exploded");
        }
    }

    fn note(key: &str, version: u64) -> ChangeNotification {
        ChangeNotification::new(ResourceKey::new(key), ChangeKind::Updated, version)
    }

    #[test]
    fn test_duplicates_and_stale_versions_are_discarded() {
        let broker = ChangeBroker::numeric(ErrorChannel::new(8));
        let key = ResourceKey::new("integrations");
        let recorder = Arc::new(Recorder::default());
        broker.attach(&key, SubscriberId::new(), recorder.clone());

        for v in [1, 1, 2, 2, 3, 2] {
            broker.publish(note("integrations", v));
        }

        assert_eq!(recorder.versions(), vec!["1", "2", "3"]);
        assert_eq!(broker.last_version(&key), Some(VersionMarker::from(3)));
        let stats = broker.stats();
        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.discarded, 3);
    }

    #[test]
    fn test_untracked_key_is_dropped() {
        let broker = ChangeBroker::numeric(ErrorChannel::new(8));
        assert_eq!(broker.publish(note("connections", 1)), PublishOutcome::Untracked);
    }

    #[test]
    fn test_failing_and_panicking_listeners_are_isolated() {
        let errors = ErrorChannel::new(8);
        let mut error_rx = errors.subscribe();
        let broker = ChangeBroker::numeric(errors);
        let key = ResourceKey::new("connectors");
        let recorder = Arc::new(Recorder::default());

        broker.attach(&key, SubscriberId::new(), Arc::new(Panicking));
        broker.attach(&key, SubscriberId::new(), Arc::new(Failing));
        broker.attach(&key, SubscriberId::new(), recorder.clone());

        broker.publish(note("connectors", 1));

        assert_eq!(recorder.versions(), vec!["1"]);
        assert_eq!(broker.stats().subscriber_failures, 2);
        let first = error_rx.try_recv().unwrap();
        assert_eq!(first.kind, ErrorKind::Subscriber);
        assert!(first.message.contains("listener exploded"));
    }

    #[test]
    fn test_publish_from_listener_is_queued_behind_current_dispatch() {
        struct Republisher {
            broker: std::sync::Weak<ChangeBroker>,
            log: Arc<Mutex<Vec<String>>>,
        }

        impl ChangeListener for Republisher {
            fn on_change(&self, n: &ChangeNotification) -> Result<(), SubscriberError> {
                self.log.lock().unwrap().push(format!("a{}", n.version()));
                if n.version().as_str() == "1" {
                    if let Some(broker) = self.broker.upgrade() {
                        let outcome = broker.publish(note("extensions", 2));
                        assert_eq!(outcome, PublishOutcome::Queued);
                    }
                }
                Ok(())
            }
        }

        struct Tail(Arc<Mutex<Vec<String>>>);

        impl ChangeListener for Tail {
            fn on_change(&self, n: &ChangeNotification) -> Result<(), SubscriberError> {
                self.0.lock().unwrap().push(format!("b{}", n.version()));
                Ok(())
            }
        }

        let broker = Arc::new(ChangeBroker::numeric(ErrorChannel::new(8)));
        let key = ResourceKey::new("extensions");
        let log = Arc::new(Mutex::new(Vec::new()));
        broker.attach(
            &key,
            SubscriberId::new(),
            Arc::new(Republisher {
                broker: Arc::downgrade(&broker),
                log: log.clone(),
            }),
        );
        broker.attach(&key, SubscriberId::new(), Arc::new(Tail(log.clone())));

        let outcome = broker.publish(note("extensions", 1));

        assert_eq!(outcome, PublishOutcome::Dispatched { accepted: 2, discarded: 0 });
        assert_eq!(*log.lock().unwrap(), vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn test_incomparable_version_is_reported() {
        let errors = ErrorChannel::new(8);
        let mut rx = errors.subscribe();
        let broker = ChangeBroker::numeric(errors);
        let key = ResourceKey::new("virtualizations");
        let listener = Arc::new(RecordingListener::default());
        broker.attach(&key, SubscriberId::new(), listener.clone());

        broker.publish(note("virtualizations", 4));
        broker.publish(ChangeNotification::new(key.clone(), ChangeKind::Updated, "W/\"etag\""));

        assert_eq!(broker.last_version(&key), Some(VersionMarker::from(4)));
        assert_eq!(rx.try_recv().unwrap().kind, ErrorKind::Decode);
        assert_eq!(listener.versions(), vec!["4"]);
        let scoped = listener.errors();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].kind, ErrorKind::Decode);
        assert_eq!(scoped[0].resource_key.as_ref(), Some(&key));
    }

    #[test]
    fn test_concurrent_publishers_never_overlap_or_reorder() {
        #[derive(Default)]
        struct Exclusive {
            busy: AtomicBool,
            overlaps: AtomicU64,
            seen: Mutex<Vec<u64>>,
        }

        impl ChangeListener for Exclusive {
            fn on_change(&self, n: &ChangeNotification) -> Result<(), SubscriberError> {
                if self.busy.swap(true, Ordering::SeqCst) {
                    self.overlaps.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::yield_now();
                self.seen
                    .lock()
                    .unwrap()
                    .push(n.version().as_str().parse().unwrap());
                self.busy.store(false, Ordering::SeqCst);
                Ok(())
            }
        }

        let broker = ChangeBroker::numeric(ErrorChannel::new(8));
        let key = ResourceKey::new("integrations");
        let first = Arc::new(Exclusive::default());
        let second = Arc::new(Exclusive::default());
        broker.attach(&key, SubscriberId::new(), first.clone());
        broker.attach(&key, SubscriberId::new(), second.clone());

        let next = AtomicU64::new(1);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        let version = next.fetch_add(1, Ordering::SeqCst);
                        broker.publish(note("integrations", version));
                    }
                });
            }
        });

        for listener in [&first, &second] {
            assert_eq!(listener.overlaps.load(Ordering::SeqCst), 0);
            let seen = listener.seen.lock().unwrap();
            assert!(!seen.is_empty());
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }
        assert_eq!(*first.seen.lock().unwrap(), *second.seen.lock().unwrap());
        assert_eq!(broker.last_version(&key), Some(VersionMarker::from(1600)));
        let stats = broker.stats();
        assert_eq!(stats.accepted + stats.discarded, 1600);
    }

    #[test]
    fn test_detach_and_untrack() {
        let broker = ChangeBroker::numeric(ErrorChannel::new(8));
        let key = ResourceKey::new("integrations");
        let a = SubscriberId::new();
        let b = SubscriberId::new();
        broker.attach(&key, a, Arc::new(Recorder::default()));
        broker.attach(&key, b, Arc::new(Recorder::default()));

        assert_eq!(broker.detach(&key, a), Some(1));
        assert_eq!(broker.detach(&key, a), None);
        assert_eq!(broker.detach(&key, b), Some(0));
        assert!(broker.untrack(&key));
        assert!(!broker.is_tracked(&key));
        assert_eq!(broker.stats().tracked_keys, 0);
    }

    #[test]
    fn test_report_error_reaches_key_listeners_only() {
        #[derive(Default)]
        struct ErrorSink(Mutex<Vec<ErrorKind>>);

        impl ChangeListener for ErrorSink {
            fn on_change(&self, _: &ChangeNotification) -> Result<(), SubscriberError> {
                Ok(())
            }

            fn on_error(&self, record: &ErrorRecord) {
                self.0.lock().unwrap().push(record.kind);
            }
        }

        let broker = ChangeBroker::numeric(ErrorChannel::new(8));
        let key = ResourceKey::new("connections");
        let other = ResourceKey::new("integrations");
        let sink = Arc::new(ErrorSink::default());
        let other_sink = Arc::new(ErrorSink::default());
        broker.attach(&key, SubscriberId::new(), sink.clone());
        broker.attach(&other, SubscriberId::new(), other_sink.clone());

        broker.report_error(ErrorRecord::new(Some(key.clone()), ErrorKind::Gateway, "503"));
        broker.report_error(ErrorRecord::new(Some(key), ErrorKind::Subscriber, "x"));
        broker.report_error(ErrorRecord::new(None, ErrorKind::Transport, "offline"));

        assert_eq!(*sink.0.lock().unwrap(), vec![ErrorKind::Gateway]);
        assert!(other_sink.0.lock().unwrap().is_empty());
    }
}
