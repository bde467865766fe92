/**
 * Poller
 *
 * Periodically fetches every active key through the fetch gateway and
 * publishes a notification when its version changes. Each activation gets a
 * fresh generation so results from an earlier activation are dropped.
 * Keys can also be refetched out of band when the event stream reports that
 * one of their entities changed.
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::broker::ChangeBroker;
use super::config::{ChangeConfig, Suppression};
use super::errors::{ErrorKind, ErrorRecord};
use super::event_stream::StreamHealth;
use super::types::{ChangeKind, ChangeNotification, NotificationSource, ResourceKey, VersionMarker};
use crate::api::gateway::{FetchGateway, GatewayError};
use crate::error::Result;

struct PollEntry {
    generation: u64,
    interval: Duration,
    cancel: CancellationToken,
    last_version: Option<VersionMarker>,
    refreshing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub active_keys: usize,
    pub ticks: u64,
    pub skipped: u64,
    pub fetches: u64,
    pub failures: u64,
    pub stale_results: u64,
    pub refreshes: u64,
}

#[derive(Debug, Default)]
struct PollCounters {
    ticks: AtomicU64,
    skipped: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
    stale_results: AtomicU64,
    refreshes: AtomicU64,
}

struct Inner {
    gateway: Arc<dyn FetchGateway>,
    broker: Arc<ChangeBroker>,
    health: Option<StreamHealth>,
    config: ChangeConfig,
    entries: Mutex<HashMap<ResourceKey, PollEntry>>,
    next_generation: AtomicU64,
    counters: PollCounters,
}

pub struct Poller {
    inner: Arc<Inner>,
    runtime: Handle,
}

impl Poller {
    /// `health` lets the poller stand down while the event stream is fresh.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside of a tokio runtime
    pub fn new(
        gateway: Arc<dyn FetchGateway>,
        broker: Arc<ChangeBroker>,
        config: ChangeConfig,
        health: Option<StreamHealth>,
    ) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                gateway,
                broker,
                health,
                config,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                counters: PollCounters::default(),
            }),
            runtime: Handle::try_current()?,
        })
    }

    /// Begin polling `key`, fetching once immediately. Returns `false` if the
    /// key is already active.
    pub fn activate(&self, key: &ResourceKey, every: Duration) -> bool {
        let mut entries = self.inner.entries();
        if entries.contains_key(key) {
            return false;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        entries.insert(
            key.clone(),
            PollEntry {
                generation,
                interval: every,
                cancel: cancel.clone(),
                last_version: None,
                refreshing: false,
            },
        );
        drop(entries);

        self.runtime
            .spawn(poll_key(self.inner.clone(), key.clone(), generation, every, cancel));
        info!("🔄 Polling {} every {:?} (generation {})", key, every, generation);
        true
    }

    /// Stop polling `key`. A fetch already in flight finishes but its result
    /// is discarded.
    pub fn deactivate(&self, key: &ResourceKey) -> bool {
        match self.inner.entries().remove(key) {
            Some(entry) => {
                entry.cancel.cancel();
                debug!("Stopped polling {} (generation {})", key, entry.generation);
                true
            }
            None => false,
        }
    }

    /// Refetch each requested key right away if it is active. Requests for
    /// a key whose refetch is still in flight are coalesced. Runs until the
    /// sender side closes or the poller is dropped.
    pub fn follow(&self, mut requests: mpsc::UnboundedReceiver<ResourceKey>) {
        let inner = Arc::downgrade(&self.inner);
        self.runtime.spawn(async move {
            while let Some(key) = requests.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.refresh(key);
            }
            trace!("Refresh follower exited");
        });
    }

    #[must_use]
    pub fn is_active(&self, key: &ResourceKey) -> bool {
        self.inner.entries().contains_key(key)
    }

    #[must_use]
    pub fn interval_of(&self, key: &ResourceKey) -> Option<Duration> {
        self.inner.entries().get(key).map(|e| e.interval)
    }

    /// Deactivate every key
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.inner.entries().drain().collect();
        for (_, entry) in &drained {
            entry.cancel.cancel();
        }
        if !drained.is_empty() {
            info!("🔄 Poller stopped {} keys", drained.len());
        }
    }

    #[must_use]
    pub fn stats(&self) -> PollerStats {
        let c = &self.inner.counters;
        PollerStats {
            active_keys: self.inner.entries().len(),
            ticks: c.ticks.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            stale_results: c.stale_results.load(Ordering::Relaxed),
            refreshes: c.refreshes.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<ResourceKey, PollEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The first tick always fetches so a new key gets its initial snapshot
    fn should_skip(&self, tick: u64, key: &ResourceKey) -> bool {
        if tick == 1 {
            return false;
        }
        let fresh = self
            .health
            .as_ref()
            .is_some_and(|h| h.is_fresh(key, self.config.freshness_window));
        if !fresh {
            return false;
        }
        match self.config.suppression {
            Suppression::Skip => true,
            Suppression::Stretch(factor) => tick % u64::from(factor.max(1)) != 0,
        }
    }

    fn refresh(self: Arc<Self>, key: ResourceKey) {
        let generation = {
            let mut entries = self.entries();
            match entries.get_mut(&key) {
                Some(entry) if !entry.refreshing => {
                    entry.refreshing = true;
                    entry.generation
                }
                Some(_) => {
                    trace!("Refresh of {} already in flight", key);
                    return;
                }
                None => {
                    trace!("Refresh requested for inactive {}", key);
                    return;
                }
            }
        };

        self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!("Refreshing {} (generation {})", key, generation);
        tokio::spawn(async move {
            self.poll_once(&key, generation).await;
            if let Some(entry) = self.entries().get_mut(&key) {
                if entry.generation == generation {
                    entry.refreshing = false;
                }
            }
        });
    }

    async fn poll_once(&self, key: &ResourceKey, generation: u64) {
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        let limit = self.config.fetch_timeout;
        let result = timeout(limit, self.gateway.fetch(key))
            .await
            .unwrap_or(Err(GatewayError::Timeout(limit)));

        let kind = {
            let mut entries = self.entries();
            let entry = match entries.get_mut(key) {
                Some(entry) if entry.generation == generation => entry,
                _ => {
                    self.counters.stale_results.fetch_add(1, Ordering::Relaxed);
                    debug!("Discarding result for {} from generation {}", key, generation);
                    return;
                }
            };

            match &result {
                Ok(snapshot) if entry.last_version.as_ref() == Some(&snapshot.version) => None,
                Ok(snapshot) => {
                    let kind = if entry.last_version.is_some() {
                        ChangeKind::Updated
                    } else {
                        ChangeKind::Created
                    };
                    entry.last_version = Some(snapshot.version.clone());
                    Some(kind)
                }
                Err(_) => None,
            }
        };

        match result {
            Ok(snapshot) => match kind {
                Some(kind) => {
                    let notification = ChangeNotification::new(key.clone(), kind, snapshot.version)
                        .with_payload(snapshot.payload)
                        .with_source(NotificationSource::Poller);
                    self.broker.publish(notification);
                }
                None => trace!("{} unchanged", key),
            },
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.broker
                    .report_error(ErrorRecord::new(Some(key.clone()), ErrorKind::Gateway, e.to_string()));
            }
        }
    }
}

async fn poll_key(
    inner: Arc<Inner>,
    key: ResourceKey,
    generation: u64,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tick += 1;
        inner.counters.ticks.fetch_add(1, Ordering::Relaxed);

        if inner.should_skip(tick, &key) {
            inner.counters.skipped.fetch_add(1, Ordering::Relaxed);
            trace!("Event stream is fresh, skipping poll of {}", key);
            continue;
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = inner.poll_once(&key, generation) => {}
        }
    }

    trace!("Poll loop for {} (generation {}) exited", key, generation);
}
