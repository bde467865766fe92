/**
 * Configuration constants for the change broker, poller and event stream client
 */
use std::time::Duration;
use tracing::warn;

/// Default poll interval in milliseconds for a newly activated resource key
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Upper bound for a single fetch gateway call in milliseconds
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;

/// Window during which a connected event stream suppresses polling
pub const DEFAULT_FRESHNESS_WINDOW_MS: u64 = 30_000;

/// Initial reconnect delay in milliseconds
pub const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Maximum reconnect delay in milliseconds
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Reconnect jitter as a fraction of the computed delay (±20%)
pub const BACKOFF_JITTER: f64 = 0.2;

/// Upper bound for opening the event channel in milliseconds
pub const CONNECT_TIMEOUT_MS: u64 = 15_000;

/// A connected channel silent for longer than this is treated as failed
pub const IDLE_TIMEOUT_MS: u64 = 90_000;

/// Channel buffer size for error records
pub const ERROR_CHANNEL_CAPACITY: usize = 256;

/// Channel buffer size for channel-based subscribers
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "SYNDESIS_";

/// What the poller does with a tick while the event stream is fresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    /// Skip the tick entirely
    Skip,
    /// Only fetch every n-th tick
    Stretch(u32),
}

/// Configuration for the change-notification layer
#[derive(Debug, Clone)]
pub struct ChangeConfig {
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub freshness_window: Duration,
    pub suppression: Suppression,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_jitter: f64,
    pub connect_timeout: Duration,
    /// `None` disables the idle check
    pub idle_timeout: Option<Duration>,
    pub error_channel_capacity: usize,
    pub subscriber_channel_capacity: usize,
}

impl Default for ChangeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            fetch_timeout: Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS),
            freshness_window: Duration::from_millis(DEFAULT_FRESHNESS_WINDOW_MS),
            suppression: Suppression::Skip,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            backoff_jitter: BACKOFF_JITTER,
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            idle_timeout: Some(Duration::from_millis(IDLE_TIMEOUT_MS)),
            error_channel_capacity: ERROR_CHANNEL_CAPACITY,
            subscriber_channel_capacity: SUBSCRIBER_CHANNEL_CAPACITY,
        }
    }
}

impl ChangeConfig {
    /// Build a config from defaults overridden by `SYNDESIS_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`ChangeConfig::from_env`] with a custom variable source
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let millis = |name: &str| -> Option<Duration> {
            let var = format!("{ENV_PREFIX}{name}");
            let raw = lookup(&var)?;
            match raw.trim().parse::<u64>() {
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(e) => {
                    warn!("Ignoring {var}={raw}: {e}");
                    None
                }
            }
        };

        if let Some(d) = millis("POLL_INTERVAL_MS") {
            config.poll_interval = d;
        }
        if let Some(d) = millis("FETCH_TIMEOUT_MS") {
            config.fetch_timeout = d;
        }
        if let Some(d) = millis("FRESHNESS_WINDOW_MS") {
            config.freshness_window = d;
        }
        if let Some(d) = millis("INITIAL_BACKOFF_MS") {
            config.initial_backoff = d;
        }
        if let Some(d) = millis("MAX_BACKOFF_MS") {
            config.max_backoff = d;
        }
        if let Some(d) = millis("CONNECT_TIMEOUT_MS") {
            config.connect_timeout = d;
        }
        if let Some(d) = millis("IDLE_TIMEOUT_MS") {
            config.idle_timeout = (!d.is_zero()).then_some(d);
        }

        config.validated()
    }

    /// Clamp values that would stall timers or panic inside tokio
    #[must_use]
    pub fn validated(mut self) -> Self {
        let floor = Duration::from_millis(1);
        if self.poll_interval < floor {
            warn!("poll_interval too small, using {floor:?}");
            self.poll_interval = floor;
        }
        if self.initial_backoff < floor {
            self.initial_backoff = floor;
        }
        if self.max_backoff < self.initial_backoff {
            self.max_backoff = self.initial_backoff;
        }
        self.backoff_jitter = self.backoff_jitter.clamp(0.0, 1.0);
        self.error_channel_capacity = self.error_channel_capacity.max(1);
        self.subscriber_channel_capacity = self.subscriber_channel_capacity.max(1);
        if let Suppression::Stretch(0) = self.suppression {
            self.suppression = Suppression::Stretch(1);
        }
        self
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(DEFAULT_POLL_INTERVAL_MS > 0, "DEFAULT_POLL_INTERVAL_MS must be greater than 0");
    assert!(DEFAULT_FETCH_TIMEOUT_MS > 0, "DEFAULT_FETCH_TIMEOUT_MS must be greater than 0");
    assert!(INITIAL_BACKOFF_MS > 0, "INITIAL_BACKOFF_MS must be greater than 0");
    assert!(MAX_BACKOFF_MS >= INITIAL_BACKOFF_MS, "MAX_BACKOFF_MS must not be below INITIAL_BACKOFF_MS");
    assert!(CONNECT_TIMEOUT_MS > 0, "CONNECT_TIMEOUT_MS must be greater than 0");
    assert!(ERROR_CHANNEL_CAPACITY > 0, "ERROR_CHANNEL_CAPACITY must be greater than 0");
    assert!(SUBSCRIBER_CHANNEL_CAPACITY > 0, "SUBSCRIBER_CHANNEL_CAPACITY must be greater than 0");
};
