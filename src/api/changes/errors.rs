/**
 * Error taxonomy of the change layer and the side channel that reports it.
 *
 * Nothing reported here is fatal: every record describes a failure that was
 * contained locally (reconnect, dropped frame, isolated callback, next tick).
 */
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

use super::types::ResourceKey;

/// Failure of the push channel. Always recovered by reconnecting.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),
    #[error("channel read failed: {0}")]
    Read(String),
    #[error("no data received for {0:?}")]
    Idle(std::time::Duration),
    #[error("server closed the channel")]
    Closed,
    #[error("unexpected status {0}")]
    Status(u16),
}

/// A single server payload that could not be turned into notifications
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown change kind `{0}`")]
    UnknownKind(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not valid utf-8")]
    Utf8,
    #[error("incomparable version marker `{0}`")]
    Version(String),
}

/// Raised by a subscriber callback, or synthesized when a callback panics
#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("{0}")]
    Failed(String),
    #[error("callback panicked: {0}")]
    Panicked(String),
    #[error("subscriber channel is full")]
    Lagging,
    #[error("subscriber channel is closed")]
    Closed,
}

impl SubscriberError {
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Transport,
    Decode,
    Subscriber,
    Gateway,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::Decode => "decode",
            Self::Subscriber => "subscriber",
            Self::Gateway => "gateway",
        };
        f.write_str(name)
    }
}

/// One entry on the error-notification channel
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub resource_key: Option<ResourceKey>,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    #[must_use]
    pub fn new(resource_key: Option<ResourceKey>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            resource_key,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Broadcast side stream of [`ErrorRecord`]s.
///
/// Reporting never blocks and never fails; records are dropped when nobody
/// listens.
#[derive(Debug, Clone)]
pub struct ErrorChannel {
    sender: broadcast::Sender<ErrorRecord>,
}

impl ErrorChannel {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn report(&self, record: ErrorRecord) {
        match &record.resource_key {
            Some(key) => warn!("{} error on {}: {}", record.kind, key, record.message),
            None => warn!("{} error: {}", record.kind, record.message),
        }
        let _ = self.sender.send(record);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorRecord> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_report_reaches_listeners() {
        let channel = ErrorChannel::new(8);
        let mut rx = channel.subscribe();

        channel.report(ErrorRecord::new(
            Some(ResourceKey::new("connections")),
            ErrorKind::Gateway,
            "boom",
        ));

        let record = rx.recv().await.unwrap();
        assert_eq!(record.kind, ErrorKind::Gateway);
        assert_eq!(record.resource_key.as_ref().map(ResourceKey::as_str), Some("connections"));
        assert_eq!(record.message, "boom");
    }

    #[test]
    fn test_report_without_listeners_is_silent() {
        let channel = ErrorChannel::new(1);
        assert_eq!(channel.receiver_count(), 0);
        channel.report(ErrorRecord::new(None, ErrorKind::Transport, "offline"));
    }
}
