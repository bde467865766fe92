use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::errors::DecodeError;

/// Identifies a logical resource collection or a single resource,
/// e.g. `integrations` or `connection:abc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ResourceKey(Arc<str>);

impl ResourceKey {
    #[must_use]
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the first `:`
    #[must_use]
    pub fn collection(&self) -> &str {
        self.0.split_once(':').map_or(&self.0, |(collection, _)| collection)
    }

    /// The part after the first `:`, if any
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.0.split_once(':').map(|(_, id)| id)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ResourceKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

/// Opaque revision token. Ordering is decided by a
/// [`VersionComparator`](super::version::VersionComparator), not by this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct VersionMarker(String);

impl VersionMarker {
    #[must_use]
    pub fn new(marker: impl Into<String>) -> Self {
        Self(marker.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for VersionMarker {
    fn from(version: u64) -> Self {
        Self(version.to_string())
    }
}

impl From<&str> for VersionMarker {
    fn from(marker: &str) -> Self {
        Self(marker.to_string())
    }
}

impl From<String> for VersionMarker {
    fn from(marker: String) -> Self {
        Self(marker)
    }
}

/// Full state of a resource at a given version, as returned by a fetch
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub key: ResourceKey,
    pub version: VersionMarker,
    pub payload: Arc<Value>,
}

impl Snapshot {
    #[must_use]
    pub fn new(key: ResourceKey, version: VersionMarker, payload: Value) -> Self {
        Self {
            key,
            version,
            payload: Arc::new(payload),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "deleted" => Ok(Self::Deleted),
            other => Err(DecodeError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a notification came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationSource {
    EventStream,
    Poller,
    Direct,
}

/// A create/update/delete transition for one resource key.
///
/// Immutable once built; cloning shares the payload.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeNotification {
    key: ResourceKey,
    kind: ChangeKind,
    version: VersionMarker,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Arc<Value>>,
    source: NotificationSource,
}

impl ChangeNotification {
    #[must_use]
    pub fn new(key: ResourceKey, kind: ChangeKind, version: impl Into<VersionMarker>) -> Self {
        Self {
            key,
            kind,
            version: version.into(),
            payload: None,
            source: NotificationSource::Direct,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Arc<Value>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    #[must_use]
    pub const fn with_source(mut self, source: NotificationSource) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub const fn key(&self) -> &ResourceKey {
        &self.key
    }

    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        self.kind
    }

    #[must_use]
    pub const fn version(&self) -> &VersionMarker {
        &self.version
    }

    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_deref()
    }

    #[must_use]
    pub const fn source(&self) -> NotificationSource {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key_parts() {
        let key = ResourceKey::new("connection:abc:def");
        assert_eq!(key.collection(), "connection");
        assert_eq!(key.id(), Some("abc:def"));

        let key = ResourceKey::from("integrations");
        assert_eq!(key.collection(), "integrations");
        assert_eq!(key.id(), None);
    }

    #[test]
    fn test_change_kind_parsing() {
        assert_eq!("created".parse::<ChangeKind>().ok(), Some(ChangeKind::Created));
        assert_eq!("deleted".parse::<ChangeKind>().ok(), Some(ChangeKind::Deleted));
        assert!(matches!(
            "renamed".parse::<ChangeKind>(),
            Err(DecodeError::UnknownKind(kind)) if kind == "renamed"
        ));
    }

    #[test]
    fn test_notification_serializes_for_output() {
        let n = ChangeNotification::new("integrations".into(), ChangeKind::Updated, 7)
            .with_payload(serde_json::json!({"items": []}))
            .with_source(NotificationSource::Poller);
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["key"], "integrations");
        assert_eq!(json["kind"], "updated");
        assert_eq!(json["version"], "7");
        assert_eq!(json["source"], "poller");
    }
}
