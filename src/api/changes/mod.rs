pub mod backoff;
pub mod broker;
pub mod config;
pub mod errors;
pub mod event_stream;
pub mod poller;
pub mod registry;
pub mod sse;
pub mod testing;
pub mod types;
pub mod version;

pub use broker::{BrokerStats, ChangeBroker, ChangeListener, PublishOutcome, SubscriberId};
pub use config::{ChangeConfig, Suppression};
pub use errors::{DecodeError, ErrorChannel, ErrorKind, ErrorRecord, SubscriberError, TransportError};
pub use event_stream::{EventEndpoint, EventStreamClient, EventTransport, SseTransport, StreamHealth, StreamState, StreamStats};
pub use poller::{Poller, PollerStats};
pub use registry::{Disposer, FnListener, RegistryBuilder, RegistryStats, SubscriberRegistry};
pub use types::{ChangeKind, ChangeNotification, NotificationSource, ResourceKey, Snapshot, VersionMarker};
pub use version::{LexicographicComparator, LogicalClockComparator, NumericComparator, VersionComparator};
