use std::cmp::Ordering;
use std::fmt::Debug;

use super::types::VersionMarker;

/// Decides whether one version marker is newer than another.
///
/// Returns `None` when the markers cannot be compared (e.g. a non-numeric
/// marker under [`NumericComparator`]); the broker treats that as a decode
/// failure and drops the notification.
pub trait VersionComparator: Send + Sync + Debug {
    fn compare(&self, a: &VersionMarker, b: &VersionMarker) -> Option<Ordering>;

    fn is_newer(&self, candidate: &VersionMarker, last: &VersionMarker) -> Option<bool> {
        self.compare(candidate, last).map(|o| o == Ordering::Greater)
    }
}

/// Integer markers: sequence numbers, epoch timestamps
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericComparator;

impl VersionComparator for NumericComparator {
    fn compare(&self, a: &VersionMarker, b: &VersionMarker) -> Option<Ordering> {
        let a = a.as_str().trim().parse::<i128>().ok()?;
        let b = b.as_str().trim().parse::<i128>().ok()?;
        Some(a.cmp(&b))
    }
}

/// Byte-wise string order, for zero-padded or ISO-8601 markers
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicographicComparator;

impl VersionComparator for LexicographicComparator {
    fn compare(&self, a: &VersionMarker, b: &VersionMarker) -> Option<Ordering> {
        Some(a.as_str().cmp(b.as_str()))
    }
}

/// Lamport timestamps written as `counter@node`.
///
/// Counters order the markers. Equal counters from different nodes are
/// concurrent and cannot be compared; a bare counter has no node and only
/// equals another bare counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogicalClockComparator;

impl LogicalClockComparator {
    fn parse(marker: &VersionMarker) -> Option<(u64, &str)> {
        let raw = marker.as_str().trim();
        let (counter, node) = raw.split_once('@').unwrap_or((raw, ""));
        Some((counter.parse().ok()?, node))
    }
}

impl VersionComparator for LogicalClockComparator {
    fn compare(&self, a: &VersionMarker, b: &VersionMarker) -> Option<Ordering> {
        let (ca, na) = Self::parse(a)?;
        let (cb, nb) = Self::parse(b)?;
        match ca.cmp(&cb) {
            Ordering::Equal if na != nb => None,
            order => Some(order),
        }
    }
}
