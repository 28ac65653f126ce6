use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Milliseconds on the node's clock.
///
/// Only differences between timestamps are meaningful; the origin is whatever
/// the `TimeSource` chooses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a timestamp from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds value.
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Timestamp `delay` after this one.
    pub fn after(&self, delay: Duration) -> Self {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// Time elapsed since `earlier`; zero if `earlier` is in the future.
    pub fn since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// Whether `timeout` has elapsed between `start` and this timestamp.
    pub fn has_elapsed(&self, start: Timestamp, timeout: Duration) -> bool {
        self.since(start) >= timeout
    }
}

/// Transport-level connection handle.
///
/// Allocated by the `Transport` port; one connection may carry several logical
/// links to the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Kind of overlay link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LinkType {
    /// Ring link to the successor (or from a predecessor).
    Successor,
    /// Random mesh link.
    Random,
    /// Structured overlay link.
    Structured,
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkType::Successor => "successor",
            LinkType::Random => "random",
            LinkType::Structured => "structured",
        };
        f.write_str(name)
    }
}
