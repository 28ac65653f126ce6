//! System clock adapter.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::domain::Timestamp;
use crate::ports::TimeSource;

/// Production time source: wall clock milliseconds since the Unix epoch.
///
/// # Example
///
/// ```rust
/// use spidercast::adapters::SystemTimeSource;
/// use spidercast::TimeSource;
///
/// let clock = SystemTimeSource::new();
/// assert!(clock.now().as_millis() > 0);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp::from_millis(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}
