use std::time::{SystemTime, UNIX_EPOCH};

use crate::CoreError;

/// Milliseconds since the Unix epoch, as stored in `created_at` / `updated_at`.
pub type Timestamp = i64;

/// Returns the current wall-clock time as milliseconds since Unix epoch.
pub fn physical_now() -> Result<Timestamp, CoreError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .map_err(|_| CoreError::InvalidData("system clock before epoch".into()))
}

/// A clock that hands out strictly increasing millisecond timestamps.
///
/// Two local edits issued within the same millisecond still get distinct,
/// ordered `updated_at` values, so last-write-wins comparisons against
/// remote events stay meaningful.
#[derive(Debug, Default)]
pub struct LocalClock {
    last: Timestamp,
}

impl LocalClock {
    pub fn new() -> Self {
        Self { last: 0 }
    }

    /// Generate the next timestamp, never less than wall time.
    pub fn tick(&mut self) -> Result<Timestamp, CoreError> {
        let now = physical_now()?;
        let next = if now > self.last { now } else { self.last + 1 };
        self.last = next;
        Ok(next)
    }

    /// Fold in a timestamp observed elsewhere so later ticks sort after it.
    pub fn observe(&mut self, seen: Timestamp) {
        if seen > self.last {
            self.last = seen;
        }
    }

    pub fn last(&self) -> Timestamp {
        self.last
    }
}
