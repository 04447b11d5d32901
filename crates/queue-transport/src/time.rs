//! Time sources.
//!
//! Deferral delays, lease renewal schedules and the in-memory provider all
//! read "now" through a [`Clock`] so tests can control the passage of time.

use crate::message::Timestamp;
use chrono::Duration;
use std::sync::{Arc, Mutex};

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward (or backward, for negative durations)
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = current.add(by);
    }

    pub fn set(&self, to: Timestamp) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Timestamp::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Convert a std duration into a chrono duration, saturating at one year
pub fn to_chrono(duration: std::time::Duration) -> Duration {
    const MAX_SECONDS: u64 = 365 * 24 * 60 * 60;
    if duration.as_secs() >= MAX_SECONDS {
        return Duration::seconds(MAX_SECONDS as i64);
    }
    Duration::milliseconds(duration.as_millis() as i64)
}

/// Convert a chrono duration into a std duration; negative values become zero
pub fn to_std(duration: Duration) -> std::time::Duration {
    duration.to_std().unwrap_or(std::time::Duration::ZERO)
}

#[cfg(test)]
#[path = "time_tests.rs"]
mod tests;
