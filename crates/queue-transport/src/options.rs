//! Transport configuration.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on the prefetch count (service limit for a batched lease)
pub const MAX_PREFETCH_COUNT: u32 = 32;

/// Options controlling how the transport uses the queue service.
///
/// Durations are (de)serialized as whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Deliver deferred messages by enqueueing them invisible until due,
    /// instead of leaving them to an external deferred-delivery mechanism
    pub use_native_deferred_messages: bool,

    /// Number of messages to lease per round-trip; `None` or `Some(0)` disables prefetching
    pub prefetch_count: Option<u32>,

    /// Lease duration of a freshly received message
    #[serde(with = "duration_seconds")]
    pub initial_visibility_delay: Duration,

    /// Create queues on initialization and on explicit request
    pub automatically_create_queues: bool,

    /// Keep extending the lease of messages still being handled
    pub automatic_lease_renewal_enabled: bool,

    /// How often the renewal loop looks for leases that are due
    #[serde(with = "duration_seconds")]
    pub lease_renewal_interval: Duration,

    /// Lease duration requested on each renewal
    #[serde(with = "duration_seconds")]
    pub lease_renewal_duration: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            use_native_deferred_messages: true,
            prefetch_count: None,
            initial_visibility_delay: Duration::from_secs(5 * 60),
            automatically_create_queues: true,
            automatic_lease_renewal_enabled: false,
            lease_renewal_interval: Duration::from_secs(10),
            lease_renewal_duration: Duration::from_secs(5 * 60),
        }
    }
}

impl TransportOptions {
    /// Check option values for consistency
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let Some(count) = self.prefetch_count {
            if count > MAX_PREFETCH_COUNT {
                return Err(ConfigurationError::Invalid {
                    message: format!(
                        "prefetch_count must be between 0 and {} (was {})",
                        MAX_PREFETCH_COUNT, count
                    ),
                });
            }
        }

        if self.initial_visibility_delay.is_zero() {
            return Err(ConfigurationError::Invalid {
                message: "initial_visibility_delay must be greater than zero".to_string(),
            });
        }

        if self.automatic_lease_renewal_enabled {
            if self.lease_renewal_interval.is_zero() {
                return Err(ConfigurationError::Invalid {
                    message: "lease_renewal_interval must be greater than zero".to_string(),
                });
            }
            if self.lease_renewal_duration.is_zero() {
                return Err(ConfigurationError::Invalid {
                    message: "lease_renewal_duration must be greater than zero".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Effective prefetch count, if prefetching is enabled
    pub fn prefetch(&self) -> Option<u32> {
        self.prefetch_count.filter(|count| *count > 0)
    }
}

mod duration_seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
#[path = "options_tests.rs"]
mod tests;
