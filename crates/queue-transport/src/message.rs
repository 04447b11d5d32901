//! Message types for transport operations including core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::OnceLock;

/// Header map carried by every transport message
pub type Headers = HashMap<String, String>;

/// Well-known header keys understood by the transport.
///
/// Values are shared with other bus implementations so that messages can be
/// exchanged across them.
pub mod headers {
    /// Logical identifier of the message
    pub const MESSAGE_ID: &str = "rbs2-msg-id";

    /// Real destination of a message routed through the deferred address
    pub const DEFERRED_RECIPIENT: &str = "rbs2-deferred-recipient";

    /// Instant (RFC 3339) before which a deferred message must not be delivered
    pub const DEFERRED_UNTIL: &str = "rbs2-deferred-until";

    /// Time-to-live of the message, in `[-][d.]hh:mm:ss[.fffffff]` format
    pub const TIME_TO_BE_RECEIVED: &str = "rbs2-time-to-be-received";
}

// ============================================================================
// Core Domain Identifiers
// ============================================================================

fn queue_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new("^[a-z0-9][a-z0-9-]{1,61}[a-z0-9]$").expect("queue name pattern is valid")
    })
}

/// Validated storage queue name.
///
/// Names are 3-63 characters long, contain only lowercase ASCII letters,
/// digits and hyphens, start and end with a letter or digit, and never
/// contain two consecutive hyphens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.len() < 3 || name.len() > 63 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: format!(
                    "'{}' must be between 3 and 63 characters long (was {})",
                    name,
                    name.len()
                ),
            });
        }

        if !queue_name_pattern().is_match(&name) {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: format!(
                    "'{}' may only contain lowercase letters, digits and hyphens, \
                     and must start and end with a letter or digit",
                    name
                ),
            });
        }

        if name.contains("--") {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: format!("'{}' must not contain consecutive hyphens", name),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for QueueName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

/// Identifier assigned to a message by the queue service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque token proving ownership of a message lease ("pop receipt").
///
/// Every successful lease extension issues a new token and invalidates the
/// previous one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Timestamp shifted by the given duration
    pub fn add(&self, duration: Duration) -> Self {
        Self(self.0 + duration)
    }

    /// Signed duration from `earlier` to this timestamp
    pub fn duration_since(&self, earlier: &Timestamp) -> Duration {
        self.0 - earlier.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = DateTime::parse_from_rfc3339(s)?;
        Ok(Self::from_datetime(dt.with_timezone(&Utc)))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// Message exchanged between the bus and the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    headers: Headers,
    body: Bytes,
}

impl TransportMessage {
    pub fn new(headers: Headers, body: Bytes) -> Self {
        Self { headers, body }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Value of the message-ID header, if present
    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_ID).map(String::as_str)
    }

    /// Split the message into its headers and body
    pub fn into_parts(self) -> (Headers, Bytes) {
        (self.headers, self.body)
    }
}

/// A message leased from a queue, invisible to other consumers until
/// `next_visible_on` unless deleted first
#[derive(Debug, Clone)]
pub struct LeasedMessage {
    pub message_id: MessageId,
    pub lease_token: LeaseToken,
    pub next_visible_on: Timestamp,
    pub dequeue_count: u32,
    pub payload: Bytes,
}

/// Result of extending (or releasing) a lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseExtension {
    pub lease_token: LeaseToken,
    pub next_visible_on: Timestamp,
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
