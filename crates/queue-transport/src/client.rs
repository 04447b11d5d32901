//! Queue client capability consumed by the transport.
//!
//! The transport never talks to a queue service directly. It resolves a
//! [`QueueClient`] per queue name through a [`QueueClientFactory`] and uses
//! only the lease-oriented operations declared here, which makes any
//! lease-based queue service (or the in-memory provider) a valid backend.

use crate::error::QueueError;
use crate::message::{LeaseExtension, LeaseToken, LeasedMessage, MessageId, QueueName};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use std::sync::Arc;

/// Operations on a single lease-based queue
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Name of the queue this client is bound to
    fn queue_name(&self) -> &QueueName;

    /// Create the queue unless it already exists
    async fn create_if_missing(&self) -> Result<(), QueueError>;

    /// Check whether the queue exists
    async fn exists(&self) -> Result<bool, QueueError>;

    /// Delete every message currently in the queue
    async fn clear_all(&self) -> Result<(), QueueError>;

    /// Add a message to the queue.
    ///
    /// `time_to_live` bounds how long the message may stay in the queue;
    /// `initial_delay` keeps it invisible to consumers for the given time.
    async fn enqueue(
        &self,
        payload: Bytes,
        time_to_live: Option<Duration>,
        initial_delay: Option<Duration>,
    ) -> Result<(), QueueError>;

    /// Lease the next visible message, hiding it from others for `lease`
    async fn lease_one(&self, lease: Duration) -> Result<Option<LeasedMessage>, QueueError>;

    /// Lease up to `max_messages` visible messages
    async fn lease_many(
        &self,
        max_messages: u32,
        lease: Duration,
    ) -> Result<Vec<LeasedMessage>, QueueError>;

    /// Extend (or, with a zero duration, release) the lease on a message.
    ///
    /// On success the old lease token is no longer valid.
    async fn extend_lease(
        &self,
        message_id: &MessageId,
        lease_token: &LeaseToken,
        duration: Duration,
    ) -> Result<LeaseExtension, QueueError>;

    /// Permanently delete a leased message
    async fn delete(&self, message_id: &MessageId, lease_token: &LeaseToken)
        -> Result<(), QueueError>;
}

/// Resolves queue clients by name
pub trait QueueClientFactory: Send + Sync {
    /// Get a client bound to the given queue
    fn get_queue(&self, queue: &QueueName) -> Result<Arc<dyn QueueClient>, QueueError>;
}
