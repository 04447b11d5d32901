//! In-memory lease queue for testing and development.
//!
//! Mirrors the observable behaviour of a storage queue:
//! - Messages stay in insertion order and are leased by hiding them until a
//!   visibility deadline passes
//! - Every lease or lease extension issues a fresh pop receipt and
//!   invalidates the previous one
//! - Time-to-live, initial visibility delay and the per-message size limit
//!   are honoured
//! - Operations on a queue that was never created fail with `QueueNotFound`
//!
//! All time decisions go through the injected [`Clock`], so tests can move
//! time forward without sleeping.

use crate::client::{QueueClient, QueueClientFactory};
use crate::error::QueueError;
use crate::message::{LeaseExtension, LeaseToken, LeasedMessage, MessageId, QueueName, Timestamp};
use crate::time::{Clock, SystemClock};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Largest payload a single queue message may carry
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Most messages a single batched lease may return
pub const MAX_MESSAGES_PER_LEASE: u32 = 32;

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Default)]
struct QueueStorage {
    queues: HashMap<QueueName, VecDeque<StoredMessage>>,
}

struct StoredMessage {
    message_id: MessageId,
    payload: Bytes,
    expires_on: Option<Timestamp>,
    next_visible_on: Timestamp,
    dequeue_count: u32,
    pop_receipt: Option<LeaseToken>,
}

impl StoredMessage {
    fn is_expired(&self, now: &Timestamp) -> bool {
        matches!(self.expires_on, Some(ref expires_on) if now >= expires_on)
    }

    fn is_visible(&self, now: &Timestamp) -> bool {
        now >= &self.next_visible_on
    }

    fn lease(&mut self, now: &Timestamp, lease: Duration) -> LeasedMessage {
        let token = LeaseToken::new(uuid::Uuid::new_v4().to_string());
        self.pop_receipt = Some(token.clone());
        self.next_visible_on = now.add(lease);
        self.dequeue_count += 1;

        LeasedMessage {
            message_id: self.message_id.clone(),
            lease_token: token,
            next_visible_on: self.next_visible_on,
            dequeue_count: self.dequeue_count,
            payload: self.payload.clone(),
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// In-memory queue service shared by all clients it hands out
#[derive(Clone)]
pub struct InMemoryQueueFactory {
    storage: Arc<RwLock<QueueStorage>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryQueueFactory {
    /// Create an empty queue service driven by the wall clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty queue service driven by the given clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            storage: Arc::new(RwLock::new(QueueStorage::default())),
            clock,
        }
    }

    /// Get a concrete client, bypassing the trait object
    pub fn client(&self, queue: &QueueName) -> InMemoryQueueClient {
        InMemoryQueueClient {
            name: queue.clone(),
            storage: Arc::clone(&self.storage),
            clock: Arc::clone(&self.clock),
        }
    }

    /// Number of unexpired messages in a queue, visible or not
    pub fn message_count(&self, queue: &QueueName) -> usize {
        let now = self.clock.now();
        read_storage(&self.storage)
            .ok()
            .and_then(|storage| {
                storage
                    .queues
                    .get(queue)
                    .map(|messages| messages.iter().filter(|m| !m.is_expired(&now)).count())
            })
            .unwrap_or(0)
    }

    /// Number of messages that a lease would currently be able to return
    pub fn visible_count(&self, queue: &QueueName) -> usize {
        let now = self.clock.now();
        read_storage(&self.storage)
            .ok()
            .and_then(|storage| {
                storage.queues.get(queue).map(|messages| {
                    messages
                        .iter()
                        .filter(|m| !m.is_expired(&now) && m.is_visible(&now))
                        .count()
                })
            })
            .unwrap_or(0)
    }
}

impl Default for InMemoryQueueFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueClientFactory for InMemoryQueueFactory {
    fn get_queue(&self, queue: &QueueName) -> Result<Arc<dyn QueueClient>, QueueError> {
        Ok(Arc::new(self.client(queue)))
    }
}

fn read_storage(
    storage: &RwLock<QueueStorage>,
) -> Result<RwLockReadGuard<'_, QueueStorage>, QueueError> {
    storage.read().map_err(|_| poisoned())
}

fn write_storage(
    storage: &RwLock<QueueStorage>,
) -> Result<RwLockWriteGuard<'_, QueueStorage>, QueueError> {
    storage.write().map_err(|_| poisoned())
}

fn poisoned() -> QueueError {
    QueueError::ProviderError {
        provider: "InMemory".to_string(),
        code: "StoragePoisoned".to_string(),
        message: "queue storage lock was poisoned".to_string(),
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client bound to one in-memory queue
pub struct InMemoryQueueClient {
    name: QueueName,
    storage: Arc<RwLock<QueueStorage>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryQueueClient {
    fn with_queue<T>(
        &self,
        f: impl FnOnce(&mut VecDeque<StoredMessage>, Timestamp) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let now = self.clock.now();
        let mut storage = write_storage(&self.storage)?;
        let messages =
            storage
                .queues
                .get_mut(&self.name)
                .ok_or_else(|| QueueError::QueueNotFound {
                    queue_name: self.name.to_string(),
                })?;

        messages.retain(|m| !m.is_expired(&now));
        f(messages, now)
    }

    fn find_leased<'a>(
        messages: &'a mut VecDeque<StoredMessage>,
        message_id: &MessageId,
        lease_token: &LeaseToken,
    ) -> Result<&'a mut StoredMessage, QueueError> {
        messages
            .iter_mut()
            .find(|m| &m.message_id == message_id && m.pop_receipt.as_ref() == Some(lease_token))
            .ok_or_else(|| QueueError::MessageNotFound {
                lease_token: lease_token.to_string(),
            })
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    fn queue_name(&self) -> &QueueName {
        &self.name
    }

    async fn create_if_missing(&self) -> Result<(), QueueError> {
        let mut storage = write_storage(&self.storage)?;
        storage.queues.entry(self.name.clone()).or_default();
        Ok(())
    }

    async fn exists(&self) -> Result<bool, QueueError> {
        Ok(read_storage(&self.storage)?.queues.contains_key(&self.name))
    }

    async fn clear_all(&self) -> Result<(), QueueError> {
        self.with_queue(|messages, _| {
            messages.clear();
            Ok(())
        })
    }

    async fn enqueue(
        &self,
        payload: Bytes,
        time_to_live: Option<Duration>,
        initial_delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(QueueError::MessageTooLarge {
                size: payload.len(),
                max_size: MAX_MESSAGE_SIZE,
            });
        }

        self.with_queue(|messages, now| {
            let message_id = MessageId::new();
            debug!(queue = %self.name, message_id = %message_id, "Enqueued in-memory message");
            messages.push_back(StoredMessage {
                message_id,
                payload,
                expires_on: time_to_live.map(|ttl| now.add(ttl)),
                next_visible_on: now.add(initial_delay.unwrap_or_else(Duration::zero)),
                dequeue_count: 0,
                pop_receipt: None,
            });
            Ok(())
        })
    }

    async fn lease_one(&self, lease: Duration) -> Result<Option<LeasedMessage>, QueueError> {
        self.with_queue(|messages, now| {
            Ok(messages
                .iter_mut()
                .find(|m| m.is_visible(&now))
                .map(|m| m.lease(&now, lease)))
        })
    }

    async fn lease_many(
        &self,
        max_messages: u32,
        lease: Duration,
    ) -> Result<Vec<LeasedMessage>, QueueError> {
        let max = max_messages.clamp(1, MAX_MESSAGES_PER_LEASE) as usize;
        self.with_queue(|messages, now| {
            Ok(messages
                .iter_mut()
                .filter(|m| m.is_visible(&now))
                .take(max)
                .map(|m| m.lease(&now, lease))
                .collect())
        })
    }

    async fn extend_lease(
        &self,
        message_id: &MessageId,
        lease_token: &LeaseToken,
        duration: Duration,
    ) -> Result<LeaseExtension, QueueError> {
        self.with_queue(|messages, now| {
            let message = Self::find_leased(messages, message_id, lease_token)?;
            let token = LeaseToken::new(uuid::Uuid::new_v4().to_string());
            message.pop_receipt = Some(token.clone());
            message.next_visible_on = now.add(duration);

            Ok(LeaseExtension {
                lease_token: token,
                next_visible_on: message.next_visible_on,
            })
        })
    }

    async fn delete(
        &self,
        message_id: &MessageId,
        lease_token: &LeaseToken,
    ) -> Result<(), QueueError> {
        self.with_queue(|messages, _| {
            Self::find_leased(messages, message_id, lease_token)?;
            messages.retain(|m| &m.message_id != message_id);
            Ok(())
        })
    }
}
