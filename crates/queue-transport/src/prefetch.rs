//! Buffer of messages leased ahead of time.
//!
//! When prefetching is enabled the transport leases a batch of messages in
//! one round-trip and hands them out one at a time. Messages are handed out
//! in the order the service returned them. A buffered message whose lease
//! ran out before it was handed out is dropped; the service has made it
//! visible again and another consumer may already hold it.

use crate::client::QueueClient;
use crate::error::QueueError;
use crate::message::LeasedMessage;
use crate::time::Clock;
use chrono::Duration;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[cfg(test)]
#[path = "prefetch_tests.rs"]
mod tests;

/// FIFO buffer of prefetched leases
pub struct PrefetchBuffer {
    messages: Mutex<VecDeque<LeasedMessage>>,
    refill: tokio::sync::Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl PrefetchBuffer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            refill: tokio::sync::Mutex::new(()),
            clock,
        }
    }

    fn messages(&self) -> MutexGuard<'_, VecDeque<LeasedMessage>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append leased messages in order
    pub fn enqueue(&self, batch: impl IntoIterator<Item = LeasedMessage>) {
        self.messages().extend(batch);
    }

    /// Take the oldest buffered message whose lease is still valid
    pub fn dequeue(&self) -> Option<LeasedMessage> {
        let now = self.clock.now();
        let mut messages = self.messages();

        while let Some(message) = messages.pop_front() {
            if message.next_visible_on > now {
                return Some(message);
            }
            debug!(
                message_id = %message.message_id,
                leased_until = %message.next_visible_on,
                "Discarding prefetched message with expired lease"
            );
        }
        None
    }

    pub fn len(&self) -> usize {
        self.messages().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages().is_empty()
    }

    /// Drop every buffered message
    pub fn clear(&self) {
        self.messages().clear();
    }

    /// Take a buffered message, leasing a new batch of up to `count` first if
    /// the buffer is empty.
    ///
    /// Concurrent callers share one refill: only one of them talks to the
    /// service while the others wait and then read from the refilled buffer.
    pub async fn receive(
        &self,
        queue: &dyn QueueClient,
        count: u32,
        lease: Duration,
    ) -> Result<Option<LeasedMessage>, QueueError> {
        if let Some(message) = self.dequeue() {
            return Ok(Some(message));
        }

        let _refill = self.refill.lock().await;
        if let Some(message) = self.dequeue() {
            return Ok(Some(message));
        }

        let batch = queue.lease_many(count, lease).await?;
        debug!(
            queue = %queue.queue_name(),
            requested = count,
            received = batch.len(),
            "Prefetched messages"
        );

        self.enqueue(batch);
        Ok(self.dequeue())
    }
}
