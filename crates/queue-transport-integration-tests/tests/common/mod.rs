//! Common test utilities for queue-transport integration tests
//!
//! This module provides:
//! - A recording queue client factory that logs every queue operation
//! - Transport and message builders

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use queue_transport::{
    headers, Clock, Headers, InMemoryQueueFactory, LeaseExtension, LeaseToken, LeasedMessage,
    ManualClock, MessageId, QueueClient, QueueClientFactory, QueueError, QueueName,
    StorageQueueTransport, TransportMessage, TransportOptions,
};
use std::sync::{Arc, Mutex};

// ============================================================================
// Recording Factory
// ============================================================================

/// Queue operation observed by a [`RecordingFactory`]
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Operation {
    Create(String),
    Enqueue(String),
    Lease(String),
    LeaseMany(String),
    Extend(String),
    Delete(String),
    Clear(String),
}

/// In-memory factory whose clients record every operation
#[derive(Clone)]
pub struct RecordingFactory {
    inner: InMemoryQueueFactory,
    operations: Arc<Mutex<Vec<Operation>>>,
}

#[allow(dead_code)]
impl RecordingFactory {
    pub fn new(inner: InMemoryQueueFactory) -> Self {
        Self {
            inner,
            operations: Arc::default(),
        }
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.operations.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Operation) -> bool) -> usize {
        self.operations().iter().filter(|op| matches(op)).count()
    }

    pub fn enqueues_to(&self, queue: &str) -> usize {
        self.count(|op| *op == Operation::Enqueue(queue.to_string()))
    }

    pub fn inner(&self) -> &InMemoryQueueFactory {
        &self.inner
    }
}

impl QueueClientFactory for RecordingFactory {
    fn get_queue(&self, queue: &QueueName) -> Result<Arc<dyn QueueClient>, QueueError> {
        Ok(Arc::new(RecordingClient {
            inner: self.inner.get_queue(queue)?,
            operations: Arc::clone(&self.operations),
        }))
    }
}

struct RecordingClient {
    inner: Arc<dyn QueueClient>,
    operations: Arc<Mutex<Vec<Operation>>>,
}

impl RecordingClient {
    fn record(&self, op: fn(String) -> Operation) {
        let name = self.inner.queue_name().to_string();
        self.operations.lock().unwrap().push(op(name));
    }
}

#[async_trait]
impl QueueClient for RecordingClient {
    fn queue_name(&self) -> &QueueName {
        self.inner.queue_name()
    }

    async fn create_if_missing(&self) -> Result<(), QueueError> {
        self.record(Operation::Create);
        self.inner.create_if_missing().await
    }

    async fn exists(&self) -> Result<bool, QueueError> {
        self.inner.exists().await
    }

    async fn clear_all(&self) -> Result<(), QueueError> {
        self.record(Operation::Clear);
        self.inner.clear_all().await
    }

    async fn enqueue(
        &self,
        payload: Bytes,
        time_to_live: Option<Duration>,
        initial_delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        self.record(Operation::Enqueue);
        self.inner.enqueue(payload, time_to_live, initial_delay).await
    }

    async fn lease_one(&self, lease: Duration) -> Result<Option<LeasedMessage>, QueueError> {
        self.record(Operation::Lease);
        self.inner.lease_one(lease).await
    }

    async fn lease_many(
        &self,
        max_messages: u32,
        lease: Duration,
    ) -> Result<Vec<LeasedMessage>, QueueError> {
        self.record(Operation::LeaseMany);
        self.inner.lease_many(max_messages, lease).await
    }

    async fn extend_lease(
        &self,
        message_id: &MessageId,
        lease_token: &LeaseToken,
        duration: Duration,
    ) -> Result<LeaseExtension, QueueError> {
        self.record(Operation::Extend);
        self.inner.extend_lease(message_id, lease_token, duration).await
    }

    async fn delete(
        &self,
        message_id: &MessageId,
        lease_token: &LeaseToken,
    ) -> Result<(), QueueError> {
        self.record(Operation::Delete);
        self.inner.delete(message_id, lease_token).await
    }
}

// ============================================================================
// Builders
// ============================================================================

#[allow(dead_code)]
pub fn queue(name: &str) -> QueueName {
    name.parse().unwrap()
}

/// Message with the given logical ID, body and extra headers
#[allow(dead_code)]
pub fn message(id: &str, body: &str, extra: &[(&str, String)]) -> TransportMessage {
    let mut hdrs = Headers::new();
    hdrs.insert(headers::MESSAGE_ID.to_string(), id.to_string());
    for (key, value) in extra {
        hdrs.insert(key.to_string(), value.clone());
    }
    TransportMessage::new(hdrs, Bytes::from(body.to_string()))
}

/// Transport, recorder and clock wired to a shared in-memory queue service
#[allow(dead_code)]
pub struct TestBus {
    pub clock: ManualClock,
    pub recorder: RecordingFactory,
    pub transport: StorageQueueTransport,
}

/// Build and initialize a transport on a manually driven clock
#[allow(dead_code)]
pub async fn manual_bus(input: &str, options: TransportOptions) -> TestBus {
    let clock = ManualClock::default();
    let recorder = RecordingFactory::new(InMemoryQueueFactory::with_clock(Arc::new(clock.clone())));
    let transport = StorageQueueTransport::new(Arc::new(recorder.clone()), input, options)
        .unwrap()
        .with_clock(Arc::new(clock.clone()) as Arc<dyn Clock>);
    transport.initialize().await.unwrap();

    TestBus {
        clock,
        recorder,
        transport,
    }
}
