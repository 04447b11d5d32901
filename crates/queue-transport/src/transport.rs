//! Storage queue transport.
//!
//! Outgoing messages are buffered per transaction and enqueued when the
//! transaction commits, grouped by destination. Incoming messages are leased
//! from the input queue (optionally in prefetched batches); completing the
//! receiving transaction deletes the message, rolling it back makes it
//! visible again right away.
//!
//! ```text
//! send ──▶ route ──▶ transaction buffer ──(commit)──▶ enqueue per destination
//! receive ◀── prefetch buffer / lease_one ◀── input queue
//!    └─ ack: delete    nack: release lease    renewal loop: extend lease
//! ```

use crate::client::{QueueClient, QueueClientFactory};
use crate::codec;
use crate::deferred::{self, OutgoingEnvelope};
use crate::error::{QueueError, TransportError};
use crate::message::{LeasedMessage, QueueName, TransportMessage};
use crate::options::TransportOptions;
use crate::prefetch::PrefetchBuffer;
use crate::renewal::{LeaseRenewer, RenewalTable};
use crate::time::{to_chrono, Clock, SystemClock};
use crate::transaction::TransactionContext;
use async_trait::async_trait;
use chrono::Duration;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;

/// Transaction item holding the messages sent in the transaction
const OUTGOING_MESSAGES_KEY: &str = "storage-queue-transport:outgoing-messages";

type OutgoingBuffer = Arc<Mutex<Vec<OutgoingEnvelope>>>;

/// Message transport used by a message bus
#[async_trait]
pub trait Transport: Send + Sync {
    /// Input queue of this transport; `None` for a one-way client
    fn address(&self) -> Option<&QueueName>;

    /// Make sure the queue with the given name exists
    async fn create_queue(&self, address: &str) -> Result<(), TransportError>;

    /// Send a message as part of a transaction; it is enqueued on commit
    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        context: &TransactionContext,
    ) -> Result<(), TransportError>;

    /// Receive the next message from the input queue, if any
    async fn receive(
        &self,
        context: &TransactionContext,
        cancel: &CancellationToken,
    ) -> Result<Option<TransportMessage>, TransportError>;
}

/// Enqueues the messages of a committed transaction
#[derive(Clone)]
struct Dispatcher {
    factory: Arc<dyn QueueClientFactory>,
    clock: Arc<dyn Clock>,
    native_deferral: bool,
}

impl Dispatcher {
    async fn flush(self, envelopes: Vec<OutgoingEnvelope>) -> Result<(), TransportError> {
        let mut by_destination: BTreeMap<QueueName, Vec<TransportMessage>> = BTreeMap::new();
        for envelope in envelopes {
            by_destination
                .entry(envelope.destination)
                .or_default()
                .push(envelope.message);
        }

        let results = join_all(
            by_destination
                .into_iter()
                .map(|(destination, messages)| self.send_to(destination, messages)),
        )
        .await;

        let mut first_error = None;
        for err in results.into_iter().flatten() {
            error!(error = %err, "Failed to send message");
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn send_to(
        &self,
        destination: QueueName,
        messages: Vec<TransportMessage>,
    ) -> Vec<TransportError> {
        let queue = match self.factory.get_queue(&destination) {
            Ok(queue) => queue,
            Err(source) => {
                let message_id = messages
                    .first()
                    .and_then(TransportMessage::message_id)
                    .unwrap_or("<unknown>")
                    .to_string();
                return vec![TransportError::SendFailed {
                    message_id,
                    destination: destination.to_string(),
                    source,
                }];
            }
        };

        join_all(
            messages
                .into_iter()
                .map(|message| self.send_one(queue.as_ref(), &destination, message)),
        )
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect()
    }

    async fn send_one(
        &self,
        queue: &dyn QueueClient,
        destination: &QueueName,
        message: TransportMessage,
    ) -> Result<(), TransportError> {
        let message_id = message.message_id().unwrap_or("<unknown>").to_string();
        let (mut hdrs, body) = message.into_parts();

        let time_to_live = deferred::time_to_live(&hdrs)?;
        let delay = deferred::visibility_delay(&mut hdrs, self.native_deferral, self.clock.now())?;
        let payload = codec::encode(&TransportMessage::new(hdrs, body))?;

        queue
            .enqueue(payload, time_to_live, delay)
            .await
            .map_err(|source| TransportError::SendFailed {
                message_id: message_id.clone(),
                destination: destination.to_string(),
                source,
            })?;

        debug!(
            queue = %destination,
            message_id = %message_id,
            delay_ms = delay.map(|d| d.num_milliseconds()),
            "Sent message"
        );
        Ok(())
    }
}

/// [`Transport`] on top of a lease-based storage queue service
pub struct StorageQueueTransport {
    factory: Arc<dyn QueueClientFactory>,
    address: Option<QueueName>,
    options: TransportOptions,
    clock: Arc<dyn Clock>,
    renewals: RenewalTable,
    prefetch: PrefetchBuffer,
    cancel: CancellationToken,
    renewer: tokio::sync::Mutex<Option<LeaseRenewer>>,
}

impl StorageQueueTransport {
    /// Create a transport receiving from `input_queue`
    pub fn new(
        factory: Arc<dyn QueueClientFactory>,
        input_queue: &str,
        options: TransportOptions,
    ) -> Result<Self, TransportError> {
        let address: QueueName = input_queue.parse()?;
        Self::build(factory, Some(address), options)
    }

    /// Create a send-only transport
    pub fn one_way(
        factory: Arc<dyn QueueClientFactory>,
        options: TransportOptions,
    ) -> Result<Self, TransportError> {
        Self::build(factory, None, options)
    }

    fn build(
        factory: Arc<dyn QueueClientFactory>,
        address: Option<QueueName>,
        options: TransportOptions,
    ) -> Result<Self, TransportError> {
        options.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        Ok(Self {
            factory,
            address,
            renewals: RenewalTable::new(
                Arc::clone(&clock),
                to_chrono(options.lease_renewal_duration),
            ),
            prefetch: PrefetchBuffer::new(Arc::clone(&clock)),
            options,
            clock,
            cancel: CancellationToken::new(),
            renewer: tokio::sync::Mutex::new(None),
        })
    }

    /// Replace the time source (before the transport is initialized)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.renewals = RenewalTable::new(
            Arc::clone(&clock),
            to_chrono(self.options.lease_renewal_duration),
        );
        self.prefetch = PrefetchBuffer::new(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Number of received messages whose leases are being renewed
    pub fn tracked_leases(&self) -> usize {
        self.renewals.len()
    }

    /// Create the input queue and start lease renewal, as configured
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), TransportError> {
        let Some(address) = &self.address else {
            info!("Initializing one-way storage queue transport");
            return Ok(());
        };

        info!(queue = %address, "Initializing storage queue transport");
        self.create_queue(address.as_str()).await?;

        if self.options.automatic_lease_renewal_enabled {
            let mut renewer = self.renewer.lock().await;
            if renewer.is_none() {
                debug!(
                    interval_ms = self.options.lease_renewal_interval.as_millis() as u64,
                    "Starting lease renewal loop"
                );
                *renewer = Some(LeaseRenewer::start(
                    self.renewals.clone(),
                    self.options.lease_renewal_interval,
                    self.cancel.child_token(),
                ));
            }
        }

        Ok(())
    }

    /// Delete every message in the input queue
    pub async fn purge_input_queue(&self) -> Result<(), TransportError> {
        let address = self.address.as_ref().ok_or(TransportError::OneWayClient)?;
        let purge_failed = |source: QueueError| TransportError::PurgeFailed {
            queue_name: address.to_string(),
            source,
        };

        let queue = self.factory.get_queue(address).map_err(purge_failed)?;
        if !queue.exists().await.map_err(purge_failed)? {
            debug!(queue = %address, "Input queue does not exist; nothing to purge");
            return Ok(());
        }

        queue.clear_all().await.map_err(purge_failed)?;
        self.prefetch.clear();
        info!(queue = %address, "Purged input queue");
        Ok(())
    }

    /// Stop lease renewal
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(renewer) = self.renewer.lock().await.take() {
            renewer.stop().await;
        }
        info!(queue = ?self.address, "Storage queue transport shut down");
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            factory: Arc::clone(&self.factory),
            clock: Arc::clone(&self.clock),
            native_deferral: self.options.use_native_deferred_messages,
        }
    }

    async fn lease_next(
        &self,
        queue: &dyn QueueClient,
        lease: Duration,
    ) -> Result<Option<LeasedMessage>, QueueError> {
        match self.options.prefetch() {
            Some(count) => self.prefetch.receive(queue, count, lease).await,
            None => queue.lease_one(lease).await,
        }
    }

    fn register_completion(
        &self,
        context: &TransactionContext,
        queue: Arc<dyn QueueClient>,
        leased: &LeasedMessage,
    ) {
        {
            let renewals = self.renewals.clone();
            let queue = Arc::clone(&queue);
            let message_id = leased.message_id.clone();
            let token = leased.lease_token.clone();
            context.on_ack(move || async move {
                let token = renewals.retire(&message_id).await.unwrap_or(token);
                queue.delete(&message_id, &token).await.map_err(|source| {
                    TransportError::DeleteFailed {
                        message_id: message_id.to_string(),
                        lease_token: token.to_string(),
                        source,
                    }
                })?;
                debug!(queue = %queue.queue_name(), message_id = %message_id, "Deleted message");
                Ok(())
            });
        }

        {
            let renewals = self.renewals.clone();
            let message_id = leased.message_id.clone();
            let token = leased.lease_token.clone();
            context.on_nack(move || async move {
                let token = renewals.retire(&message_id).await.unwrap_or(token);
                match queue.extend_lease(&message_id, &token, Duration::zero()).await {
                    Ok(_) => debug!(
                        queue = %queue.queue_name(),
                        message_id = %message_id,
                        "Returned message to queue"
                    ),
                    Err(e) => warn!(
                        queue = %queue.queue_name(),
                        message_id = %message_id,
                        error = %e,
                        "Could not return message to queue; it becomes visible when its lease expires"
                    ),
                }
                Ok(())
            });
        }

        let renewals = self.renewals.clone();
        let message_id = leased.message_id.clone();
        context.on_disposed(move || renewals.forget(&message_id));
    }
}

#[async_trait]
impl Transport for StorageQueueTransport {
    fn address(&self) -> Option<&QueueName> {
        self.address.as_ref()
    }

    async fn create_queue(&self, address: &str) -> Result<(), TransportError> {
        let queue_name: QueueName = address.parse()?;

        if !self.options.automatically_create_queues {
            info!(
                queue = %queue_name,
                "Automatic queue creation is disabled; not creating queue"
            );
            return Ok(());
        }

        let create_failed = |source: QueueError| TransportError::CreateFailed {
            queue_name: queue_name.to_string(),
            source,
        };

        let queue = self.factory.get_queue(&queue_name).map_err(create_failed)?;
        queue.create_if_missing().await.map_err(create_failed)?;
        debug!(queue = %queue_name, "Ensured queue exists");
        Ok(())
    }

    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        context: &TransactionContext,
    ) -> Result<(), TransportError> {
        let envelope = deferred::route(destination, message)?;

        let outgoing = context.get_or_add(OUTGOING_MESSAGES_KEY, || {
            let buffer = OutgoingBuffer::default();
            let pending = Arc::clone(&buffer);
            let dispatcher = self.dispatcher();
            context.on_committed(move || async move {
                let envelopes =
                    std::mem::take(&mut *pending.lock().unwrap_or_else(|e| e.into_inner()));
                dispatcher.flush(envelopes).await
            });
            buffer
        })?;

        outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(envelope);
        Ok(())
    }

    async fn receive(
        &self,
        context: &TransactionContext,
        cancel: &CancellationToken,
    ) -> Result<Option<TransportMessage>, TransportError> {
        let address = self.address.as_ref().ok_or(TransportError::OneWayClient)?;
        let queue = self.factory.get_queue(address)?;
        let lease = to_chrono(self.options.initial_visibility_delay);

        let leased = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = self.lease_next(queue.as_ref(), lease) => result?,
        };

        let Some(leased) = leased else {
            return Ok(None);
        };

        debug!(
            queue = %address,
            message_id = %leased.message_id,
            dequeue_count = leased.dequeue_count,
            "Received message"
        );

        if self.options.automatic_lease_renewal_enabled && self.options.prefetch().is_none() {
            self.renewals.track(Arc::clone(&queue), &leased);
        }
        self.register_completion(context, queue, &leased);

        Ok(Some(codec::decode(&leased.payload)?))
    }
}

impl Drop for StorageQueueTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
