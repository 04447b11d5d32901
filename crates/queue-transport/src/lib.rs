//! # Queue Transport
//!
//! Message bus transport on top of lease-based storage queues.
//!
//! This library provides:
//! - Transactional sends: outgoing messages are buffered per transaction and
//!   enqueued on commit, grouped by destination
//! - Leased receives, optionally prefetched in batches
//! - Ack by delete, nack by releasing the lease
//! - Automatic lease renewal for long-running handlers
//! - Native deferred delivery through initial invisibility delays
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all layers
//! - [`message`] - Queue names, identifiers and message structures
//! - [`codec`] - Wire format of a queue entry
//! - [`client`] - Queue client capability traits
//! - [`providers`] - In-memory and Azure Storage Queue implementations
//! - [`options`] - Transport configuration
//! - [`transaction`] - Transaction context and completion hooks
//! - [`deferred`] - Routing of deferred messages
//! - [`renewal`] - Lease renewal table and background loop
//! - [`prefetch`] - Prefetch buffer
//! - [`transport`] - The transport itself

// Module declarations
pub mod client;
pub mod codec;
pub mod deferred;
pub mod error;
pub mod message;
pub mod options;
pub mod prefetch;
pub mod providers;
pub mod renewal;
pub mod time;
pub mod transaction;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use client::{QueueClient, QueueClientFactory};
pub use deferred::{OutgoingEnvelope, DEFERRED_MESSAGES_ADDRESS};
pub use error::{
    CodecError, ConfigurationError, QueueError, TransportError, ValidationError,
};
pub use message::{
    headers, Headers, LeaseExtension, LeaseToken, LeasedMessage, MessageId, QueueName, Timestamp,
    TransportMessage,
};
pub use options::{TransportOptions, MAX_PREFETCH_COUNT};
pub use providers::{
    InMemoryQueueClient, InMemoryQueueFactory, MessageEncoding, StaticTokenCredential,
    StorageQueueClient, StorageQueueFactory, TokenCredential,
};
pub use time::{Clock, ManualClock, SystemClock};
pub use transaction::TransactionContext;
pub use transport::{StorageQueueTransport, Transport};

// Cancellation tokens appear in the public receive API
pub use tokio_util::sync::CancellationToken;
