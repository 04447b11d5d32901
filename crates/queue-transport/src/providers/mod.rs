//! Queue client implementations.

pub mod memory;
pub mod storage;

pub use memory::{InMemoryQueueClient, InMemoryQueueFactory};
pub use storage::{
    MessageEncoding, StaticTokenCredential, StorageQueueClient, StorageQueueFactory,
    TokenCredential,
};
