//! Transaction context shared between the message bus and the transport.
//!
//! A context lives for one unit of work (handling one received message, or
//! one batch of sends). The transport stores per-transaction state in its
//! item slots and registers hooks that the owner of the context runs when
//! the unit of work ends:
//!
//! 1. `commit` runs the commit hooks (outgoing messages are flushed here)
//! 2. `complete` commits, then runs the ack hooks; if the commit fails the
//!    nack hooks run instead
//! 3. `abort` runs the nack hooks
//! 4. dropping the context runs the disposed hooks
//!
//! Every hook runs at most once.

use crate::error::{ConfigurationError, TransportError};
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

#[cfg(test)]
#[path = "transaction_tests.rs"]
mod tests;

type AsyncHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), TransportError>> + Send>;
type SyncHook = Box<dyn FnOnce() + Send>;

/// Unit-of-work context with typed item slots and completion hooks
#[derive(Default)]
pub struct TransactionContext {
    items: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    on_commit: Mutex<Vec<AsyncHook>>,
    on_ack: Mutex<Vec<AsyncHook>>,
    on_nack: Mutex<Vec<AsyncHook>>,
    on_disposed: Mutex<Vec<SyncHook>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn boxed<F, Fut>(hook: F) -> AsyncHook
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
{
    Box::new(move || Box::pin(hook()))
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the item stored under `key`, creating it with `init` on first use.
    ///
    /// `init` runs at most once per key and may register hooks on this context.
    pub fn get_or_add<T, F>(&self, key: &str, init: F) -> Result<Arc<T>, TransportError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut items = lock(&self.items);
        let item = items
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(init()) as Arc<dyn Any + Send + Sync>);

        Arc::clone(item).downcast::<T>().map_err(|_| {
            TransportError::Configuration(ConfigurationError::Invalid {
                message: format!(
                    "transaction item '{}' holds a value of a different type",
                    key
                ),
            })
        })
    }

    /// Register a hook that runs when the transaction commits
    pub fn on_committed<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        lock(&self.on_commit).push(boxed(hook));
    }

    /// Register a hook that runs after a successful commit
    pub fn on_ack<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        lock(&self.on_ack).push(boxed(hook));
    }

    /// Register a hook that runs when the transaction is rolled back
    pub fn on_nack<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        lock(&self.on_nack).push(boxed(hook));
    }

    /// Register a hook that runs when the context is dropped, whatever the outcome
    pub fn on_disposed<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        lock(&self.on_disposed).push(Box::new(hook));
    }

    /// Run the commit hooks, stopping at the first failure
    pub async fn commit(&self) -> Result<(), TransportError> {
        let hooks = std::mem::take(&mut *lock(&self.on_commit));
        for hook in hooks {
            hook().await?;
        }
        Ok(())
    }

    /// Commit, then acknowledge; roll back if the commit fails
    pub async fn complete(&self) -> Result<(), TransportError> {
        if let Err(e) = self.commit().await {
            self.abort().await;
            return Err(e);
        }

        lock(&self.on_nack).clear();
        let hooks = std::mem::take(&mut *lock(&self.on_ack));
        for hook in hooks {
            hook().await?;
        }
        Ok(())
    }

    /// Roll back: discard pending commit work and run the nack hooks
    pub async fn abort(&self) {
        lock(&self.on_commit).clear();
        lock(&self.on_ack).clear();

        let hooks = std::mem::take(&mut *lock(&self.on_nack));
        for hook in hooks {
            if let Err(e) = hook().await {
                warn!(error = %e, "Rollback hook failed");
            }
        }
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        let hooks = std::mem::take(&mut *lock(&self.on_disposed));
        for hook in hooks {
            hook();
        }
    }
}
