//! Automatic lease renewal for messages still being handled.
//!
//! Every message received while renewal is enabled gets an entry in the
//! [`RenewalTable`]. A background loop ([`LeaseRenewer`]) wakes up on a fixed
//! interval, extends the leases whose renewal is due and records the rotated
//! lease token. Completion retires the entry and reads the latest token.
//!
//! Renewal is scheduled at the midpoint of the remaining lease: after a
//! renewal at `R` that leases the message until `T`, the next renewal is due
//! at `R + (T - R) / 2`.

use crate::client::QueueClient;
use crate::message::{LeaseToken, LeasedMessage, MessageId, Timestamp};
use crate::time::Clock;
use chrono::Duration;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "renewal_tests.rs"]
mod tests;

struct LeaseState {
    token: LeaseToken,
    leased_until: Timestamp,
    next_renewal_due: Timestamp,
    retired: bool,
}

/// In-flight message whose lease is kept alive
struct TrackedLease {
    message_id: MessageId,
    queue: Arc<dyn QueueClient>,
    state: Mutex<LeaseState>,
}

fn midpoint(now: Timestamp, leased_until: Timestamp) -> Timestamp {
    now.add(leased_until.duration_since(&now) / 2)
}

/// Concurrent table of leases to renew, keyed by message ID
#[derive(Clone)]
pub struct RenewalTable {
    entries: Arc<DashMap<MessageId, Arc<TrackedLease>>>,
    clock: Arc<dyn Clock>,
    renewal_duration: Duration,
}

impl RenewalTable {
    /// Create an empty table renewing leases for `renewal_duration` at a time
    pub fn new(clock: Arc<dyn Clock>, renewal_duration: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
            renewal_duration,
        }
    }

    /// Start tracking a freshly leased message
    pub fn track(&self, queue: Arc<dyn QueueClient>, message: &LeasedMessage) {
        let now = self.clock.now();
        let lease = TrackedLease {
            message_id: message.message_id.clone(),
            queue,
            state: Mutex::new(LeaseState {
                token: message.lease_token.clone(),
                leased_until: message.next_visible_on,
                next_renewal_due: midpoint(now, message.next_visible_on),
                retired: false,
            }),
        };

        self.entries
            .insert(message.message_id.clone(), Arc::new(lease));
    }

    /// Stop renewing a message and return its most recent lease token.
    ///
    /// Waits for an in-flight renewal of the same message to finish first.
    pub async fn retire(&self, message_id: &MessageId) -> Option<LeaseToken> {
        let (_, lease) = self.entries.remove(message_id)?;
        let mut state = lease.state.lock().await;
        state.retired = true;
        Some(state.token.clone())
    }

    /// Stop renewing a message without waiting for its token
    pub fn forget(&self, message_id: &MessageId) {
        if let Some((_, lease)) = self.entries.remove(message_id) {
            if let Ok(mut state) = lease.state.try_lock() {
                state.retired = true;
            }
        }
    }

    /// Current lease token of a tracked message
    pub async fn current_token(&self, message_id: &MessageId) -> Option<LeaseToken> {
        let lease = self.entries.get(message_id).map(|e| Arc::clone(e.value()))?;
        let state = lease.state.lock().await;
        Some(state.token.clone())
    }

    /// Next renewal time of a tracked message
    pub async fn next_renewal_due(&self, message_id: &MessageId) -> Option<Timestamp> {
        let lease = self.entries.get(message_id).map(|e| Arc::clone(e.value()))?;
        let state = lease.state.lock().await;
        Some(state.next_renewal_due)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renew every lease whose renewal is due; returns the number renewed
    pub async fn renew_due(&self) -> usize {
        let now = self.clock.now();

        // Entries locked right now are being renewed or completed; the next
        // tick picks them up if they are still tracked.
        let due: Vec<Arc<TrackedLease>> = self
            .entries
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .state
                    .try_lock()
                    .map(|state| !state.retired && state.next_renewal_due <= now)
                    .unwrap_or(false)
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        if due.is_empty() {
            return 0;
        }

        let results = futures::future::join_all(due.iter().map(|lease| self.renew(lease))).await;
        results.into_iter().filter(|renewed| *renewed).count()
    }

    async fn renew(&self, lease: &TrackedLease) -> bool {
        let mut state = lease.state.lock().await;
        if state.retired {
            return false;
        }

        match lease
            .queue
            .extend_lease(&lease.message_id, &state.token, self.renewal_duration)
            .await
        {
            Ok(extension) => {
                let now = self.clock.now();
                state.token = extension.lease_token;
                state.leased_until = extension.next_visible_on;
                state.next_renewal_due = midpoint(now, state.leased_until);
                debug!(
                    queue = %lease.queue.queue_name(),
                    message_id = %lease.message_id,
                    leased_until = %state.leased_until,
                    next_renewal_due = %state.next_renewal_due,
                    "Renewed message lease"
                );
                true
            }
            Err(e) => {
                warn!(
                    queue = %lease.queue.queue_name(),
                    message_id = %lease.message_id,
                    error = %e,
                    "Failed to renew message lease; will retry on next tick"
                );
                false
            }
        }
    }
}

/// Background task driving a [`RenewalTable`]
pub struct LeaseRenewer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl LeaseRenewer {
    /// Spawn the renewal loop; it runs until `stop` is called or `cancel` fires
    pub fn start(
        table: RenewalTable,
        interval: std::time::Duration,
        cancel: CancellationToken,
    ) -> Self {
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => {
                        debug!("Lease renewal loop cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let renewed = table.renew_due().await;
                        if renewed > 0 {
                            debug!(renewed, tracked = table.len(), "Lease renewal tick");
                        }
                    }
                }
            }
        });

        Self { cancel, handle }
    }

    /// Cancel the loop and wait for it to exit
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Lease renewal loop ended abnormally");
        }
    }
}
