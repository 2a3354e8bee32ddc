//! Condition variable
//!
//! Lets callers await a boolean predicate becoming true, with a per-waiter
//! deadline. The owner calls `notify()` once the predicate holds.
//!
//! Settlement is "first wins": a waiter's oneshot sender is removed from the
//! table by whichever of `notify()`, `throw()`, or the waiter's own deadline
//! gets there first. `clear()` drops the senders without settling, so a
//! cleared waiter only ever completes through its deadline.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::{ConnectionError, Result};
use crate::{deadline_after, truncated};

/// Default deadline for `wait()`
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(5000);

type Predicate = Box<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct Waiters {
    next_id: u64,
    table: HashMap<u64, oneshot::Sender<Result<()>>>,
}

pub struct Condition {
    predicate: Predicate,
    waiters: Arc<Mutex<Waiters>>,
}

impl Condition {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
            waiters: Arc::new(Mutex::new(Waiters::default())),
        }
    }

    /// Wait for the predicate to hold.
    ///
    /// The predicate is checked and the waiter registered at call time, so a
    /// `notify()` issued before the returned future is first polled is not
    /// lost. When the predicate already holds nothing is registered and the
    /// future is ready on first poll.
    ///
    /// On expiry the error message is `msg` (truncated to 100 characters) or
    /// `Timeout to wait: waiter: <id>`.
    pub fn wait(
        &self,
        timeout: Duration,
        msg: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let deadline = deadline_after(timeout);

        let registration = {
            let mut waiters = lock(&self.waiters);
            // Checked under the waiter lock: a concurrent notify() either
            // sees this waiter or happened before the predicate turned true.
            if (self.predicate)() {
                None
            } else {
                let id = waiters.next_id;
                waiters.next_id += 1;
                let (tx, rx) = oneshot::channel();
                waiters.table.insert(id, tx);
                let message = match msg {
                    Some(msg) => truncated(msg),
                    None => format!("Timeout to wait: waiter: {}", id),
                };
                Some((id, rx, message))
            }
        };

        let waiters = Arc::clone(&self.waiters);
        async move {
            let Some((id, rx, message)) = registration else {
                return Ok(());
            };
            let _registered = Registered { waiters, id };

            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_cleared)) => {
                    tokio::time::sleep_until(deadline).await;
                    Err(ConnectionError::Timeout(message))
                }
                Err(_elapsed) => Err(ConnectionError::Timeout(message)),
            }
        }
    }

    /// Resolve every registered waiter. Does not re-check the predicate.
    pub fn notify(&self) {
        for (_, waiter) in self.drain() {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Reject every registered waiter with `reason`.
    pub fn throw(&self, reason: ConnectionError) {
        for (_, waiter) in self.drain() {
            let _ = waiter.send(Err(reason.clone()));
        }
    }

    /// Forget every registered waiter without settling it.
    pub fn clear(&self) {
        drop(self.drain());
    }

    pub fn waiter_count(&self) -> usize {
        lock(&self.waiters).table.len()
    }

    fn drain(&self) -> Vec<(u64, oneshot::Sender<Result<()>>)> {
        lock(&self.waiters).table.drain().collect()
    }
}

/// Removes the waiter from the table when its future completes or is dropped.
struct Registered {
    waiters: Arc<Mutex<Waiters>>,
    id: u64,
}

impl Drop for Registered {
    fn drop(&mut self) {
        lock(&self.waiters).table.remove(&self.id);
    }
}

fn lock(waiters: &Mutex<Waiters>) -> MutexGuard<'_, Waiters> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}
