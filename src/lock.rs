//! Distributed mutual exclusion over a named resource.
//!
//! A lock is held if-and-only-if its key exists in the store and holds this
//! instance's holder id; every mutation is checked server-side against that
//! value, so a party that did not write it can never release or extend it.
//! The lease TTL is the failure-recovery bound for a crashed holder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LockError;
use crate::events::{Event, EventBus};
use crate::lifecycle::StateCell;
use crate::store::Store;

/// Fixed backoff between acquire attempts when retry-on-fail is enabled.
const ACQUIRE_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Exclusive-ownership primitive over a named resource.
///
/// The holder id is random per lock *instance*, not per process — two locks
/// on the same resource in one process still exclude each other.
pub struct DistributedLock {
    store: Arc<dyn Store>,
    resource: String,
    holder: String,
    ttl_ms: u64,
    retry_on_fail: bool,
    held: AtomicBool,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn Store>, resource: impl Into<String>, ttl_ms: u64) -> Self {
        Self {
            store,
            resource: resource.into(),
            holder: Uuid::new_v4().to_string(),
            ttl_ms,
            retry_on_fail: false,
            held: AtomicBool::new(false),
        }
    }

    /// Keep retrying a contended acquire with a fixed 1 s backoff instead
    /// of failing immediately.
    pub fn with_retry_on_fail(mut self, retry: bool) -> Self {
        self.retry_on_fail = retry;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Attempt to take the lock: a single atomic set-if-absent-with-expiry.
    /// Returns false when another holder owns it and retry-on-fail is off;
    /// with retry-on-fail, loops until the lock is taken.
    pub async fn acquire(&self) -> Result<bool, LockError> {
        loop {
            if self
                .store
                .lock_acquire(&self.resource, &self.holder, self.ttl_ms)
                .await?
            {
                self.held.store(true, Ordering::Release);
                debug!(resource = %self.resource, "lock acquired");
                return Ok(true);
            }
            if !self.retry_on_fail {
                return Ok(false);
            }
            tokio::time::sleep(ACQUIRE_RETRY_BACKOFF).await;
        }
    }

    /// Push the lease out by another TTL. Any reply other than "value
    /// matched" means the lock was lost to another holder — reported as
    /// `Lost`, distinct from `NotAcquired`.
    pub async fn extend(&self) -> Result<(), LockError> {
        if !self.is_held() {
            return Err(LockError::NotAcquired(self.resource.clone()));
        }
        let matched = self
            .store
            .lock_extend(&self.resource, &self.holder, self.ttl_ms)
            .await?;
        if matched {
            Ok(())
        } else {
            self.held.store(false, Ordering::Release);
            Err(LockError::Lost(self.resource.clone()))
        }
    }

    /// Let go of the lock: a single atomic delete-if-value-equals-mine.
    /// Releasing a lock that was never acquired, already expired, or stolen
    /// is a no-op, never an error.
    pub async fn release(&self) -> Result<(), LockError> {
        if !self.held.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let matched = self
            .store
            .lock_release(&self.resource, &self.holder)
            .await?;
        if !matched {
            debug!(resource = %self.resource, "release found the lock already gone");
        }
        Ok(())
    }
}

/// Repeating lease renewal for a held lock.
///
/// Each tick extends the lease. On `Lost` the owner must tear down: the
/// loss is signalled through the watch channel and the renewer stops. Any
/// other error goes to the generic error path and renewal keeps attempting
/// on the next schedule, but only while the owning component is alive.
pub struct AutoRenewer {
    task: Option<JoinHandle<()>>,
    lost_rx: watch::Receiver<bool>,
}

impl AutoRenewer {
    pub fn start(
        lock: Arc<DistributedLock>,
        interval: Duration,
        owner_state: StateCell,
        events: EventBus,
    ) -> Self {
        let (lost_tx, lost_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick of a tokio interval fires immediately; the
            // lease was just taken, so skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !owner_state.is_alive() {
                    break;
                }
                match lock.extend().await {
                    Ok(()) => {
                        debug!(resource = %lock.resource(), "lease extended");
                    }
                    Err(LockError::Lost(resource)) => {
                        warn!(%resource, "lock lost to another holder");
                        events.emit(Event::LockDown {
                            lock_id: resource.clone(),
                        });
                        let _ = lost_tx.send(true);
                        break;
                    }
                    Err(err) => {
                        events.emit(Event::LockError {
                            lock_id: lock.resource().to_string(),
                            error: err.to_string(),
                        });
                    }
                }
            }
        });
        Self {
            task: Some(task),
            lost_rx,
        }
    }

    /// Watch that flips to true when the lock is lost.
    pub fn lost(&self) -> watch::Receiver<bool> {
        self.lost_rx.clone()
    }

    /// Cancel the renewal timer.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for AutoRenewer {
    fn drop(&mut self) {
        self.stop();
    }
}
