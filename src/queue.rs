//! # Stage: Admission Queue
//!
//! ## Responsibility
//! Bound the number of chat requests talking to the upstream at once and make
//! everybody else wait their turn.
//!
//! ## Guarantees
//! - At most `capacity` [`Admission`]s exist at any instant
//! - Waiters are admitted in arrival (FIFO) order; the semaphore is fair
//! - Dropping an `Admission` immediately hands its slot to the oldest waiter
//! - A waiter whose future is dropped leaves the queue without leaking a slot
//!
//! ## NOT Responsible For
//! - Priorities, aging, or cross-process fairness (one queue per process)
//! - Deciding what an admitted request does (that is the orchestrator)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Returned by [`AdmissionQueue::admit`] once the queue has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

impl std::fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "admission queue is closed")
    }
}

impl std::error::Error for QueueClosed {}

/// Point-in-time view of the queue, served on `/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueSnapshot {
    pub active: usize,
    pub queued: usize,
    pub capacity: usize,
}

#[derive(Debug)]
pub struct AdmissionQueue {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    active: Arc<AtomicUsize>,
    queued: AtomicUsize,
}

impl AdmissionQueue {
    /// `capacity` is clamped to at least one slot.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
            queued: AtomicUsize::new(0),
        }
    }

    /// Wait for a free slot.
    pub async fn admit(&self) -> Result<Admission, QueueClosed> {
        let waiting = Waiting::enter(&self.queued);
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| QueueClosed)?;
        drop(waiting);
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(Admission {
            _permit: permit,
            active: Arc::clone(&self.active),
        })
    }

    /// Reject every current and future waiter. Active admissions run on.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            active: self.active(),
            queued: self.queued(),
            capacity: self.capacity,
        }
    }
}

/// One occupied slot. The slot is released on drop.
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Keeps the `queued` counter honest even if the admit future is dropped.
struct Waiting<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> Waiting<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
