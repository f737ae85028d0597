//! Hand-off primitives between device-side threads and consumers.
//!
//! [`bounded`] is a fixed-capacity FIFO that never blocks producers: a full
//! queue reports [`SendOutcome::Full`] and the caller decides what to drop.
//! Consumers may wait with a deadline. [`LatestValue`] keeps only the most
//! recent value.

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex, RwLock};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// Result of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Ok,
    /// The value was handed back to the caller's drop policy.
    Full,
    Closed,
}

/// Result of a dequeue.
#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome<T> {
    Data(T),
    /// Closed and fully drained.
    Closed,
    Empty,
}

struct Channel<T> {
    queue: ArrayQueue<T>,
    closed: AtomicBool,
    lock: Mutex<()>,
    ready: Condvar,
}

impl<T> Channel<T> {
    fn wake(&self) {
        let _guard = self.lock.lock();
        self.ready.notify_all();
    }

    fn try_pop(&self) -> RecvOutcome<T> {
        match self.queue.pop() {
            Some(value) => RecvOutcome::Data(value),
            None if self.closed.load(Ordering::Acquire) => RecvOutcome::Closed,
            None => RecvOutcome::Empty,
        }
    }
}

/// Producer half of [`bounded`].
#[derive(Clone)]
pub struct BoundedTx<T> {
    chan: Arc<Channel<T>>,
}

impl<T> BoundedTx<T> {
    /// Enqueue without blocking.
    pub fn send(&self, value: T) -> SendOutcome {
        if self.chan.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        if self.chan.queue.push(value).is_err() {
            return SendOutcome::Full;
        }
        self.chan.wake();
        SendOutcome::Ok
    }

    pub fn close(&self) {
        self.chan.closed.store(true, Ordering::Release);
        self.chan.wake();
    }
}

/// Consumer half of [`bounded`].
#[derive(Clone)]
pub struct BoundedRx<T> {
    chan: Arc<Channel<T>>,
}

impl<T> BoundedRx<T> {
    /// Dequeue without blocking.
    pub fn recv(&self) -> RecvOutcome<T> {
        self.chan.try_pop()
    }

    /// Wait up to `timeout` for a value; `Empty` once the deadline passes.
    pub fn recv_timeout(&self, timeout: Duration) -> RecvOutcome<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.chan.lock.lock();
        loop {
            match self.chan.try_pop() {
                RecvOutcome::Empty => {}
                other => return other,
            }
            if self.chan.ready.wait_until(&mut guard, deadline).timed_out() {
                return self.chan.try_pop();
            }
        }
    }

    /// Everything queued right now, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.chan.queue.len());
        while let Some(value) = self.chan.queue.pop() {
            out.push(value);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.chan.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chan.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.chan.queue.capacity()
    }

    /// Reject further sends; queued values can still be received.
    pub fn close(&self) {
        self.chan.closed.store(true, Ordering::Release);
        self.chan.wake();
    }
}

#[cfg(feature = "async")]
impl<T> BoundedRx<T> {
    /// Yield to the runtime until a value arrives or the queue closes.
    pub async fn recv_async(&self) -> RecvOutcome<T> {
        loop {
            match self.chan.try_pop() {
                RecvOutcome::Empty => tokio::task::yield_now().await,
                other => return other,
            }
        }
    }
}

/// Fixed-capacity queue (capacity is at least 1).
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use camlink_core::prelude::{bounded, RecvOutcome, SendOutcome};
///
/// let (tx, rx) = bounded::<u8>(1);
/// assert_eq!(tx.send(1), SendOutcome::Ok);
/// assert_eq!(tx.send(2), SendOutcome::Full);
/// assert_eq!(rx.recv_timeout(Duration::from_millis(5)), RecvOutcome::Data(1));
/// assert_eq!(rx.recv(), RecvOutcome::Empty);
/// ```
pub fn bounded<T>(capacity: usize) -> (BoundedTx<T>, BoundedRx<T>) {
    let chan = Arc::new(Channel {
        queue: ArrayQueue::new(capacity.max(1)),
        closed: AtomicBool::new(false),
        lock: Mutex::new(()),
        ready: Condvar::new(),
    });
    (BoundedTx { chan: chan.clone() }, BoundedRx { chan })
}

/// Shared cell holding only the most recently stored value.
///
/// # Example
/// ```rust
/// use camlink_core::prelude::LatestValue;
///
/// let cell = LatestValue::new();
/// let reader = cell.clone();
/// cell.store(1u32);
/// cell.store(2);
/// assert_eq!(reader.load(), Some(2));
/// ```
pub struct LatestValue<T> {
    slot: Arc<RwLock<Option<T>>>,
}

impl<T> Clone for LatestValue<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Default for LatestValue<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
        }
    }
}

impl<T: Clone> LatestValue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held value.
    pub fn store(&self, value: T) {
        *self.slot.write() = Some(value);
    }

    pub fn load(&self) -> Option<T> {
        self.slot.read().clone()
    }

    pub fn clear(&self) {
        *self.slot.write() = None;
    }
}
