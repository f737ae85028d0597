use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::metrics::Metrics;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a pool; handles carry it so a slot can never be
/// returned to a pool it was not taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(u64);

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

/// Index handle into a pool's arena.
///
/// The generation changes every time the slot goes back to `Free`, so a
/// handle kept past its release (or past an eviction) is rejected as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    pool: PoolId,
    index: u32,
    generation: u32,
}

impl SlotHandle {
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Lifecycle of a single slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Available for the device.
    Free,
    /// Owned by the device; only the device may write.
    InFlightToDevice,
    /// Holds a completed frame; only the consumer may read.
    FilledAwaitingConsumer,
}

/// What a pool does when the device asks for a slot and none is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExhaustionPolicy {
    /// Lossless: the producer waits until a consumer releases a slot.
    Block,
    /// Lossy: the oldest unconsumed frame is evicted and reused.
    DropOldest,
}

/// Errors raised by pool transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("buffer pool exhausted")]
    Exhausted,
    #[error("no slot freed within {0:?}")]
    AcquireTimeout(Duration),
    #[error("{outstanding} slot(s) still in flight after {waited:?}")]
    DrainTimeout { waited: Duration, outstanding: usize },
    #[error("slot belongs to {found}, not {expected}")]
    ForeignSlot { expected: PoolId, found: PoolId },
    #[error("slot handle is stale")]
    StaleSlot,
    #[error("slot {index} is {actual:?}, expected {expected:?}")]
    InvalidTransition {
        index: usize,
        expected: SlotState,
        actual: SlotState,
    },
    #[error("buffer pool is closed")]
    Closed,
}

/// Snapshot of slot occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Total slots in the arena.
    pub size: usize,
    /// Slots in `Free`.
    pub free: usize,
    /// Slots in `InFlightToDevice`.
    pub in_flight: usize,
    /// Slots in `FilledAwaitingConsumer`.
    pub filled: usize,
}

/// Read-only view over a pool's counters.
#[derive(Clone)]
pub struct BufferPoolMetrics(Arc<Metrics>);

impl BufferPoolMetrics {
    pub fn acquisitions(&self) -> u64 {
        self.0.acquisitions()
    }

    pub fn recycles(&self) -> u64 {
        self.0.recycles()
    }

    pub fn releases(&self) -> u64 {
        self.0.releases()
    }

    pub fn backpressure(&self) -> u64 {
        self.0.backpressure_count()
    }

    pub fn drops(&self) -> u64 {
        self.0.drop_count()
    }
}

/// Fixed-size arena of frame slots shared between the device (producer) and
/// a consumer.
///
/// Slots move `Free → InFlightToDevice → FilledAwaitingConsumer → Free`. The
/// pool never grows; exhaustion is handled by the pool's [`ExhaustionPolicy`].
///
/// # Example
/// ```rust
/// use camlink_core::prelude::{BufferPool, ExhaustionPolicy, SlotState};
///
/// let pool = BufferPool::new(2, 16, ExhaustionPolicy::Block);
/// let slot = pool.acquire().unwrap();
/// pool.with_slot_mut(slot, |bytes| bytes.fill(7)).unwrap();
/// pool.recycle(slot, 16).unwrap();
/// assert_eq!(pool.state(slot), Ok(SlotState::FilledAwaitingConsumer));
/// let sum: u32 = pool.with_slot(slot, |bytes| bytes.iter().map(|b| *b as u32).sum()).unwrap();
/// assert_eq!(sum, 7 * 16);
/// pool.release(slot).unwrap();
/// assert_eq!(pool.stats().free, 2);
/// ```
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
    metrics: Arc<Metrics>,
}

struct PoolInner {
    id: PoolId,
    slot_bytes: usize,
    policy: ExhaustionPolicy,
    state: Mutex<PoolState>,
    changed: Condvar,
}

struct Slot {
    state: SlotState,
    generation: u32,
    len: usize,
}

struct PoolState {
    slots: Vec<Slot>,
    arena: Vec<u8>,
    free: VecDeque<u32>,
    // fill order, oldest first
    filled: VecDeque<u32>,
    in_flight: usize,
    closed: bool,
}

impl PoolState {
    fn check(&self, id: PoolId, handle: SlotHandle) -> Result<usize, PoolError> {
        if handle.pool != id {
            return Err(PoolError::ForeignSlot {
                expected: id,
                found: handle.pool,
            });
        }
        if self.closed {
            return Err(PoolError::Closed);
        }
        let index = handle.index as usize;
        match self.slots.get(index) {
            Some(slot) if slot.generation == handle.generation => Ok(index),
            _ => Err(PoolError::StaleSlot),
        }
    }

    fn expect(&self, index: usize, expected: SlotState) -> Result<(), PoolError> {
        let actual = self.slots[index].state;
        if actual == expected {
            Ok(())
        } else {
            Err(PoolError::InvalidTransition {
                index,
                expected,
                actual,
            })
        }
    }

    fn free_slot(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.state = SlotState::Free;
        slot.generation = slot.generation.wrapping_add(1);
        slot.len = 0;
        self.free.push_back(index as u32);
    }

    fn take_free(&mut self, id: PoolId) -> Option<SlotHandle> {
        let index = self.free.pop_front()?;
        let slot = &mut self.slots[index as usize];
        slot.state = SlotState::InFlightToDevice;
        self.in_flight += 1;
        Some(SlotHandle {
            pool: id,
            index,
            generation: slot.generation,
        })
    }

    fn evict_oldest(&mut self, id: PoolId) -> Option<SlotHandle> {
        let index = self.filled.pop_front()?;
        self.free_slot(index as usize);
        // the freed slot is at the back; take it directly
        self.free.pop_back();
        let slot = &mut self.slots[index as usize];
        slot.state = SlotState::InFlightToDevice;
        self.in_flight += 1;
        Some(SlotHandle {
            pool: id,
            index,
            generation: slot.generation,
        })
    }

    fn range(&self, index: usize, slot_bytes: usize) -> std::ops::Range<usize> {
        let start = index * slot_bytes;
        start..start + slot_bytes
    }
}

impl BufferPool {
    /// Create a pool of `count` slots of `slot_bytes` each (at least one slot).
    pub fn new(count: usize, slot_bytes: usize, policy: ExhaustionPolicy) -> Self {
        let count = count.max(1);
        let slots = (0..count)
            .map(|_| Slot {
                state: SlotState::Free,
                generation: 0,
                len: 0,
            })
            .collect();
        let id = PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed));
        trace!(pool = %id, count, slot_bytes, ?policy, "allocating buffer pool");
        Self {
            inner: Arc::new(PoolInner {
                id,
                slot_bytes,
                policy,
                state: Mutex::new(PoolState {
                    slots,
                    arena: vec![0; count * slot_bytes],
                    free: (0..count as u32).collect(),
                    filled: VecDeque::with_capacity(count),
                    in_flight: 0,
                    closed: false,
                }),
                changed: Condvar::new(),
            }),
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn id(&self) -> PoolId {
        self.inner.id
    }

    pub fn policy(&self) -> ExhaustionPolicy {
        self.inner.policy
    }

    /// Bytes available in each slot.
    pub fn slot_bytes(&self) -> usize {
        self.inner.slot_bytes
    }

    /// Number of slots in the arena.
    pub fn capacity(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    /// Whether the handle was issued by this pool.
    pub fn owns(&self, handle: SlotHandle) -> bool {
        handle.pool == self.inner.id
    }

    /// Hand a slot to the device without waiting.
    ///
    /// On exhaustion a `DropOldest` pool evicts its oldest unconsumed frame;
    /// a `Block` pool reports [`PoolError::Exhausted`].
    pub fn acquire(&self) -> Result<SlotHandle, PoolError> {
        let mut state = self.inner.state.lock();
        self.acquire_locked(&mut state)
    }

    /// Hand a slot to the device, waiting up to `timeout` for a consumer to
    /// release one when the pool blocks on exhaustion.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<SlotHandle, PoolError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            match self.acquire_locked(&mut state) {
                Err(PoolError::Exhausted) => {}
                other => return other,
            }
            if self
                .inner
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match self.acquire_locked(&mut state) {
                    Err(PoolError::Exhausted) => Err(PoolError::AcquireTimeout(timeout)),
                    other => other,
                };
            }
        }
    }

    fn acquire_locked(&self, state: &mut MutexGuard<'_, PoolState>) -> Result<SlotHandle, PoolError> {
        if state.closed {
            return Err(PoolError::Closed);
        }
        if let Some(handle) = state.take_free(self.inner.id) {
            self.metrics.acquired();
            return Ok(handle);
        }
        self.metrics.exhausted();
        if self.inner.policy == ExhaustionPolicy::DropOldest
            && let Some(handle) = state.evict_oldest(self.inner.id)
        {
            debug!(pool = %self.inner.id, slot = handle.index, "evicted oldest unconsumed frame");
            self.metrics.dropped();
            self.metrics.acquired();
            return Ok(handle);
        }
        Err(PoolError::Exhausted)
    }

    /// Device hands a filled slot back: `InFlightToDevice → FilledAwaitingConsumer`.
    pub fn recycle(&self, handle: SlotHandle, bytes_used: usize) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock();
        let index = state.check(self.inner.id, handle)?;
        state.expect(index, SlotState::InFlightToDevice)?;
        let slot = &mut state.slots[index];
        slot.state = SlotState::FilledAwaitingConsumer;
        slot.len = bytes_used.min(self.inner.slot_bytes);
        state.in_flight -= 1;
        state.filled.push_back(index as u32);
        self.metrics.recycled();
        self.inner.changed.notify_all();
        Ok(())
    }

    /// Consumer is done with a frame: `FilledAwaitingConsumer → Free`.
    pub fn release(&self, handle: SlotHandle) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock();
        let index = state.check(self.inner.id, handle)?;
        state.expect(index, SlotState::FilledAwaitingConsumer)?;
        state.filled.retain(|i| *i as usize != index);
        state.free_slot(index);
        self.metrics.released();
        self.inner.changed.notify_all();
        Ok(())
    }

    /// Device aborted a request before filling: `InFlightToDevice → Free`.
    pub fn abandon(&self, handle: SlotHandle) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock();
        let index = state.check(self.inner.id, handle)?;
        state.expect(index, SlotState::InFlightToDevice)?;
        state.in_flight -= 1;
        state.free_slot(index);
        self.inner.changed.notify_all();
        Ok(())
    }

    /// Current state of the slot named by `handle`.
    pub fn state(&self, handle: SlotHandle) -> Result<SlotState, PoolError> {
        let state = self.inner.state.lock();
        let index = state.check(self.inner.id, handle)?;
        Ok(state.slots[index].state)
    }

    /// Write access for the device while the slot is in flight.
    pub fn with_slot_mut<R>(
        &self,
        handle: SlotHandle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, PoolError> {
        let mut state = self.inner.state.lock();
        let index = state.check(self.inner.id, handle)?;
        state.expect(index, SlotState::InFlightToDevice)?;
        let range = state.range(index, self.inner.slot_bytes);
        Ok(f(&mut state.arena[range]))
    }

    /// Read access for the consumer while the slot holds a completed frame.
    pub fn with_slot<R>(&self, handle: SlotHandle, f: impl FnOnce(&[u8]) -> R) -> Result<R, PoolError> {
        let state = self.inner.state.lock();
        let index = state.check(self.inner.id, handle)?;
        state.expect(index, SlotState::FilledAwaitingConsumer)?;
        let range = state.range(index, self.inner.slot_bytes);
        let len = state.slots[index].len;
        Ok(f(&state.arena[range][..len]))
    }

    /// Wait until no slot is `InFlightToDevice`.
    pub fn wait_for_drain(&self, timeout: Duration) -> Result<(), PoolError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.in_flight > 0 && !state.closed {
            if self
                .inner
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
                && state.in_flight > 0
            {
                return Err(PoolError::DrainTimeout {
                    waited: timeout,
                    outstanding: state.in_flight,
                });
            }
        }
        Ok(())
    }

    /// Return every slot to `Free` and refuse further transitions.
    ///
    /// Outstanding handles become stale; waiters are woken.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.filled.clear();
        state.free.clear();
        for index in 0..state.slots.len() {
            state.free_slot(index);
        }
        state.in_flight = 0;
        state.closed = true;
        self.inner.changed.notify_all();
        trace!(pool = %self.inner.id, "buffer pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Slot occupancy.
    pub fn stats(&self) -> BufferPoolStats {
        let state = self.inner.state.lock();
        BufferPoolStats {
            size: state.slots.len(),
            free: state.free.len(),
            in_flight: state.in_flight,
            filled: state.filled.len(),
        }
    }

    /// Access metrics counters for this pool.
    pub fn metrics(&self) -> BufferPoolMetrics {
        BufferPoolMetrics(self.metrics.clone())
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.inner.id)
            .field("slot_bytes", &self.inner.slot_bytes)
            .field("policy", &self.inner.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fill(pool: &BufferPool) -> SlotHandle {
        let slot = pool.acquire().expect("acquire");
        pool.recycle(slot, pool.slot_bytes()).expect("recycle");
        slot
    }

    #[test]
    fn full_cycle_returns_every_slot() {
        let pool = BufferPool::new(3, 8, ExhaustionPolicy::Block);
        let slots: Vec<_> = (0..3).map(|_| fill(&pool)).collect();
        assert_eq!(pool.stats().filled, 3);
        for slot in slots {
            pool.release(slot).expect("release");
        }
        let stats = pool.stats();
        assert_eq!(stats.free, stats.size);
        assert_eq!(pool.metrics().releases(), 3);
    }

    #[test]
    fn handles_from_another_pool_are_rejected() {
        let a = BufferPool::new(1, 4, ExhaustionPolicy::Block);
        let b = BufferPool::new(1, 4, ExhaustionPolicy::Block);
        let slot = fill(&a);
        assert!(matches!(b.release(slot), Err(PoolError::ForeignSlot { .. })));
        assert!(matches!(b.with_slot(slot, |_| ()), Err(PoolError::ForeignSlot { .. })));
        assert_eq!(a.state(slot), Ok(SlotState::FilledAwaitingConsumer));
    }

    #[test]
    fn free_slots_are_never_readable() {
        let pool = BufferPool::new(1, 4, ExhaustionPolicy::Block);
        let slot = pool.acquire().unwrap();
        assert!(matches!(
            pool.with_slot(slot, |_| ()),
            Err(PoolError::InvalidTransition { .. })
        ));
        pool.recycle(slot, 4).unwrap();
        pool.release(slot).unwrap();
        // the handle died with the release
        assert_eq!(pool.with_slot(slot, |_| ()), Err(PoolError::StaleSlot));
        assert_eq!(pool.release(slot), Err(PoolError::StaleSlot));
    }

    #[test]
    fn blocking_pool_reports_exhaustion_without_dropping() {
        let pool = BufferPool::new(1, 4, ExhaustionPolicy::Block);
        let first = fill(&pool);
        assert_eq!(pool.acquire(), Err(PoolError::Exhausted));
        assert_eq!(pool.state(first), Ok(SlotState::FilledAwaitingConsumer));
        assert_eq!(pool.metrics().drops(), 0);
        assert_eq!(pool.metrics().backpressure(), 1);
    }

    #[test]
    fn blocking_acquire_waits_for_consumer_release() {
        let pool = BufferPool::new(1, 4, ExhaustionPolicy::Block);
        let first = fill(&pool);
        let consumer = pool.clone();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            consumer.release(first).expect("release");
        });
        let second = pool
            .acquire_timeout(Duration::from_secs(2))
            .expect("slot after release");
        releaser.join().unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
    }

    #[test]
    fn blocking_acquire_times_out() {
        let pool = BufferPool::new(1, 4, ExhaustionPolicy::Block);
        let _held = pool.acquire().unwrap();
        assert_eq!(
            pool.acquire_timeout(Duration::from_millis(10)),
            Err(PoolError::AcquireTimeout(Duration::from_millis(10)))
        );
    }

    #[test]
    fn drop_oldest_evicts_the_oldest_unconsumed_frame() {
        let pool = BufferPool::new(2, 4, ExhaustionPolicy::DropOldest);
        let oldest = fill(&pool);
        let newer = fill(&pool);
        let reused = pool.acquire().expect("evicting acquire");
        assert_eq!(reused.index(), oldest.index());
        assert_eq!(pool.release(oldest), Err(PoolError::StaleSlot));
        assert_eq!(pool.state(newer), Ok(SlotState::FilledAwaitingConsumer));
        assert_eq!(pool.metrics().drops(), 1);
    }

    #[test]
    fn drop_oldest_never_evicts_in_flight_slots() {
        let pool = BufferPool::new(1, 4, ExhaustionPolicy::DropOldest);
        let _in_flight = pool.acquire().unwrap();
        assert_eq!(pool.acquire(), Err(PoolError::Exhausted));
    }

    #[test]
    fn drain_waits_for_in_flight_only() {
        let pool = BufferPool::new(2, 4, ExhaustionPolicy::Block);
        let _filled = fill(&pool);
        let in_flight = pool.acquire().unwrap();
        assert_eq!(
            pool.wait_for_drain(Duration::from_millis(10)),
            Err(PoolError::DrainTimeout {
                waited: Duration::from_millis(10),
                outstanding: 1
            })
        );
        let device = pool.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            device.recycle(in_flight, 4).unwrap();
        });
        pool.wait_for_drain(Duration::from_secs(2)).expect("drained");
        worker.join().unwrap();
    }

    #[test]
    fn close_returns_all_slots_and_rejects_handles() {
        let pool = BufferPool::new(3, 4, ExhaustionPolicy::Block);
        let filled = fill(&pool);
        let _in_flight = pool.acquire().unwrap();
        pool.close();
        let stats = pool.stats();
        assert_eq!(stats.free, stats.size);
        assert_eq!(pool.release(filled), Err(PoolError::Closed));
        assert_eq!(pool.acquire(), Err(PoolError::Closed));
    }
}
