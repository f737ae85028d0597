use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight counters for buffer-pool traffic and backpressure.
///
/// # Example
/// ```rust
/// use camlink_core::metrics::Metrics;
///
/// let metrics = Metrics::default();
/// metrics.acquired();
/// metrics.exhausted();
/// assert_eq!(metrics.acquisitions(), 1);
/// assert_eq!(metrics.backpressure_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    acquisitions: AtomicU64,
    recycles: AtomicU64,
    releases: AtomicU64,
    backpressure: AtomicU64,
    drops: AtomicU64,
}

impl Metrics {
    /// A slot was handed to the device.
    pub fn acquired(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    /// The device returned a filled slot.
    pub fn recycled(&self) {
        self.recycles.fetch_add(1, Ordering::Relaxed);
    }

    /// A consumer gave a slot back.
    pub fn released(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// An acquire found no free slot.
    pub fn exhausted(&self) {
        self.backpressure.fetch_add(1, Ordering::Relaxed);
    }

    /// An unconsumed frame was evicted to make room.
    pub fn dropped(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    pub fn recycles(&self) -> u64 {
        self.recycles.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    /// Snapshot of backpressure events.
    pub fn backpressure_count(&self) -> u64 {
        self.backpressure.load(Ordering::Relaxed)
    }

    /// Snapshot of frames dropped by eviction.
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

impl Clone for Metrics {
    fn clone(&self) -> Self {
        let cloned = Metrics::default();
        cloned
            .acquisitions
            .store(self.acquisitions(), Ordering::Relaxed);
        cloned.recycles.store(self.recycles(), Ordering::Relaxed);
        cloned.releases.store(self.releases(), Ordering::Relaxed);
        cloned
            .backpressure
            .store(self.backpressure_count(), Ordering::Relaxed);
        cloned.drops.store(self.drop_count(), Ordering::Relaxed);
        cloned
    }
}
