use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

const DEFAULT_WINDOW: usize = 120;

/// Rolling timing and counters for the frame processor.
///
/// # Example
/// ```rust
/// use camlink::prelude::FrameMetrics;
///
/// let metrics = FrameMetrics::default();
/// metrics.record(std::time::Duration::from_millis(2));
/// metrics.stale();
/// assert_eq!(metrics.frames(), 1);
/// assert_eq!(metrics.stale_frames(), 1);
/// ```
#[derive(Default, Clone)]
pub struct FrameMetrics {
    inner: Arc<FrameState>,
}

#[derive(Default)]
struct FrameState {
    frames: AtomicU64,
    stale: AtomicU64,
    last_nanos: AtomicU64,
    window: Mutex<WindowState>,
}

struct WindowState {
    samples: VecDeque<(Instant, u64)>,
    max: usize,
}

impl Default for WindowState {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
            max: DEFAULT_WINDOW,
        }
    }
}

impl FrameMetrics {
    /// Record the time spent processing one frame.
    pub fn record(&self, dur: Duration) {
        let nanos = dur.as_nanos().min(u64::MAX as u128) as u64;
        self.inner.frames.fetch_add(1, Ordering::Relaxed);
        self.inner.last_nanos.store(nanos, Ordering::Relaxed);
        let mut win = self.inner.window.lock();
        win.samples.push_back((Instant::now(), nanos));
        while win.samples.len() > win.max {
            win.samples.pop_front();
        }
    }

    /// Count a frame dropped as stale.
    pub fn stale(&self) {
        self.inner.stale.fetch_add(1, Ordering::Relaxed);
    }

    /// Change the window size used for rolling averages/fps. Minimum of 1.
    pub fn set_window_size(&self, window: usize) {
        let mut win = self.inner.window.lock();
        win.max = window.max(1);
        while win.samples.len() > win.max {
            win.samples.pop_front();
        }
    }

    /// Frames processed over the lifetime.
    pub fn frames(&self) -> u64 {
        self.inner.frames.load(Ordering::Relaxed)
    }

    pub fn stale_frames(&self) -> u64 {
        self.inner.stale.load(Ordering::Relaxed)
    }

    /// Rolling average processing time in milliseconds.
    pub fn avg_millis(&self) -> Option<f64> {
        let win = self.inner.window.lock();
        let count = win.samples.len();
        if count == 0 {
            return None;
        }
        let total: u128 = win.samples.iter().map(|(_, n)| *n as u128).sum();
        Some(total as f64 / 1_000_000.0 / count as f64)
    }

    /// Most recent sample in milliseconds.
    pub fn last_millis(&self) -> Option<f64> {
        match self.inner.last_nanos.load(Ordering::Relaxed) {
            0 => None,
            last => Some(last as f64 / 1_000_000.0),
        }
    }

    /// Rolling frame rate based on sample timestamps.
    pub fn fps(&self) -> Option<f64> {
        let win = self.inner.window.lock();
        if win.samples.len() < 2 {
            return None;
        }
        let first = win.samples.front()?.0;
        let last = win.samples.back()?.0;
        let span = last.saturating_duration_since(first).as_secs_f64();
        (span > 0.0).then(|| win.samples.len() as f64 / span)
    }
}
