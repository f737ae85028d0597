use std::time::Duration;

/// Default preview stream depth (slots).
pub const DEFAULT_PREVIEW_BUFFERS: usize = 2;
/// Default callback stream depth (slots).
pub const DEFAULT_CALLBACK_BUFFERS: usize = 6;
/// Default still-capture stream depth (slots).
pub const DEFAULT_CAPTURE_BUFFERS: usize = 1;
/// Default recording stream depth (slots).
pub const DEFAULT_RECORDING_BUFFERS: usize = 8;
/// Default bound on waiting for in-flight buffers during teardown (milliseconds).
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 1_000;
/// Default wait for a device result per frame-loop iteration (milliseconds).
pub const DEFAULT_FRAME_WAIT_MS: u64 = 10;
/// Default wait for the operation lock when tearing down after a fault (milliseconds).
pub const DEFAULT_FAULT_LOCK_WAIT_MS: u64 = 50;
/// Default depth of a [`NotificationQueue`](crate::notify::NotificationQueue).
pub const DEFAULT_NOTIFY_QUEUE_DEPTH: usize = 64;

/// Per-client buffer and timing knobs.
///
/// # Example
/// ```rust
/// use camlink::prelude::*;
///
/// let tunables = ClientTunables::default();
/// assert_eq!(tunables.callback_buffers, 6);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ClientTunables {
    pub preview_buffers: usize,
    pub callback_buffers: usize,
    pub capture_buffers: usize,
    pub drain_timeout_ms: u64,
    pub frame_wait_ms: u64,
    pub fault_lock_wait_ms: u64,
}

impl Default for ClientTunables {
    fn default() -> Self {
        Self {
            preview_buffers: DEFAULT_PREVIEW_BUFFERS,
            callback_buffers: DEFAULT_CALLBACK_BUFFERS,
            capture_buffers: DEFAULT_CAPTURE_BUFFERS,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            frame_wait_ms: DEFAULT_FRAME_WAIT_MS,
            fault_lock_wait_ms: DEFAULT_FAULT_LOCK_WAIT_MS,
        }
    }
}

impl ClientTunables {
    pub(crate) fn sanitized(self) -> Self {
        Self {
            preview_buffers: self.preview_buffers.max(1),
            callback_buffers: self.callback_buffers.max(1),
            capture_buffers: self.capture_buffers.max(1),
            drain_timeout_ms: self.drain_timeout_ms.max(1),
            frame_wait_ms: self.frame_wait_ms.clamp(1, 1_000),
            fault_lock_wait_ms: self.fault_lock_wait_ms.max(1),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn frame_wait(&self) -> Duration {
        Duration::from_millis(self.frame_wait_ms)
    }

    pub fn fault_lock_wait(&self) -> Duration {
        Duration::from_millis(self.fault_lock_wait_ms)
    }
}

/// Builder for [`ClientTunables`].
///
/// # Example
/// ```rust
/// use camlink::prelude::*;
///
/// let tunables = ClientConfig::new()
///     .callback_buffers(3)
///     .drain_timeout_ms(250)
///     .build();
/// assert_eq!(tunables.callback_buffers, 3);
/// assert_eq!(tunables.drain_timeout().as_millis(), 250);
/// ```
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ClientConfig {
    tunables: ClientTunables,
}

impl ClientConfig {
    /// Start from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preview_buffers(mut self, count: usize) -> Self {
        self.tunables.preview_buffers = count;
        self
    }

    pub fn callback_buffers(mut self, count: usize) -> Self {
        self.tunables.callback_buffers = count;
        self
    }

    pub fn capture_buffers(mut self, count: usize) -> Self {
        self.tunables.capture_buffers = count;
        self
    }

    /// Bound on waiting for the device to return buffers before a stream is
    /// deleted.
    pub fn drain_timeout_ms(mut self, ms: u64) -> Self {
        self.tunables.drain_timeout_ms = ms;
        self
    }

    pub fn frame_wait_ms(mut self, ms: u64) -> Self {
        self.tunables.frame_wait_ms = ms;
        self
    }

    pub fn fault_lock_wait_ms(mut self, ms: u64) -> Self {
        self.tunables.fault_lock_wait_ms = ms;
        self
    }

    /// Sanitized tunables; zero counts and waits are raised to their minimum.
    pub fn build(self) -> ClientTunables {
        self.tunables.sanitized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroes_are_sanitized() {
        let tunables = ClientConfig::new()
            .preview_buffers(0)
            .capture_buffers(0)
            .drain_timeout_ms(0)
            .frame_wait_ms(0)
            .build();
        assert_eq!(tunables.preview_buffers, 1);
        assert_eq!(tunables.capture_buffers, 1);
        assert_eq!(tunables.drain_timeout(), Duration::from_millis(1));
        assert_eq!(tunables.frame_wait(), Duration::from_millis(1));
    }
}
