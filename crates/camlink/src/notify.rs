//! Application-facing events and the sinks that receive them.

use std::{fmt, time::Duration};

use camlink_core::prelude::*;
use camlink_device::{DeviceErrorCode, DeviceStreamId, StreamKind, request::TriggerId};
use tracing::warn;

use crate::tunables::DEFAULT_NOTIFY_QUEUE_DEPTH;

/// A filled buffer handed to the application.
///
/// Callback and recording buffers stay owned by the application until
/// returned with [`CameraClient::release_buffer`](crate::CameraClient::release_buffer)
/// or [`CameraClient::release_recording_frame`](crate::CameraClient::release_recording_frame).
/// Still-capture buffers are returned the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveredBuffer {
    pub kind: StreamKind,
    pub stream: DeviceStreamId,
    pub slot: SlotHandle,
    pub frame_number: u64,
    pub timestamp: u64,
    pub bytes_used: usize,
    pub payload: BufferPayload,
}

/// What the application may do with a held slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferPayload {
    /// Bytes are readable through
    /// [`CameraClient::read_buffer`](crate::CameraClient::read_buffer).
    #[default]
    Bytes,
    /// Recording frame in metadata mode: the slot is a reference for a
    /// consumer that reads it from the device, and its bytes are not exposed.
    Metadata,
}

/// A callback frame copied out of its slot; the slot is already back in
/// the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedFrame {
    pub stream: DeviceStreamId,
    pub frame_number: u64,
    pub timestamp: u64,
    pub data: Vec<u8>,
}

/// A detected face in normalized coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Face {
    pub id: i32,
    pub score: u8,
    pub rect: NormalizedRect,
}

/// Events delivered to a [`ClientListener`].
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Exposure of a still capture started.
    Shutter {
        frame_number: u64,
        timestamp: u64,
        play_sound: bool,
    },
    PictureTaken(DeliveredBuffer),
    PreviewFrame(DeliveredBuffer),
    /// Callback frame delivered in copy-out mode.
    PreviewFrameCopy(CopiedFrame),
    RecordingFrame(DeliveredBuffer),
    /// Outcome of an autofocus request.
    AutoFocus { focused: bool, trigger_id: TriggerId },
    /// Continuous focus started or stopped moving the lens.
    FocusMoving { moving: bool },
    /// Precapture metering for a still capture finished.
    AutoExposure { settled: bool, trigger_id: TriggerId },
    Faces(Vec<Face>),
    Error {
        code: DeviceErrorCode,
        arg1: i32,
        arg2: i32,
    },
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Shutter { .. } => "shutter",
            Notification::PictureTaken(_) => "picture_taken",
            Notification::PreviewFrame(_) => "preview_frame",
            Notification::PreviewFrameCopy(_) => "preview_frame_copy",
            Notification::RecordingFrame(_) => "recording_frame",
            Notification::AutoFocus { .. } => "auto_focus",
            Notification::FocusMoving { .. } => "focus_moving",
            Notification::AutoExposure { .. } => "auto_exposure",
            Notification::Faces(_) => "faces",
            Notification::Error { .. } => "error",
        }
    }

    /// The held slot this notification hands over, if any.
    pub fn buffer(&self) -> Option<&DeliveredBuffer> {
        match self {
            Notification::PictureTaken(buffer)
            | Notification::PreviewFrame(buffer)
            | Notification::RecordingFrame(buffer) => Some(buffer),
            _ => None,
        }
    }
}

/// Receiver of client events.
///
/// Called from the frame thread and from device threads, never while a
/// client lock is held. Implementations must not block for long.
pub trait ClientListener: Send + Sync {
    /// Returns whether the notification was accepted. The slot of a refused
    /// [`Notification::buffer`] is returned to its pool by the client.
    fn notify(&self, notification: Notification) -> bool;
}

/// Identity of a display surface; setting the same surface twice is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

/// Display target for preview frames.
pub trait PreviewSurface: Send + Sync {
    fn id(&self) -> SurfaceId;
    /// Copy one frame out; the slot is released when this returns.
    fn queue_frame(&self, frame: &[u8], timestamp: u64);
    fn set_orientation(&self, _degrees: u32) {}
}

/// [`ClientListener`] that buffers notifications for polling.
///
/// When the queue is full new notifications are refused with a warning.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use camlink::prelude::*;
///
/// let queue = NotificationQueue::new(4);
/// queue.notify(Notification::FocusMoving { moving: true });
/// assert_eq!(
///     queue.recv_timeout(Duration::from_millis(10)),
///     Some(Notification::FocusMoving { moving: true })
/// );
/// assert!(queue.recv_timeout(Duration::from_millis(1)).is_none());
/// ```
pub struct NotificationQueue {
    tx: BoundedTx<Notification>,
    rx: BoundedRx<Notification>,
}

impl NotificationQueue {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = bounded(depth.max(1));
        Self { tx, rx }
    }

    /// Next notification without waiting.
    pub fn try_recv(&self) -> Option<Notification> {
        match self.rx.recv() {
            RecvOutcome::Data(notification) => Some(notification),
            RecvOutcome::Empty | RecvOutcome::Closed => None,
        }
    }

    /// Next notification, waiting up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Notification> {
        match self.rx.recv_timeout(timeout) {
            RecvOutcome::Data(notification) => Some(notification),
            RecvOutcome::Empty | RecvOutcome::Closed => None,
        }
    }

    /// Wait up to `timeout` for a notification matching `pred`, discarding
    /// the ones before it.
    pub fn wait_for(
        &self,
        timeout: Duration,
        mut pred: impl FnMut(&Notification) -> bool,
    ) -> Option<Notification> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            let notification = self.recv_timeout(left)?;
            if pred(&notification) {
                return Some(notification);
            }
        }
    }

    /// Everything currently queued.
    pub fn drain(&self) -> Vec<Notification> {
        self.rx.drain()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Next notification, yielding to the runtime while the queue is empty.
    #[cfg(feature = "async")]
    pub async fn recv_async(&self) -> Option<Notification> {
        match self.rx.recv_async().await {
            RecvOutcome::Data(notification) => Some(notification),
            RecvOutcome::Empty | RecvOutcome::Closed => None,
        }
    }
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFY_QUEUE_DEPTH)
    }
}

impl ClientListener for NotificationQueue {
    fn notify(&self, notification: Notification) -> bool {
        let name = notification.name();
        match self.tx.send(notification) {
            SendOutcome::Ok => true,
            SendOutcome::Full => {
                warn!(event = name, "notification queue full, refusing event");
                false
            }
            SendOutcome::Closed => false,
        }
    }
}
