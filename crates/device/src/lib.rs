#![doc = include_str!("../README.md")]

use std::{fmt, sync::Weak, time::Duration};

use camlink_core::prelude::*;

pub mod metadata;
pub mod request;
pub mod virtual_device;

use metadata::{AeState, AfState, AwbState, CaptureResult};
use request::{CaptureRequest, TriggerId};

/// Device-assigned identifier of a configured output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceStreamId(pub u32);

impl fmt::Display for DeviceStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Logical consumer a stream serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StreamKind {
    /// Frames for a display surface.
    Preview,
    /// Raw frames copied out to the application.
    Callback,
    /// Still images.
    Capture,
    /// Frames for an encoder.
    Recording,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [
        StreamKind::Preview,
        StreamKind::Callback,
        StreamKind::Capture,
        StreamKind::Recording,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StreamKind::Preview => "preview",
            StreamKind::Callback => "callback",
            StreamKind::Capture => "capture",
            StreamKind::Recording => "recording",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything the device needs to register an output stream.
///
/// The device fills slots from `pool`; it may only acquire, write, recycle
/// and abandon slots, never release them.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub kind: StreamKind,
    pub format: StreamFormat,
    pub pool: BufferPool,
}

/// Formats and sizes the device can produce for one pixel code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamCapability {
    pub code: FourCc,
    pub sizes: Vec<Resolution>,
}

/// Static characteristics of a device.
///
/// # Example
/// ```rust
/// use camlink_device::prelude::*;
///
/// let info = DeviceInfo::virtual_default();
/// let preview = StreamFormat::new(FourCc::OPAQUE, Resolution::new(640, 480).unwrap());
/// assert!(info.supports(&preview));
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    /// Size of the active pixel array.
    pub active_array: Resolution,
    pub streams: Vec<StreamCapability>,
    pub fps_ranges: Vec<FpsRange>,
    /// Largest digital zoom ratio (1.0 means no zoom).
    pub max_digital_zoom: f32,
    /// Zero when face detection is unsupported.
    pub max_faces: u32,
    /// Fixed-focus devices ignore autofocus triggers.
    pub has_autofocus: bool,
}

impl DeviceInfo {
    /// Whether a stream of `format` can be configured.
    pub fn supports(&self, format: &StreamFormat) -> bool {
        self.sizes_for(format.code)
            .is_some_and(|sizes| sizes.contains(&format.resolution))
    }

    /// Sizes advertised for `code`.
    pub fn sizes_for(&self, code: FourCc) -> Option<&[Resolution]> {
        self.streams
            .iter()
            .find(|cap| cap.code == code)
            .map(|cap| cap.sizes.as_slice())
    }

    /// A 4000x3000 sensor with VGA/720p/1080p streams, JPEG stills and face detection.
    pub fn virtual_default() -> Self {
        let res = |w, h| Resolution::new(w, h).unwrap_or(Resolution::MIN);
        let video_sizes = vec![res(320, 240), res(640, 480), res(1280, 720), res(1920, 1080)];
        Self {
            active_array: res(4000, 3000),
            streams: vec![
                StreamCapability {
                    code: FourCc::OPAQUE,
                    sizes: video_sizes.clone(),
                },
                StreamCapability {
                    code: FourCc::NV21,
                    sizes: video_sizes.clone(),
                },
                StreamCapability {
                    code: FourCc::YV12,
                    sizes: video_sizes,
                },
                StreamCapability {
                    code: FourCc::JPEG,
                    sizes: vec![res(640, 480), res(1920, 1080), res(4000, 3000)],
                },
            ],
            fps_ranges: vec![FpsRange { min: 15, max: 30 }, FpsRange { min: 30, max: 30 }],
            max_digital_zoom: 4.0,
            max_faces: 8,
            has_autofocus: true,
        }
    }
}

/// Error classes passed through `DeviceListener::on_device_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorCode {
    /// The hardware failed; the device is unusable.
    Hardware,
    /// The device failed; it must be closed and reopened.
    Device,
    /// A single request failed.
    Request,
    /// A single frame's metadata was lost.
    Frame,
    /// A single output buffer was lost.
    Buffer,
    /// A stream failed.
    Stream,
}

impl DeviceErrorCode {
    /// Whether the failure leaves configured streams unusable.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            DeviceErrorCode::Hardware | DeviceErrorCode::Device | DeviceErrorCode::Stream
        )
    }
}

/// Errors returned by device control calls.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("device busy")]
    Busy,
    #[error("unsupported stream configuration: {0}")]
    Unsupported(String),
    #[error("{0} is not configured")]
    NoSuchStream(DeviceStreamId),
    #[error("request rejected: {0}")]
    InvalidRequest(String),
    #[error("no free buffer for {0}")]
    ResourceExhausted(DeviceStreamId),
    #[error("device fault ({code:?}): {message}")]
    Fault {
        code: DeviceErrorCode,
        message: String,
    },
    #[error("device disconnected")]
    Disconnected,
}

impl DeviceError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            DeviceError::Busy => "busy",
            DeviceError::Unsupported(_) => "unsupported",
            DeviceError::NoSuchStream(_) => "no_such_stream",
            DeviceError::InvalidRequest(_) => "invalid_request",
            DeviceError::ResourceExhausted(_) => "resource_exhausted",
            DeviceError::Fault { .. } => "fault",
            DeviceError::Disconnected => "disconnected",
        }
    }

    /// Whether the call may succeed when retried.
    pub fn retryable(&self) -> bool {
        matches!(self, DeviceError::Busy | DeviceError::ResourceExhausted(_))
    }
}

/// Asynchronous events raised by the device.
///
/// Called from device-owned threads; implementations must return quickly
/// and must not block on client operations.
pub trait DeviceListener: Send + Sync {
    fn on_device_error(&self, code: DeviceErrorCode, arg1: i32, arg2: i32);
    /// Exposure of a still-capture frame has started.
    fn on_shutter(&self, frame_number: u64, timestamp: u64);
    fn on_auto_focus_state_change(&self, state: AfState, trigger: TriggerId);
    fn on_auto_exposure_state_change(&self, state: AeState, trigger: TriggerId);
    fn on_auto_white_balance_state_change(&self, state: AwbState, trigger: TriggerId);
}

/// Control surface of a camera device.
///
/// One-shot requests submitted with [`CameraDevice::capture`] are processed
/// ahead of the repeating request, which resumes unchanged afterwards.
pub trait CameraDevice: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    /// Register the receiver of asynchronous events.
    fn set_listener(&self, listener: Weak<dyn DeviceListener>);

    fn create_stream(&self, config: StreamConfig) -> Result<DeviceStreamId, DeviceError>;

    /// Remove a stream. In-flight slots of the stream are abandoned.
    fn delete_stream(&self, id: DeviceStreamId) -> Result<(), DeviceError>;

    /// Replace the request repeated whenever no one-shot is pending.
    fn set_repeating_request(&self, request: CaptureRequest) -> Result<(), DeviceError>;

    fn clear_repeating_request(&self) -> Result<(), DeviceError>;

    /// Queue a one-shot request.
    fn capture(&self, request: CaptureRequest) -> Result<(), DeviceError>;

    /// Wait up to `timeout` for the next completed frame.
    fn next_result(&self, timeout: Duration) -> Result<Option<CaptureResult>, DeviceError>;
}

pub mod prelude {
    pub use crate::{
        CameraDevice, DeviceError, DeviceErrorCode, DeviceInfo, DeviceListener, DeviceStreamId,
        StreamCapability, StreamConfig, StreamKind,
        metadata::{
            AeState, AfState, AwbState, CaptureResult, CompletedBuffer, FaceMetadata,
            FrameMetadata,
        },
        request::{
            AePrecaptureTrigger, AfMode, AfTrigger, CaptureRequest, FlashMode, MeteringRegion,
            RequestId, RequestIntent, RequestSettings, TriggerId,
        },
        virtual_device::{DeviceEvent, VirtualDevice, VirtualDeviceConfig, VirtualDriver},
    };
    pub use camlink_core::prelude::*;
}
