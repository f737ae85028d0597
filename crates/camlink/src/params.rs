//! Immutable, versioned configuration snapshots.
//!
//! A snapshot is never mutated once committed. Writers build a modified copy
//! and commit it, which stamps the next version; readers (and every request
//! built from a snapshot) keep the `Arc` they already hold.

use std::sync::Arc;

use camlink_core::prelude::*;
use camlink_device::{
    DeviceInfo,
    request::{AfMode, FlashMode},
};
use parking_lot::RwLock;

use crate::{error::ClientError, tunables::DEFAULT_RECORDING_BUFFERS};

/// Discrete zoom positions; step 0 is the full array.
pub const NUM_ZOOM_STEPS: u32 = 10;

/// Focus behavior selected by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FocusMode {
    #[default]
    Auto,
    Infinity,
    Macro,
    Fixed,
    Edof,
    ContinuousVideo,
    ContinuousPicture,
}

impl FocusMode {
    pub fn af_mode(self) -> AfMode {
        match self {
            FocusMode::Auto => AfMode::Auto,
            FocusMode::Macro => AfMode::Macro,
            FocusMode::ContinuousVideo => AfMode::ContinuousVideo,
            FocusMode::ContinuousPicture => AfMode::ContinuousPicture,
            FocusMode::Edof => AfMode::Edof,
            FocusMode::Infinity | FocusMode::Fixed => AfMode::Off,
        }
    }

    /// Modes where an autofocus request succeeds without scanning.
    pub fn is_fixed(self) -> bool {
        matches!(self, FocusMode::Infinity | FocusMode::Fixed | FocusMode::Edof)
    }

    pub fn is_continuous(self) -> bool {
        self.af_mode().is_continuous()
    }
}

/// How preview frames are handed to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CallbackFlags {
    pub enabled: bool,
    /// Deliver a single frame, then stop.
    pub one_shot: bool,
    /// The application copies frames out instead of holding slots.
    pub copy_out: bool,
}

impl CallbackFlags {
    pub const ENABLE_MASK: u32 = 0x01;
    pub const ONE_SHOT_MASK: u32 = 0x02;
    pub const COPY_OUT_MASK: u32 = 0x04;

    /// Decode the application-facing bitmask.
    pub fn from_bits(bits: u32) -> Self {
        Self {
            enabled: bits & Self::ENABLE_MASK != 0,
            one_shot: bits & Self::ONE_SHOT_MASK != 0,
            copy_out: bits & Self::COPY_OUT_MASK != 0,
        }
    }

    pub fn bits(&self) -> u32 {
        (self.enabled as u32 * Self::ENABLE_MASK)
            | (self.one_shot as u32 * Self::ONE_SHOT_MASK)
            | (self.copy_out as u32 * Self::COPY_OUT_MASK)
    }
}

/// Weighted focus or metering region in normalized coordinates.
///
/// A zero weight means "let the device decide" and is not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeteringArea {
    pub rect: NormalizedRect,
    pub weight: u32,
}

impl MeteringArea {
    pub const MAX_WEIGHT: u32 = 1000;
}

/// Typed, validated configuration the client runs with.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Parameters {
    version: u64,
    pub preview: StreamFormat,
    pub picture: StreamFormat,
    pub video: StreamFormat,
    /// Pixel format of callback frames; they use the preview size.
    pub callback_code: FourCc,
    pub fps_range: FpsRange,
    pub zoom: u32,
    pub focus_mode: FocusMode,
    pub flash_mode: FlashMode,
    pub auto_exposure_lock: bool,
    pub auto_white_balance_lock: bool,
    pub exposure_compensation: i32,
    pub focusing_areas: Vec<MeteringArea>,
    pub metering_areas: Vec<MeteringArea>,
    pub callback_flags: CallbackFlags,
    pub store_metadata_in_buffers: bool,
    pub video_buffer_count: usize,
    pub face_detection: bool,
    pub play_shutter_sound: bool,
    pub focus_move_messages: bool,
    pub display_orientation: u32,
}

impl Parameters {
    /// Defaults derived from what the device advertises.
    pub fn defaults_for(info: &DeviceInfo) -> Self {
        let pick = |code: FourCc, preferred: (u32, u32)| {
            let preferred = Resolution::new(preferred.0, preferred.1).unwrap_or(Resolution::MIN);
            let size = info
                .sizes_for(code)
                .and_then(|sizes| {
                    sizes
                        .iter()
                        .find(|size| **size == preferred)
                        .or_else(|| sizes.first())
                        .copied()
                })
                .unwrap_or(preferred);
            StreamFormat::new(code, size)
        };
        let largest_jpeg = info
            .sizes_for(FourCc::JPEG)
            .and_then(|sizes| sizes.iter().max_by_key(|size| size.pixel_count()).copied())
            .unwrap_or(info.active_array);
        Self {
            version: 0,
            preview: pick(FourCc::OPAQUE, (640, 480)),
            picture: StreamFormat::new(FourCc::JPEG, largest_jpeg),
            video: pick(FourCc::OPAQUE, (1280, 720)),
            callback_code: FourCc::NV21,
            fps_range: info.fps_ranges.first().copied().unwrap_or_default(),
            zoom: 0,
            focus_mode: if info.has_autofocus {
                FocusMode::Auto
            } else {
                FocusMode::Fixed
            },
            flash_mode: FlashMode::Off,
            auto_exposure_lock: false,
            auto_white_balance_lock: false,
            exposure_compensation: 0,
            focusing_areas: Vec::new(),
            metering_areas: Vec::new(),
            callback_flags: CallbackFlags::default(),
            store_metadata_in_buffers: false,
            video_buffer_count: DEFAULT_RECORDING_BUFFERS,
            face_detection: false,
            play_shutter_sound: true,
            focus_move_messages: false,
            display_orientation: 0,
        }
    }

    /// Version stamped at commit; zero for snapshots never committed.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Format of the callback stream.
    pub fn callback_format(&self) -> StreamFormat {
        StreamFormat::new(self.callback_code, self.preview.resolution)
    }

    /// Digital zoom ratio for the current zoom step.
    pub fn zoom_ratio(&self, info: &DeviceInfo) -> f32 {
        let step = self.zoom.min(NUM_ZOOM_STEPS - 1) as f32;
        1.0 + (info.max_digital_zoom.max(1.0) - 1.0) * step / (NUM_ZOOM_STEPS - 1) as f32
    }

    /// Check the snapshot against device capabilities.
    pub fn validate(&self, info: &DeviceInfo) -> Result<(), ClientError> {
        for (what, format) in [
            ("preview", self.preview),
            ("picture", self.picture),
            ("video", self.video),
            ("callback", self.callback_format()),
        ] {
            if !info.supports(&format) {
                return Err(ClientError::ConfigurationRejected(format!(
                    "{what} format {format} not supported"
                )));
            }
        }
        if !info.fps_ranges.is_empty() && !info.fps_ranges.contains(&self.fps_range) {
            return Err(ClientError::ConfigurationRejected(format!(
                "fps range {}-{} not supported",
                self.fps_range.min, self.fps_range.max
            )));
        }
        if self.zoom >= NUM_ZOOM_STEPS {
            return Err(ClientError::ConfigurationRejected(format!(
                "zoom step {} out of range 0..{NUM_ZOOM_STEPS}",
                self.zoom
            )));
        }
        if !info.has_autofocus && !matches!(self.focus_mode, FocusMode::Fixed | FocusMode::Infinity) {
            return Err(ClientError::ConfigurationRejected(format!(
                "focus mode {:?} needs an autofocus lens",
                self.focus_mode
            )));
        }
        for area in self.focusing_areas.iter().chain(&self.metering_areas) {
            if area.weight > MeteringArea::MAX_WEIGHT || !area.rect.is_valid() {
                return Err(ClientError::ConfigurationRejected(format!(
                    "invalid area {area:?}"
                )));
            }
        }
        if self.video_buffer_count == 0 {
            return Err(ClientError::ConfigurationRejected(
                "video buffer count must be at least 1".into(),
            ));
        }
        if self.display_orientation % 90 != 0 || self.display_orientation >= 360 {
            return Err(ClientError::ConfigurationRejected(format!(
                "display orientation {} is not a multiple of 90 below 360",
                self.display_orientation
            )));
        }
        Ok(())
    }
}

/// Copy-on-write holder of the current snapshot.
///
/// # Example
/// ```rust
/// use camlink::prelude::*;
///
/// let info = DeviceInfo::virtual_default();
/// let shared = SharedParameters::new(Parameters::defaults_for(&info));
/// let before = shared.snapshot();
/// let after = shared.update(|p| p.zoom = 3);
/// assert_eq!(before.zoom, 0);
/// assert_eq!(after.zoom, 3);
/// assert!(after.version() > before.version());
/// ```
pub struct SharedParameters {
    current: RwLock<Arc<Parameters>>,
}

impl SharedParameters {
    /// Commit `initial` as version 1.
    pub fn new(mut initial: Parameters) -> Self {
        initial.version = 1;
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Parameters> {
        self.current.read().clone()
    }

    /// Replace the current snapshot, stamping the next version.
    pub fn commit(&self, mut next: Parameters) -> Arc<Parameters> {
        let mut current = self.current.write();
        next.version = current.version + 1;
        let next = Arc::new(next);
        *current = next.clone();
        next
    }

    /// Clone the current snapshot, modify the copy and commit it.
    pub fn update(&self, f: impl FnOnce(&mut Parameters)) -> Arc<Parameters> {
        let mut current = self.current.write();
        let mut next = Parameters::clone(&current);
        f(&mut next);
        next.version = current.version + 1;
        let next = Arc::new(next);
        *current = next.clone();
        next
    }
}
