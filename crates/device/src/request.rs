use std::fmt;

use camlink_core::prelude::*;
use smallvec::SmallVec;

use crate::{DeviceError, DeviceStreamId};

/// Identifier the device echoes back in the metadata of every frame it
/// produces for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub i32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Identifier correlating a 3A trigger with the state changes it causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TriggerId(pub i32);

/// Why a request was issued; devices use it for shutter timing and tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestIntent {
    Preview,
    Record,
    StillCapture,
    VideoSnapshot,
    /// Carries a 3A trigger and nothing else of note.
    Trigger,
}

impl RequestIntent {
    /// Whether the device emits a shutter event for frames of this intent.
    pub fn fires_shutter(self) -> bool {
        matches!(self, RequestIntent::StillCapture | RequestIntent::VideoSnapshot)
    }
}

/// Autofocus algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AfMode {
    Off,
    Auto,
    Macro,
    ContinuousVideo,
    ContinuousPicture,
    Edof,
}

impl AfMode {
    pub fn is_continuous(self) -> bool {
        matches!(self, AfMode::ContinuousVideo | AfMode::ContinuousPicture)
    }
}

/// Flash behavior requested from the exposure algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FlashMode {
    #[default]
    Off,
    Auto,
    On,
    Torch,
    RedEye,
}

impl FlashMode {
    /// Whether a still capture should run an exposure precapture sequence first.
    pub fn needs_precapture(self) -> bool {
        matches!(self, FlashMode::Auto | FlashMode::On | FlashMode::RedEye)
    }
}

/// One-shot autofocus control carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfTrigger {
    #[default]
    Idle,
    Start(TriggerId),
    Cancel(TriggerId),
}

/// One-shot exposure precapture control carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AePrecaptureTrigger {
    #[default]
    Idle,
    Start(TriggerId),
}

/// Weighted region in array coordinates for focus or metering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeteringRegion {
    pub rect: ArrayRect,
    pub weight: u32,
}

/// Per-frame controls, copied by value from a configuration snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSettings {
    pub fps_range: FpsRange,
    pub crop: CropRegion,
    pub af_mode: AfMode,
    pub af_trigger: AfTrigger,
    pub ae_trigger: AePrecaptureTrigger,
    pub ae_lock: bool,
    pub awb_lock: bool,
    pub exposure_compensation: i32,
    pub flash_mode: FlashMode,
    pub af_regions: SmallVec<[MeteringRegion; 4]>,
    pub ae_regions: SmallVec<[MeteringRegion; 4]>,
    pub face_detect: bool,
}

impl RequestSettings {
    /// Neutral settings over `crop`.
    pub fn new(crop: CropRegion) -> Self {
        Self {
            fps_range: FpsRange::default(),
            crop,
            af_mode: AfMode::Auto,
            af_trigger: AfTrigger::Idle,
            ae_trigger: AePrecaptureTrigger::Idle,
            ae_lock: false,
            awb_lock: false,
            exposure_compensation: 0,
            flash_mode: FlashMode::Off,
            af_regions: SmallVec::new(),
            ae_regions: SmallVec::new(),
            face_detect: false,
        }
    }
}

/// A unit of work for the device: settings plus the streams it fills.
///
/// A request always targets at least one stream. It records the version of
/// the configuration snapshot it was derived from; its settings never change
/// after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    request_id: RequestId,
    targets: SmallVec<[DeviceStreamId; 4]>,
    settings: RequestSettings,
    repeating: bool,
    intent: RequestIntent,
    snapshot_version: u64,
}

impl CaptureRequest {
    pub fn new(
        request_id: RequestId,
        targets: impl IntoIterator<Item = DeviceStreamId>,
        settings: RequestSettings,
        intent: RequestIntent,
        repeating: bool,
        snapshot_version: u64,
    ) -> Result<Self, DeviceError> {
        let mut unique: SmallVec<[DeviceStreamId; 4]> = SmallVec::new();
        for target in targets {
            if !unique.contains(&target) {
                unique.push(target);
            }
        }
        if unique.is_empty() {
            return Err(DeviceError::InvalidRequest(format!(
                "{request_id} has no output streams"
            )));
        }
        Ok(Self {
            request_id,
            targets: unique,
            settings,
            repeating,
            intent,
            snapshot_version,
        })
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn targets(&self) -> &[DeviceStreamId] {
        &self.targets
    }

    pub fn settings(&self) -> &RequestSettings {
        &self.settings
    }

    pub fn is_repeating(&self) -> bool {
        self.repeating
    }

    pub fn intent(&self) -> RequestIntent {
        self.intent
    }

    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }
}
