use camlink_core::prelude::*;
use smallvec::SmallVec;

use crate::{
    DeviceStreamId,
    request::{RequestId, TriggerId},
};

/// Autofocus algorithm state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfState {
    #[default]
    Inactive,
    PassiveScan,
    PassiveFocused,
    ActiveScan,
    FocusedLocked,
    NotFocusedLocked,
}

impl AfState {
    /// A triggered scan has finished, successfully or not.
    pub fn is_locked(self) -> bool {
        matches!(self, AfState::FocusedLocked | AfState::NotFocusedLocked)
    }
}

/// Auto-exposure algorithm state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AeState {
    #[default]
    Inactive,
    Searching,
    Converged,
    Locked,
    FlashRequired,
    Precapture,
}

impl AeState {
    /// Precapture metering has finished.
    pub fn is_settled(self) -> bool {
        matches!(self, AeState::Converged | AeState::Locked | AeState::FlashRequired)
    }
}

/// Auto-white-balance algorithm state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AwbState {
    #[default]
    Inactive,
    Searching,
    Converged,
    Locked,
}

/// A face reported by the device, in array coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceMetadata {
    pub id: i32,
    /// Confidence 1..=100; zero means "no face".
    pub score: u8,
    pub rect: ArrayRect,
}

/// Results the device reports for one completed frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameMetadata {
    pub request_id: Option<RequestId>,
    pub frame_number: u64,
    /// Start of exposure, nanoseconds on the device clock.
    pub timestamp: u64,
    pub af_state: AfState,
    pub af_trigger_id: TriggerId,
    pub ae_state: AeState,
    pub ae_trigger_id: TriggerId,
    pub awb_state: AwbState,
    pub faces: Vec<FaceMetadata>,
    /// Crop region the frame was captured with; face rectangles are relative
    /// to the array, not to this region.
    pub crop: Option<CropRegion>,
    pub snapshot_version: u64,
}

/// A slot the device filled and recycled for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedBuffer {
    pub stream: DeviceStreamId,
    pub slot: SlotHandle,
    pub bytes_used: usize,
}

/// Everything the device produced for a frame, in completion order.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub metadata: FrameMetadata,
    pub buffers: SmallVec<[CompletedBuffer; 4]>,
}
