//! Derives device requests from configuration snapshots.

use camlink_core::prelude::*;
use camlink_device::{
    DeviceInfo, DeviceStreamId,
    request::{
        AePrecaptureTrigger, AfTrigger, CaptureRequest, MeteringRegion, RequestId, RequestIntent,
        RequestSettings, TriggerId,
    },
};
use smallvec::SmallVec;

use crate::{
    error::ClientError,
    params::{MeteringArea, Parameters},
};

pub const PREVIEW_REQUEST_ID: RequestId = RequestId(1000);
pub const RECORDING_REQUEST_ID: RequestId = RequestId(2000);
const CAPTURE_REQUEST_IDS: (i32, i32) = (3000, 3999);
const TRIGGER_REQUEST_IDS: (i32, i32) = (4000, 4999);

/// Crop the sensor reads out at the snapshot's zoom step.
pub fn zoom_crop(info: &DeviceInfo, params: &Parameters) -> CropRegion {
    CropRegion::for_zoom(info.active_array, params.zoom_ratio(info))
}

/// Builds preview, recording, still-capture and trigger requests.
///
/// Every request copies its settings out of the snapshot it is built from
/// and records that snapshot's version.
///
/// # Example
/// ```rust
/// use camlink::prelude::*;
///
/// let info = DeviceInfo::virtual_default();
/// let params = Parameters::defaults_for(&info);
/// let builder = RequestBuilder::new(&info);
/// let request = builder.preview(&params, &[DeviceStreamId(1)], false).unwrap();
/// assert_eq!(request.request_id(), PREVIEW_REQUEST_ID);
/// assert!(request.is_repeating());
/// ```
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    info: DeviceInfo,
    next_capture: i32,
    next_trigger: i32,
}

impl RequestBuilder {
    pub fn new(info: &DeviceInfo) -> Self {
        Self {
            info: info.clone(),
            next_capture: CAPTURE_REQUEST_IDS.0,
            next_trigger: TRIGGER_REQUEST_IDS.0,
        }
    }

    /// Settings common to every request built from `params`.
    pub fn settings(&self, params: &Parameters) -> RequestSettings {
        let crop = zoom_crop(&self.info, params);
        let map = CoordinateMap::new(crop);
        let regions = |areas: &[MeteringArea]| -> SmallVec<[MeteringRegion; 4]> {
            areas
                .iter()
                .filter(|area| area.weight > 0)
                .map(|area| MeteringRegion {
                    rect: map.rect_to_array(area.rect),
                    weight: area.weight,
                })
                .collect()
        };
        let mut settings = RequestSettings::new(crop);
        settings.fps_range = params.fps_range;
        settings.af_mode = params.focus_mode.af_mode();
        settings.flash_mode = params.flash_mode;
        settings.ae_lock = params.auto_exposure_lock;
        settings.awb_lock = params.auto_white_balance_lock;
        settings.exposure_compensation = params.exposure_compensation;
        settings.af_regions = regions(&params.focusing_areas);
        settings.ae_regions = regions(&params.metering_areas);
        settings.face_detect = params.face_detection && self.info.max_faces > 0;
        settings
    }

    /// Repeating request feeding the preview (and, while recording, the
    /// encoder) streams.
    pub fn preview(
        &self,
        params: &Parameters,
        targets: &[DeviceStreamId],
        recording: bool,
    ) -> Result<CaptureRequest, ClientError> {
        let (id, intent) = if recording {
            (RECORDING_REQUEST_ID, RequestIntent::Record)
        } else {
            (PREVIEW_REQUEST_ID, RequestIntent::Preview)
        };
        build(id, targets, self.settings(params), intent, true, params)
    }

    /// One-shot still capture; a video snapshot while recording.
    pub fn still_capture(
        &mut self,
        params: &Parameters,
        targets: &[DeviceStreamId],
        recording: bool,
    ) -> Result<CaptureRequest, ClientError> {
        let intent = if recording {
            RequestIntent::VideoSnapshot
        } else {
            RequestIntent::StillCapture
        };
        let id = next_in(&mut self.next_capture, CAPTURE_REQUEST_IDS);
        build(id, targets, self.settings(params), intent, false, params)
    }

    pub fn focus_trigger(
        &mut self,
        params: &Parameters,
        targets: &[DeviceStreamId],
        trigger: AfTrigger,
    ) -> Result<CaptureRequest, ClientError> {
        let mut settings = self.settings(params);
        settings.af_trigger = trigger;
        let id = next_in(&mut self.next_trigger, TRIGGER_REQUEST_IDS);
        build(id, targets, settings, RequestIntent::Trigger, false, params)
    }

    pub fn precapture_trigger(
        &mut self,
        params: &Parameters,
        targets: &[DeviceStreamId],
        trigger: TriggerId,
    ) -> Result<CaptureRequest, ClientError> {
        let mut settings = self.settings(params);
        settings.ae_trigger = AePrecaptureTrigger::Start(trigger);
        let id = next_in(&mut self.next_trigger, TRIGGER_REQUEST_IDS);
        build(id, targets, settings, RequestIntent::Trigger, false, params)
    }
}

fn next_in(counter: &mut i32, (first, last): (i32, i32)) -> RequestId {
    let id = *counter;
    *counter = if id >= last { first } else { id + 1 };
    RequestId(id)
}

fn build(
    id: RequestId,
    targets: &[DeviceStreamId],
    settings: RequestSettings,
    intent: RequestIntent,
    repeating: bool,
    params: &Parameters,
) -> Result<CaptureRequest, ClientError> {
    CaptureRequest::new(
        id,
        targets.iter().copied(),
        settings,
        intent,
        repeating,
        params.version(),
    )
    .map_err(|err| ClientError::InvalidOperation(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::SharedParameters;
    use camlink_device::request::{AfMode, FlashMode};

    fn setup() -> (DeviceInfo, SharedParameters) {
        let info = DeviceInfo::virtual_default();
        let params = SharedParameters::new(Parameters::defaults_for(&info));
        (info, params)
    }

    #[test]
    fn settings_follow_snapshot() {
        let (info, shared) = setup();
        let params = shared.update(|p| {
            p.flash_mode = FlashMode::Auto;
            p.zoom = 9;
            p.focus_mode = crate::params::FocusMode::ContinuousPicture;
            p.focusing_areas.push(MeteringArea {
                rect: NormalizedRect::FULL,
                weight: 1,
            });
            p.metering_areas.push(MeteringArea {
                rect: NormalizedRect::FULL,
                weight: 0,
            });
        });
        let builder = RequestBuilder::new(&info);
        let settings = builder.settings(&params);
        assert_eq!(settings.flash_mode, FlashMode::Auto);
        assert_eq!(settings.af_mode, AfMode::ContinuousPicture);
        assert_eq!(settings.crop, CropRegion::for_zoom(info.active_array, 4.0));
        assert_eq!(settings.af_regions.len(), 1);
        assert_eq!(settings.af_regions[0].rect, settings.crop.to_rect());
        assert!(settings.ae_regions.is_empty());
    }

    #[test]
    fn later_commits_do_not_touch_built_requests() {
        let (info, shared) = setup();
        let builder = RequestBuilder::new(&info);
        let first = shared.snapshot();
        let request = builder.preview(&first, &[DeviceStreamId(1)], false).unwrap();
        shared.update(|p| p.exposure_compensation = 2);
        assert_eq!(request.settings().exposure_compensation, 0);
        assert_eq!(request.snapshot_version(), first.version());
    }

    #[test]
    fn one_shot_ids_stay_in_their_ranges() {
        let (info, shared) = setup();
        let params = shared.snapshot();
        let mut builder = RequestBuilder::new(&info);
        builder.next_capture = CAPTURE_REQUEST_IDS.1;
        let last = builder
            .still_capture(&params, &[DeviceStreamId(1)], false)
            .unwrap();
        let wrapped = builder
            .still_capture(&params, &[DeviceStreamId(1)], true)
            .unwrap();
        assert_eq!(last.request_id(), RequestId(3999));
        assert_eq!(wrapped.request_id(), RequestId(3000));
        assert_eq!(wrapped.intent(), RequestIntent::VideoSnapshot);

        let trigger = builder
            .focus_trigger(&params, &[DeviceStreamId(1)], AfTrigger::Start(TriggerId(1)))
            .unwrap();
        assert_eq!(trigger.request_id(), RequestId(4000));
        assert!(!trigger.is_repeating());
    }

    #[test]
    fn recording_uses_its_own_id() {
        let (info, shared) = setup();
        let builder = RequestBuilder::new(&info);
        let request = builder
            .preview(&shared.snapshot(), &[DeviceStreamId(1), DeviceStreamId(2)], true)
            .unwrap();
        assert_eq!(request.request_id(), RECORDING_REQUEST_ID);
        assert_eq!(request.intent(), RequestIntent::Record);
    }

    #[test]
    fn empty_targets_are_refused() {
        let (info, shared) = setup();
        let builder = RequestBuilder::new(&info);
        let err = builder.preview(&shared.snapshot(), &[], false).unwrap_err();
        assert_eq!(err.code(), "invalid_operation");
    }
}
