//! Parameter changes, stream recreation and teardown against a stalled
//! device.

mod common;

use std::{
    thread,
    time::{Duration, Instant},
};

use camlink::prelude::*;
use common::{APP, rig, rig_with};

fn deleted(device: &VirtualDevice) -> Vec<DeviceStreamId> {
    device
        .events()
        .into_iter()
        .filter_map(|e| match e {
            DeviceEvent::StreamDeleted(id) => Some(id),
            _ => None,
        })
        .collect()
}

fn hd_preview(rig: &common::Rig) -> Parameters {
    let mut params = rig.params();
    params.preview = StreamFormat::new(FourCc::OPAQUE, Resolution::new(1280, 720).unwrap());
    params
}

#[test]
fn recreation_waits_for_in_flight_buffers() {
    let rig = rig();
    rig.preview();
    let old = rig.client.stream_id(StreamKind::Preview).unwrap();
    assert!(rig.device.begin_frame().unwrap().is_some());

    let next = hd_preview(&rig);
    thread::scope(|s| {
        let worker = s.spawn(|| rig.client.set_parameters(APP, next));
        thread::sleep(Duration::from_millis(100));
        assert!(!worker.is_finished());
        assert!(deleted(&rig.device).is_empty());
        assert!(rig.device.repeating_request().is_none());

        assert!(rig.device.complete_frame().unwrap());
        worker.join().unwrap().unwrap();
    });

    assert_eq!(deleted(&rig.device), [old]);
    let new = rig.client.stream_id(StreamKind::Preview).unwrap();
    assert_ne!(new, old);
    assert!(rig.device.events().contains(&DeviceEvent::StreamCreated {
        id: new,
        kind: StreamKind::Preview,
        format: rig.params().preview,
    }));
    let repeating = rig.device.repeating_request().unwrap();
    assert_eq!(repeating.targets(), [new]);
    assert_eq!(repeating.snapshot_version(), rig.client.parameters().version());

    rig.pump_n(2);
    rig.settle();
    assert!(rig.surface.frames() >= 2);
}

#[test]
fn unchanged_formats_keep_streams() {
    let rig = rig();
    rig.preview();
    let id = rig.client.stream_id(StreamKind::Preview).unwrap();
    let mut params = rig.params();
    params.exposure_compensation = 1;
    params.auto_white_balance_lock = true;
    rig.client.set_parameters(APP, params).unwrap();

    assert_eq!(rig.client.stream_id(StreamKind::Preview), Some(id));
    assert!(deleted(&rig.device).is_empty());
    let repeating = rig.device.repeating_request().unwrap();
    assert!(repeating.settings().awb_lock);
    assert_eq!(repeating.snapshot_version(), 2);
}

#[test]
fn rejected_parameters_leave_the_snapshot_alone() {
    let rig = rig();
    rig.preview();
    let mut params = rig.params();
    params.preview = StreamFormat::new(FourCc::OPAQUE, Resolution::new(123, 45).unwrap());
    assert_eq!(
        rig.client.set_parameters(APP, params).unwrap_err().code(),
        "configuration_rejected"
    );
    let mut params = rig.params();
    params.zoom = 99;
    assert!(rig.client.set_parameters(APP, params).is_err());

    assert_eq!(rig.client.parameters().version(), 1);
    assert!(rig.client.preview_enabled());
    assert!(deleted(&rig.device).is_empty());
}

#[test]
fn stuck_reconfiguration_stops_preview() {
    let rig = rig_with(ClientConfig::new().drain_timeout_ms(50).build());
    rig.preview();
    let old = rig.client.stream_id(StreamKind::Preview).unwrap();
    rig.device.begin_frame().unwrap();

    let err = rig.client.set_parameters(APP, hd_preview(&rig)).unwrap_err();
    assert_eq!(err.code(), "device_error");
    assert!(!rig.client.preview_enabled());
    assert_eq!(rig.client.stream_id(StreamKind::Preview), Some(old));
    assert_eq!(rig.client.stream_state(StreamKind::Preview), StreamState::Active);

    rig.device.complete_frame().unwrap();
    rig.client.start_preview(APP).unwrap();
    assert_ne!(rig.client.stream_id(StreamKind::Preview), Some(old));
}

#[test]
fn teardown_of_a_stalled_device_is_bounded() {
    let rig = rig_with(ClientConfig::new().drain_timeout_ms(100).build());
    rig.preview();
    rig.device.begin_frame().unwrap();

    let started = Instant::now();
    let err = rig.client.disconnect(APP).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(err.code(), "device_error");
    assert!(rig.device.stream_ids().is_empty());
    assert_eq!(rig.client.stream_state(StreamKind::Preview), StreamState::TornDown);
    assert_eq!(rig.client.disconnect(APP), Ok(()));

    // the frame finishes into a closed pool
    rig.device.complete_frame().unwrap();
}

#[test]
fn callback_stream_follows_the_flags() {
    let rig = rig();
    rig.preview();
    assert_eq!(rig.client.stream_state(StreamKind::Callback), StreamState::Absent);

    rig.client
        .set_preview_callback_flags(APP, CallbackFlags::from_bits(CallbackFlags::ENABLE_MASK))
        .unwrap();
    let callback = rig.client.stream_id(StreamKind::Callback).unwrap();
    assert!(rig.device.repeating_request().unwrap().targets().contains(&callback));

    rig.client
        .set_preview_callback_flags(APP, CallbackFlags::default())
        .unwrap();
    assert_eq!(rig.client.stream_state(StreamKind::Callback), StreamState::Absent);
    assert_eq!(deleted(&rig.device), [callback]);
    assert!(!rig.device.repeating_request().unwrap().targets().contains(&callback));
}

#[test]
fn zoom_narrows_the_crop_region() {
    let rig = rig();
    rig.preview();
    let full = rig.device.repeating_request().unwrap().settings().crop;
    let mut params = rig.params();
    params.zoom = NUM_ZOOM_STEPS - 1;
    rig.client.set_parameters(APP, params).unwrap();
    let zoomed = rig.device.repeating_request().unwrap().settings().crop;
    assert!(zoomed.width < full.width);
    assert!(zoomed.height < full.height);
    assert_eq!(
        zoomed,
        zoom_crop(rig.device.info(), &rig.client.parameters())
    );
}
