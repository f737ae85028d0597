//! Busy retries, rejected streams and asynchronous device errors.

mod common;

use std::time::Duration;

use camlink::prelude::*;
use common::{APP, rig, wait_until};

#[test]
fn single_busy_is_retried() {
    let rig = rig();
    rig.device.inject_busy(1);
    rig.preview();
    assert!(rig.client.preview_enabled());
    assert!(rig.device.repeating_request().is_some());
}

#[test]
fn persistent_busy_surfaces_and_leaves_no_pending_capture() {
    let rig = rig();
    rig.preview();
    rig.device.inject_busy(2);
    assert_eq!(rig.client.take_picture(APP), Err(ClientError::DeviceBusy));
    assert_eq!(rig.client.stream_state(StreamKind::Capture), StreamState::Absent);

    rig.client.take_picture(APP).unwrap();
    assert_eq!(rig.device.pending_one_shots(), 1);
}

#[test]
fn rejected_stream_stops_preview_start() {
    let rig = rig();
    rig.device.reject_next_stream("sensor mode unavailable");
    rig.client
        .set_preview_target(APP, Some(rig.surface.clone()))
        .unwrap();
    let err = rig.client.start_preview(APP).unwrap_err();
    assert_eq!(err.code(), "configuration_rejected");
    assert!(err.retryable());
    assert!(!rig.client.preview_enabled());
    assert_eq!(rig.client.stream_state(StreamKind::Preview), StreamState::Absent);

    rig.client.start_preview(APP).unwrap();
    assert!(rig.client.preview_enabled());
}

#[test]
fn request_errors_are_forwarded() {
    let rig = rig();
    rig.preview();
    rig.device.raise_error(DeviceErrorCode::Request, 7, 3);
    assert_eq!(
        rig.events.recv_timeout(Duration::from_millis(200)),
        Some(Notification::Error {
            code: DeviceErrorCode::Request,
            arg1: 7,
            arg2: 3
        })
    );
    thread_pause();
    assert!(rig.client.preview_enabled());
    assert_eq!(rig.client.stream_state(StreamKind::Preview), StreamState::Active);
}

#[test]
fn fatal_errors_tear_streams_down() {
    let rig = rig();
    rig.preview();
    rig.pump_n(2);
    rig.device.raise_error(DeviceErrorCode::Device, 1, 0);
    assert!(matches!(
        rig.events
            .wait_for(Duration::from_millis(200), |n| matches!(n, Notification::Error { .. })),
        Some(Notification::Error {
            code: DeviceErrorCode::Device,
            ..
        })
    ));
    wait_until(Duration::from_secs(2), || {
        rig.client.stream_state(StreamKind::Preview) == StreamState::Absent
    });
    assert!(rig.device.stream_ids().is_empty());
    assert!(rig.device.repeating_request().is_none());
    assert!(!rig.client.preview_enabled());

    // the client stays usable
    rig.client.start_preview(APP).unwrap();
    assert!(rig.client.preview_enabled());
}

#[test]
fn still_capture_failure_after_precapture_is_reported() {
    let rig = rig();
    let mut params = rig.params();
    params.flash_mode = FlashMode::On;
    rig.client.set_parameters(APP, params).unwrap();
    rig.preview();
    rig.client.take_picture(APP).unwrap();
    // precapture start, then the sequence converges
    rig.pump();
    rig.pump();
    rig.device.inject_busy(2);
    rig.pump();

    let err = rig
        .events
        .wait_for(Duration::from_millis(200), |n| matches!(n, Notification::Error { .. }))
        .expect("capture failure reported");
    assert!(matches!(
        err,
        Notification::Error {
            code: DeviceErrorCode::Request,
            ..
        }
    ));
    rig.client.take_picture(APP).unwrap();
}

fn thread_pause() {
    std::thread::sleep(Duration::from_millis(50));
}
