//! Still capture, callback and recording buffer flow.

mod common;

use std::{sync::Arc, time::Duration};

use camlink::prelude::*;
use common::{APP, count, rig, rig_from, wait_until};

/// Listener that accepts everything except held buffers.
struct RefuseBuffers(Arc<NotificationQueue>);

impl ClientListener for RefuseBuffers {
    fn notify(&self, notification: Notification) -> bool {
        notification.buffer().is_none() && self.0.notify(notification)
    }
}

fn tunables() -> ClientTunables {
    ClientConfig::new().drain_timeout_ms(2000).build()
}

fn lost_buffer(n: &Notification) -> bool {
    matches!(
        n,
        Notification::Error {
            code: DeviceErrorCode::Buffer,
            ..
        }
    )
}

fn picture(n: &Notification) -> bool {
    matches!(n, Notification::PictureTaken(_))
}

#[test]
fn one_shot_capture_delivers_one_picture() {
    let rig = rig();
    rig.preview();
    rig.pump_n(2);
    let repeating = rig.device.repeating_request().unwrap();

    rig.client.take_picture(APP).unwrap();
    assert_eq!(
        rig.client.take_picture(APP).unwrap_err().code(),
        "invalid_operation"
    );
    assert_eq!(rig.device.repeating_request(), Some(repeating));

    let taken = rig.pump_until(picture);
    let Notification::PictureTaken(buffer) = taken else {
        unreachable!()
    };
    assert_eq!(buffer.kind, StreamKind::Capture);
    let jpeg = rig.params().picture;
    assert_eq!(Some(buffer.bytes_used), jpeg.buffer_size());
    let first = rig
        .client
        .read_buffer(APP, &buffer, |bytes| bytes[0])
        .unwrap();
    assert_eq!(u64::from(first), buffer.frame_number % 256);

    rig.pump_n(3);
    rig.settle();
    let later = rig.collect(Duration::from_millis(50));
    assert_eq!(count(&later, picture), 0);

    rig.client.release_buffer(APP, &buffer).unwrap();
    assert_eq!(
        rig.client.release_buffer(APP, &buffer),
        Err(ClientError::StaleBuffer(buffer.slot))
    );
}

#[test]
fn shutter_precedes_the_picture() {
    let rig = rig();
    rig.preview();
    rig.pump();
    rig.client.send_command(APP, Command::EnableShutterSound(false)).unwrap();
    rig.client.take_picture(APP).unwrap();
    rig.pump();
    rig.settle();
    let seen = rig.collect(Duration::from_millis(50));
    let shutter = seen
        .iter()
        .position(|n| matches!(n, Notification::Shutter { play_sound: false, .. }))
        .expect("shutter");
    let taken = seen.iter().position(picture).expect("picture");
    assert!(shutter < taken);
    assert_eq!(count(&seen, |n| matches!(n, Notification::Shutter { .. })), 1);
}

#[test]
fn unreleased_picture_holds_the_next_capture() {
    let rig = rig();
    rig.preview();
    rig.client.take_picture(APP).unwrap();
    let Notification::PictureTaken(held) = rig.pump_until(picture) else {
        unreachable!()
    };

    rig.client.take_picture(APP).unwrap();
    let capture = rig.client.stream_id(StreamKind::Capture).unwrap();
    rig.settle();
    assert_eq!(
        rig.device.begin_frame(),
        Err(DeviceError::ResourceExhausted(capture))
    );
    assert_eq!(rig.device.pending_one_shots(), 1);
    assert_eq!(
        rig.device.repeating_request().map(|r| r.request_id()),
        Some(PREVIEW_REQUEST_ID)
    );

    rig.client.release_buffer(APP, &held).unwrap();
    let Notification::PictureTaken(next) = rig.pump_until(picture) else {
        unreachable!()
    };
    assert_ne!(next.frame_number, held.frame_number);
    assert_eq!(rig.device.pending_one_shots(), 0);
}

#[test]
fn callback_frames_drop_oldest_instead_of_stalling() {
    let rig = rig();
    rig.client
        .set_preview_callback_flags(APP, CallbackFlags::from_bits(CallbackFlags::ENABLE_MASK))
        .unwrap();
    rig.preview();
    assert_eq!(rig.client.stream_state(StreamKind::Callback), StreamState::Active);
    let depth = rig.client.pool_stats(StreamKind::Callback).unwrap().size;

    let frames = depth + 4;
    rig.pump_n(frames);
    rig.settle();
    let seen = rig.collect(Duration::from_millis(50));
    let delivered: Vec<DeliveredBuffer> = seen
        .iter()
        .filter_map(|n| match n {
            Notification::PreviewFrame(buffer) => Some(*buffer),
            _ => None,
        })
        .collect();
    assert_eq!(delivered.len(), frames);
    assert_eq!(
        rig.client.pool_metrics(StreamKind::Callback).unwrap().drops(),
        4
    );

    // the oldest frames were reclaimed by the device
    assert_eq!(
        rig.client.release_buffer(APP, &delivered[0]),
        Err(ClientError::StaleBuffer(delivered[0].slot))
    );
    let newest = delivered[frames - 1];
    rig.client.release_buffer(APP, &newest).unwrap();
}

#[test]
fn one_shot_callback_delivers_a_single_frame() {
    let rig = rig();
    rig.preview();
    rig.client
        .set_preview_callback_flags(
            APP,
            CallbackFlags::from_bits(CallbackFlags::ENABLE_MASK | CallbackFlags::ONE_SHOT_MASK),
        )
        .unwrap();
    rig.pump_n(4);
    rig.settle();
    let seen = rig.collect(Duration::from_millis(50));
    assert_eq!(
        count(&seen, |n| matches!(n, Notification::PreviewFrame(_))),
        1
    );
    assert_eq!(rig.client.stream_state(StreamKind::Callback), StreamState::Active);
}

#[test]
fn recording_round_trip() {
    let rig = rig();
    assert_eq!(
        rig.client.start_recording(APP).unwrap_err().code(),
        "invalid_operation"
    );
    rig.preview();
    rig.client.start_recording(APP).unwrap();
    assert!(rig.client.recording_enabled());
    assert_eq!(
        rig.device.repeating_request().map(|r| r.request_id()),
        Some(RECORDING_REQUEST_ID)
    );

    let Notification::RecordingFrame(frame) =
        rig.pump_until(|n| matches!(n, Notification::RecordingFrame(_)))
    else {
        unreachable!()
    };
    assert_eq!(frame.kind, StreamKind::Recording);
    assert_eq!(frame.payload, BufferPayload::Bytes);
    let len = rig.client.read_buffer(APP, &frame, <[u8]>::len).unwrap();
    assert_eq!(len, frame.bytes_used);
    rig.client.release_recording_frame(APP, &frame).unwrap();
    assert!(rig.client.recording_frame_count() >= 1);

    let mut video = rig.params();
    video.video_buffer_count = 3;
    assert_eq!(
        rig.client.set_parameters(APP, video).unwrap_err().code(),
        "invalid_operation"
    );
    assert!(
        rig.client
            .set_preview_target(APP, Some(common::CountingSurface::new(9)))
            .is_err()
    );
    assert!(rig.client.store_metadata_in_buffers(APP, true).is_err());

    rig.client.stop_recording(APP).unwrap();
    assert!(!rig.client.recording_enabled());
    assert_eq!(
        rig.device.repeating_request().map(|r| r.request_id()),
        Some(PREVIEW_REQUEST_ID)
    );
    rig.settle();
    for frame in rig.collect(Duration::from_millis(20)) {
        if let Notification::RecordingFrame(buffer) = frame {
            rig.client.release_recording_frame(APP, &buffer).unwrap();
        }
    }
    wait_until(Duration::from_secs(1), || {
        let stats = rig.client.pool_stats(StreamKind::Recording).unwrap();
        stats.free == stats.size
    });
}

#[test]
fn preview_buffer_is_not_a_recording_frame() {
    let rig = rig();
    rig.client
        .set_preview_callback_flags(APP, CallbackFlags::from_bits(CallbackFlags::ENABLE_MASK))
        .unwrap();
    rig.preview();
    let Notification::PreviewFrame(buffer) =
        rig.pump_until(|n| matches!(n, Notification::PreviewFrame(_)))
    else {
        unreachable!()
    };
    assert_eq!(
        rig.client.release_recording_frame(APP, &buffer).unwrap_err().code(),
        "invalid_operation"
    );
    rig.client.release_buffer(APP, &buffer).unwrap();
}

#[test]
fn refused_picture_returns_its_slot() {
    let events = Arc::new(NotificationQueue::new(256));
    let rig = rig_from(events.clone(), Arc::new(RefuseBuffers(events)), tunables());
    rig.preview();
    rig.client.take_picture(APP).unwrap();

    let Notification::Error { arg2, .. } = rig.pump_until(lost_buffer) else {
        unreachable!()
    };
    let capture = rig.client.stream_id(StreamKind::Capture).unwrap();
    assert_eq!(arg2, capture.0 as i32);
    let stats = rig.client.pool_stats(StreamKind::Capture).unwrap();
    assert_eq!(stats.free, stats.size);

    rig.client.take_picture(APP).unwrap();
    rig.pump_until(lost_buffer);
    assert_eq!(rig.device.pending_one_shots(), 0);
}

#[test]
fn full_notification_queue_does_not_stall_capture() {
    let events = Arc::new(NotificationQueue::new(1));
    let rig = rig_from(events.clone(), events, tunables());
    rig.preview();
    assert!(rig.events.notify(Notification::FocusMoving { moving: true }));

    rig.client.take_picture(APP).unwrap();
    rig.pump_n(3);
    rig.settle();
    let stats = rig.client.pool_stats(StreamKind::Capture).unwrap();
    assert_eq!(stats.free, stats.size);
    assert_eq!(
        rig.events.drain(),
        vec![Notification::FocusMoving { moving: true }]
    );

    let before = rig.surface.frames();
    rig.client.take_picture(APP).unwrap();
    rig.pump_n(3);
    rig.settle();
    assert_eq!(rig.device.pending_one_shots(), 0);
    assert!(rig.surface.frames() > before);
    let stats = rig.client.pool_stats(StreamKind::Capture).unwrap();
    assert_eq!(stats.free, stats.size);
}

#[test]
fn copied_callback_frames_leave_every_slot_free() {
    let rig = rig();
    rig.client
        .set_preview_callback_flags(
            APP,
            CallbackFlags::from_bits(CallbackFlags::ENABLE_MASK | CallbackFlags::COPY_OUT_MASK),
        )
        .unwrap();
    rig.preview();
    rig.pump_n(3);
    rig.settle();

    let seen = rig.collect(Duration::from_millis(50));
    assert_eq!(
        count(&seen, |n| matches!(n, Notification::PreviewFrame(_))),
        0
    );
    let copies: Vec<&CopiedFrame> = seen
        .iter()
        .filter_map(|n| match n {
            Notification::PreviewFrameCopy(frame) => Some(frame),
            _ => None,
        })
        .collect();
    assert_eq!(copies.len(), 3);
    for frame in copies {
        assert!(!frame.data.is_empty());
        assert!(frame.data.iter().all(|b| u64::from(*b) == frame.frame_number % 256));
    }
    let stats = rig.client.pool_stats(StreamKind::Callback).unwrap();
    assert_eq!(stats.free, stats.size);
}

#[test]
fn metadata_mode_recording_frames_expose_no_bytes() {
    let rig = rig();
    rig.client.store_metadata_in_buffers(APP, true).unwrap();
    assert!(rig.client.parameters().store_metadata_in_buffers);
    rig.preview();
    rig.client.start_recording(APP).unwrap();

    let Notification::RecordingFrame(frame) =
        rig.pump_until(|n| matches!(n, Notification::RecordingFrame(_)))
    else {
        unreachable!()
    };
    assert_eq!(frame.payload, BufferPayload::Metadata);
    assert_eq!(
        rig.client
            .read_buffer(APP, &frame, <[u8]>::len)
            .unwrap_err()
            .code(),
        "invalid_operation"
    );
    rig.client.release_recording_frame(APP, &frame).unwrap();
}
