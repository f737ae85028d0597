//! Thread draining device results.
//!
//! Per frame: drop stale frames, resolve triggers, report faces, dispatch
//! buffers by route and keep the newest metadata. The thread never takes
//! the operation lock except to tear streams down after a device fault,
//! and then only with a bounded wait.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use camlink_core::prelude::*;
use camlink_device::{
    DeviceError, DeviceErrorCode, StreamKind,
    metadata::{CaptureResult, CompletedBuffer, FrameMetadata},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    client::ClientShared,
    error::ClientError,
    notify::{BufferPayload, CopiedFrame, DeliveredBuffer, Face, Notification},
    params::Parameters,
    request::zoom_crop,
    stream::StreamRoute,
};

pub(crate) struct FrameProcessor {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl FrameProcessor {
    pub(crate) fn spawn(shared: Weak<ClientShared>) -> Result<Self, ClientError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let worker = thread::Builder::new()
            .name("camlink-frames".into())
            .spawn(move || FrameLoop::default().run(&shared, &flag))
            .map_err(|err| {
                ClientError::InvalidOperation(format!("failed to spawn frame processor: {err}"))
            })?;
        Ok(Self {
            stop,
            worker: Some(worker),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            error!("frame processor panicked");
        }
    }
}

impl Drop for FrameProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Default)]
struct FrameLoop {
    last_frame: Option<u64>,
    last_face_count: usize,
}

impl FrameLoop {
    fn run(mut self, shared: &Weak<ClientShared>, stop: &AtomicBool) {
        info!("frame processor started");
        while !stop.load(Ordering::Acquire) {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            shared.service_fault();
            match shared.device.next_result(shared.tunables.frame_wait()) {
                Ok(Some(result)) => self.process(&shared, result),
                Ok(None) => {}
                Err(DeviceError::Disconnected) => {
                    info!("device result channel closed");
                    break;
                }
                Err(err) => warn!(%err, "failed to read device result"),
            }
        }
        info!("frame processor stopped");
    }

    fn process(&mut self, shared: &ClientShared, result: CaptureResult) {
        let started = Instant::now();
        let CaptureResult { metadata, buffers } = result;
        if let Some(last) = self.last_frame
            && metadata.frame_number <= last
        {
            warn!(frame = metadata.frame_number, last, "dropping stale frame");
            for buffer in &buffers {
                release_completed(shared, buffer);
            }
            shared.metrics.stale();
            return;
        }
        self.last_frame = Some(metadata.frame_number);

        let outcomes = shared.triggers.lock().observe(&metadata);
        for outcome in outcomes {
            shared.apply_trigger_outcome(outcome);
        }
        let params = shared.params.snapshot();
        self.report_faces(shared, &params, &metadata);
        for buffer in &buffers {
            dispatch(shared, &params, buffer, &metadata);
        }
        trace!(frame = metadata.frame_number, buffers = buffers.len(), "frame processed");
        shared.store_last_frame(metadata);
        shared.metrics.record(started.elapsed());
    }

    fn report_faces(&mut self, shared: &ClientShared, params: &Parameters, metadata: &FrameMetadata) {
        if !params.face_detection {
            return;
        }
        let preview_live = shared
            .routes
            .read()
            .values()
            .any(|route| route.kind == StreamKind::Preview && route.is_live());
        if !preview_live {
            debug!(frame = metadata.frame_number, "preview gone, dropping face results");
            return;
        }
        // the crop the frame was captured with, not the current one
        let crop = metadata
            .crop
            .unwrap_or_else(|| zoom_crop(shared.device.info(), params));
        let map = CoordinateMap::new(crop);
        let faces: Vec<Face> = metadata
            .faces
            .iter()
            .filter(|face| face.score > 0)
            .map(|face| Face {
                id: face.id,
                score: face.score,
                rect: map.rect_to_normalized(face.rect),
            })
            .collect();
        // repeated empty results are not reported
        if faces.is_empty() && self.last_face_count == 0 {
            return;
        }
        self.last_face_count = faces.len();
        shared.notify(Notification::Faces(faces));
    }
}

fn release_completed(shared: &ClientShared, buffer: &CompletedBuffer) {
    let route = shared.routes.read().get(&buffer.stream).cloned();
    match route {
        Some(route) => route.release(buffer.slot),
        None => trace!(stream = %buffer.stream, "buffer for removed stream"),
    }
}

fn dispatch(
    shared: &ClientShared,
    params: &Parameters,
    buffer: &CompletedBuffer,
    metadata: &FrameMetadata,
) {
    let Some(route) = shared.routes.read().get(&buffer.stream).cloned() else {
        debug!(stream = %buffer.stream, frame = metadata.frame_number, "late buffer for torn-down stream");
        return;
    };
    if !route.is_live() {
        route.release(buffer.slot);
        return;
    }
    let delivered = DeliveredBuffer {
        kind: route.kind,
        stream: buffer.stream,
        slot: buffer.slot,
        frame_number: metadata.frame_number,
        timestamp: metadata.timestamp,
        bytes_used: buffer.bytes_used,
        payload: BufferPayload::Bytes,
    };
    match route.kind {
        StreamKind::Preview => {
            if let Some(surface) = &route.surface
                && let Err(err) = route
                    .pool
                    .with_slot(buffer.slot, |bytes| surface.queue_frame(bytes, metadata.timestamp))
            {
                debug!(stream = %buffer.stream, %err, "preview buffer not readable");
            }
            route.release(buffer.slot);
        }
        StreamKind::Callback => {
            if !route.take_delivery() {
                route.release(buffer.slot);
            } else if params.callback_flags.copy_out {
                copy_out(shared, &route, &delivered);
            } else {
                hand_over(shared, &route, Notification::PreviewFrame(delivered));
            }
        }
        StreamKind::Capture => {
            shared.still_capture_pending.store(false, Ordering::Release);
            hand_over(shared, &route, Notification::PictureTaken(delivered));
        }
        StreamKind::Recording => {
            if route.take_delivery() {
                shared.recording_frames.fetch_add(1, Ordering::Relaxed);
                let payload = if params.store_metadata_in_buffers {
                    BufferPayload::Metadata
                } else {
                    BufferPayload::Bytes
                };
                hand_over(
                    shared,
                    &route,
                    Notification::RecordingFrame(DeliveredBuffer {
                        payload,
                        ..delivered
                    }),
                );
            } else {
                route.release(buffer.slot);
            }
        }
    }
}

/// Copy a callback frame out and return its slot at once.
fn copy_out(shared: &ClientShared, route: &StreamRoute, delivered: &DeliveredBuffer) {
    let copied = route.pool.with_slot(delivered.slot, |bytes| {
        bytes[..delivered.bytes_used.min(bytes.len())].to_vec()
    });
    route.release(delivered.slot);
    match copied {
        Ok(data) => {
            shared.notify(Notification::PreviewFrameCopy(CopiedFrame {
                stream: delivered.stream,
                frame_number: delivered.frame_number,
                timestamp: delivered.timestamp,
                data,
            }));
        }
        Err(err) => debug!(stream = %delivered.stream, %err, "callback buffer not readable"),
    }
}

/// Give a held slot to the application. A refused hand-over returns the
/// slot and is reported as a lost buffer.
fn hand_over(shared: &ClientShared, route: &StreamRoute, notification: Notification) {
    let Some(&buffer) = notification.buffer() else {
        shared.notify(notification);
        return;
    };
    if shared.notify(notification) {
        return;
    }
    warn!(
        kind = %buffer.kind,
        stream = %buffer.stream,
        frame = buffer.frame_number,
        "listener refused buffer, returning slot"
    );
    route.release(buffer.slot);
    shared.notify(Notification::Error {
        code: DeviceErrorCode::Buffer,
        arg1: buffer.frame_number as i32,
        arg2: buffer.stream.0 as i32,
    });
}
