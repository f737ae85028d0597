//! In-process device that fills buffers with a frame-number pattern.
//!
//! Frames can be produced by a background driver thread or stepped by hand
//! with [`VirtualDevice::begin_frame`] / [`VirtualDevice::complete_frame`],
//! which keeps a frame's buffers in flight for as long as a test needs.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use camlink_core::prelude::*;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{debug, error, info, trace, warn};

use crate::{
    CameraDevice, DeviceError, DeviceErrorCode, DeviceInfo, DeviceListener, DeviceStreamId,
    StreamConfig, StreamKind,
    metadata::{AeState, AfState, AwbState, CaptureResult, CompletedBuffer, FaceMetadata, FrameMetadata},
    request::{AePrecaptureTrigger, AfTrigger, CaptureRequest, RequestId, RequestSettings, TriggerId},
};

/// Behavior knobs for [`VirtualDevice`].
#[derive(Debug, Clone)]
pub struct VirtualDeviceConfig {
    /// Pause between frames when driven by [`VirtualDriver`].
    pub frame_interval: Duration,
    /// Frames an autofocus scan takes to lock.
    pub focus_frames: u32,
    /// Frames a precapture sequence takes to converge.
    pub precapture_frames: u32,
    /// Whether triggered scans end in `FocusedLocked` or `NotFocusedLocked`.
    pub focus_succeeds: bool,
}

impl Default for VirtualDeviceConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(33),
            focus_frames: 2,
            precapture_frames: 2,
            focus_succeeds: true,
        }
    }
}

/// Control-plane activity recorded by the virtual device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    StreamCreated {
        id: DeviceStreamId,
        kind: StreamKind,
        format: StreamFormat,
    },
    StreamDeleted(DeviceStreamId),
    RepeatingSet(RequestId),
    RepeatingCleared,
    CaptureQueued(RequestId),
    FrameStarted {
        frame_number: u64,
        request_id: RequestId,
    },
    FrameCompleted {
        frame_number: u64,
        request_id: RequestId,
    },
}

enum Callback {
    Shutter(u64, u64),
    AutoFocus(AfState, TriggerId),
    AutoExposure(AeState, TriggerId),
    AutoWhiteBalance(AwbState, TriggerId),
}

struct Frame {
    frame_number: u64,
    timestamp: u64,
    request: CaptureRequest,
    buffers: SmallVec<[(DeviceStreamId, SlotHandle, BufferPool); 4]>,
}

#[derive(Default)]
struct AfSim {
    state: AfState,
    trigger: TriggerId,
    remaining: u32,
}

impl AfSim {
    fn step(
        &mut self,
        settings: &RequestSettings,
        config: &VirtualDeviceConfig,
    ) -> Option<(AfState, TriggerId)> {
        let before = self.state;
        match settings.af_trigger {
            AfTrigger::Start(id) => {
                self.trigger = id;
                self.state = AfState::ActiveScan;
                self.remaining = config.focus_frames;
                return Some((self.state, id));
            }
            AfTrigger::Cancel(id) => {
                self.trigger = id;
                self.state = AfState::Inactive;
                self.remaining = 0;
                return Some((self.state, id));
            }
            AfTrigger::Idle => match self.state {
                AfState::ActiveScan if self.remaining <= 1 => {
                    self.state = if config.focus_succeeds {
                        AfState::FocusedLocked
                    } else {
                        AfState::NotFocusedLocked
                    };
                }
                AfState::PassiveScan if self.remaining <= 1 => self.state = AfState::PassiveFocused,
                AfState::ActiveScan | AfState::PassiveScan => self.remaining -= 1,
                AfState::Inactive if settings.af_mode.is_continuous() => {
                    self.state = AfState::PassiveScan;
                    self.remaining = config.focus_frames;
                }
                _ => {}
            },
        }
        (self.state != before).then_some((self.state, self.trigger))
    }
}

#[derive(Default)]
struct AeSim {
    state: AeState,
    trigger: TriggerId,
    remaining: u32,
}

impl AeSim {
    fn step(
        &mut self,
        settings: &RequestSettings,
        config: &VirtualDeviceConfig,
    ) -> Option<(AeState, TriggerId)> {
        let before = self.state;
        if let AePrecaptureTrigger::Start(id) = settings.ae_trigger {
            self.trigger = id;
            self.state = AeState::Precapture;
            self.remaining = config.precapture_frames;
            return Some((self.state, id));
        }
        self.state = match self.state {
            AeState::Precapture if self.remaining > 1 => {
                self.remaining -= 1;
                AeState::Precapture
            }
            AeState::Precapture | AeState::Searching => AeState::Converged,
            AeState::Inactive => AeState::Searching,
            AeState::Converged | AeState::FlashRequired if settings.ae_lock => AeState::Locked,
            AeState::Locked if !settings.ae_lock => AeState::Converged,
            other => other,
        };
        (self.state != before).then_some((self.state, self.trigger))
    }
}

fn step_awb(state: &mut AwbState, settings: &RequestSettings) -> Option<AwbState> {
    let before = *state;
    *state = match *state {
        AwbState::Inactive => AwbState::Searching,
        AwbState::Searching => AwbState::Converged,
        AwbState::Converged if settings.awb_lock => AwbState::Locked,
        AwbState::Locked if !settings.awb_lock => AwbState::Converged,
        other => other,
    };
    (*state != before).then_some(*state)
}

#[derive(Default)]
struct VirtualState {
    streams: BTreeMap<DeviceStreamId, StreamConfig>,
    next_stream: u32,
    repeating: Option<CaptureRequest>,
    one_shots: VecDeque<CaptureRequest>,
    in_flight: VecDeque<Frame>,
    frame_number: u64,
    clock: u64,
    af: AfSim,
    ae: AeSim,
    awb: AwbState,
    faces: Vec<FaceMetadata>,
    busy: u32,
    reject_next_stream: Option<String>,
    events: Vec<DeviceEvent>,
}

impl VirtualState {
    fn take_busy(&mut self) -> Result<(), DeviceError> {
        if self.busy > 0 {
            self.busy -= 1;
            return Err(DeviceError::Busy);
        }
        Ok(())
    }

    fn check_targets(&self, request: &CaptureRequest) -> Result<(), DeviceError> {
        match request
            .targets()
            .iter()
            .find(|id| !self.streams.contains_key(id))
        {
            Some(missing) => Err(DeviceError::NoSuchStream(*missing)),
            None => Ok(()),
        }
    }
}

/// Simulated camera device.
///
/// # Example
/// ```rust
/// use camlink_device::prelude::*;
///
/// let device = VirtualDevice::with_defaults();
/// let format = StreamFormat::new(FourCc::OPAQUE, Resolution::new(640, 480).unwrap());
/// let pool = BufferPool::new(2, format.buffer_size().unwrap(), ExhaustionPolicy::Block);
/// let id = device
///     .create_stream(StreamConfig { kind: StreamKind::Preview, format, pool: pool.clone() })
///     .unwrap();
/// let settings = RequestSettings::new(CropRegion::full(device.info().active_array));
/// let request =
///     CaptureRequest::new(RequestId(1), [id], settings, RequestIntent::Preview, true, 1).unwrap();
/// device.set_repeating_request(request).unwrap();
/// assert!(device.pump().unwrap());
/// assert_eq!(pool.stats().filled, 1);
/// ```
pub struct VirtualDevice {
    info: DeviceInfo,
    config: VirtualDeviceConfig,
    state: Mutex<VirtualState>,
    results_tx: Sender<CaptureResult>,
    results_rx: Receiver<CaptureResult>,
    listener: RwLock<Option<Weak<dyn DeviceListener>>>,
}

impl VirtualDevice {
    pub fn new(info: DeviceInfo, config: VirtualDeviceConfig) -> Self {
        let (results_tx, results_rx) = crossbeam_channel::unbounded();
        Self {
            info,
            config,
            state: Mutex::new(VirtualState::default()),
            results_tx,
            results_rx,
            listener: RwLock::new(None),
        }
    }

    /// Device with [`DeviceInfo::virtual_default`] and default knobs.
    pub fn with_defaults() -> Self {
        Self::new(DeviceInfo::virtual_default(), VirtualDeviceConfig::default())
    }

    pub fn config(&self) -> &VirtualDeviceConfig {
        &self.config
    }

    /// Start the next frame: pick the oldest one-shot (or the repeating
    /// request) and take a slot from every target stream.
    ///
    /// Returns the frame number, or `None` when there is nothing to do. When
    /// a target pool has no slot to give, nothing is taken, the request stays
    /// queued, and `ResourceExhausted` is returned.
    pub fn begin_frame(&self) -> Result<Option<u64>, DeviceError> {
        let mut state = self.state.lock();
        let from_queue = !state.one_shots.is_empty();
        let request = match state.one_shots.front().or(state.repeating.as_ref()) {
            Some(request) => request.clone(),
            None => return Ok(None),
        };

        let mut buffers: SmallVec<[(DeviceStreamId, SlotHandle, BufferPool); 4]> = SmallVec::new();
        for &id in request.targets() {
            let Some(stream) = state.streams.get(&id) else {
                trace!(stream = %id, request = %request.request_id(), "target no longer configured");
                continue;
            };
            match stream.pool.acquire() {
                Ok(slot) => buffers.push((id, slot, stream.pool.clone())),
                Err(PoolError::Exhausted) => {
                    for (taken, slot, pool) in buffers {
                        if let Err(err) = pool.abandon(slot) {
                            warn!(stream = %taken, %err, "failed to return slot after exhaustion");
                        }
                    }
                    return Err(DeviceError::ResourceExhausted(id));
                }
                Err(err) => debug!(stream = %id, %err, "skipping stream without usable pool"),
            }
        }

        if from_queue {
            state.one_shots.pop_front();
        }
        if buffers.is_empty() {
            warn!(request = %request.request_id(), "dropping request with no live output streams");
            if !from_queue {
                state.repeating = None;
            }
            return Ok(None);
        }

        state.frame_number += 1;
        state.clock += self.config.frame_interval.as_nanos() as u64;
        let frame_number = state.frame_number;
        let timestamp = state.clock;
        state.events.push(DeviceEvent::FrameStarted {
            frame_number,
            request_id: request.request_id(),
        });
        state.in_flight.push_back(Frame {
            frame_number,
            timestamp,
            request,
            buffers,
        });
        Ok(Some(frame_number))
    }

    /// Finish the oldest in-flight frame: fill and recycle its slots, advance
    /// the 3A simulation, raise events and publish the result.
    ///
    /// Returns `false` when no frame was in flight.
    pub fn complete_frame(&self) -> Result<bool, DeviceError> {
        let (result, callbacks) = {
            let mut state = self.state.lock();
            let Some(frame) = state.in_flight.pop_front() else {
                return Ok(false);
            };
            let pattern = (frame.frame_number % 256) as u8;
            let mut completed = SmallVec::new();
            for (id, slot, pool) in &frame.buffers {
                let filled = pool
                    .with_slot_mut(*slot, |bytes| {
                        bytes.fill(pattern);
                        bytes.len()
                    })
                    .and_then(|len| pool.recycle(*slot, len).map(|_| len));
                match filled {
                    Ok(bytes_used) => completed.push(CompletedBuffer {
                        stream: *id,
                        slot: *slot,
                        bytes_used,
                    }),
                    Err(err) => debug!(stream = %id, %err, "slot went away mid-frame"),
                }
            }

            let settings = frame.request.settings();
            let mut callbacks: SmallVec<[Callback; 4]> = SmallVec::new();
            if frame.request.intent().fires_shutter() {
                callbacks.push(Callback::Shutter(frame.frame_number, frame.timestamp));
            }
            if let Some((af, trigger)) = state.af.step(settings, &self.config) {
                callbacks.push(Callback::AutoFocus(af, trigger));
            }
            if let Some((ae, trigger)) = state.ae.step(settings, &self.config) {
                callbacks.push(Callback::AutoExposure(ae, trigger));
            }
            if let Some(awb) = step_awb(&mut state.awb, settings) {
                callbacks.push(Callback::AutoWhiteBalance(awb, TriggerId::default()));
            }

            let metadata = FrameMetadata {
                request_id: Some(frame.request.request_id()),
                frame_number: frame.frame_number,
                timestamp: frame.timestamp,
                af_state: state.af.state,
                af_trigger_id: state.af.trigger,
                ae_state: state.ae.state,
                ae_trigger_id: state.ae.trigger,
                awb_state: state.awb,
                faces: if settings.face_detect {
                    state.faces.clone()
                } else {
                    Vec::new()
                },
                crop: Some(settings.crop),
                snapshot_version: frame.request.snapshot_version(),
            };
            state.events.push(DeviceEvent::FrameCompleted {
                frame_number: frame.frame_number,
                request_id: frame.request.request_id(),
            });
            (
                CaptureResult {
                    metadata,
                    buffers: completed,
                },
                callbacks,
            )
        };

        if let Some(listener) = self.listener() {
            for callback in callbacks {
                match callback {
                    Callback::Shutter(frame, ts) => listener.on_shutter(frame, ts),
                    Callback::AutoFocus(state, trigger) => {
                        listener.on_auto_focus_state_change(state, trigger)
                    }
                    Callback::AutoExposure(state, trigger) => {
                        listener.on_auto_exposure_state_change(state, trigger)
                    }
                    Callback::AutoWhiteBalance(state, trigger) => {
                        listener.on_auto_white_balance_state_change(state, trigger)
                    }
                }
            }
        }
        self.results_tx
            .send(result)
            .map_err(|_| DeviceError::Disconnected)?;
        Ok(true)
    }

    /// Produce one complete frame.
    pub fn pump(&self) -> Result<bool, DeviceError> {
        match self.begin_frame()? {
            Some(_) => self.complete_frame(),
            None => Ok(false),
        }
    }

    /// Produce up to `count` frames, stopping early when idle.
    pub fn pump_frames(&self, count: usize) -> Result<usize, DeviceError> {
        let mut produced = 0;
        while produced < count && self.pump()? {
            produced += 1;
        }
        Ok(produced)
    }

    /// Frames started but not yet completed.
    pub fn in_flight_frames(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Make the next `count` control calls fail with `Busy`.
    pub fn inject_busy(&self, count: u32) {
        self.state.lock().busy = count;
    }

    /// Make the next stream creation fail as unsupported.
    pub fn reject_next_stream(&self, reason: impl Into<String>) {
        self.state.lock().reject_next_stream = Some(reason.into());
    }

    /// Faces reported on frames that request face detection.
    pub fn set_faces(&self, faces: Vec<FaceMetadata>) {
        self.state.lock().faces = faces;
    }

    /// Raise an asynchronous device error.
    pub fn raise_error(&self, code: DeviceErrorCode, arg1: i32, arg2: i32) {
        error!(?code, arg1, arg2, "virtual device raising error");
        if let Some(listener) = self.listener() {
            listener.on_device_error(code, arg1, arg2);
        }
    }

    pub fn repeating_request(&self) -> Option<CaptureRequest> {
        self.state.lock().repeating.clone()
    }

    pub fn pending_one_shots(&self) -> usize {
        self.state.lock().one_shots.len()
    }

    pub fn stream_ids(&self) -> Vec<DeviceStreamId> {
        self.state.lock().streams.keys().copied().collect()
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Run frames on a background thread until the driver is dropped.
    pub fn spawn_driver(self: &Arc<Self>) -> VirtualDriver {
        let stop = Arc::new(AtomicBool::new(false));
        let device = Arc::clone(self);
        let flag = stop.clone();
        let worker = thread::Builder::new()
            .name("camlink-virtual".into())
            .spawn(move || device.drive(&flag))
            .inspect_err(|err| error!(%err, "failed to spawn virtual device driver"))
            .ok();
        VirtualDriver { stop, worker }
    }

    fn drive(&self, stop: &AtomicBool) {
        info!(interval = ?self.config.frame_interval, "virtual device driver started");
        while !stop.load(Ordering::Acquire) {
            match self.pump() {
                Ok(_) => {}
                Err(DeviceError::ResourceExhausted(id)) => {
                    trace!(stream = %id, "waiting for a consumer to free a slot")
                }
                Err(err) => warn!(%err, "virtual frame failed"),
            }
            thread::sleep(self.config.frame_interval);
        }
        info!("virtual device driver stopped");
    }

    fn listener(&self) -> Option<Arc<dyn DeviceListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }
}

impl CameraDevice for VirtualDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn set_listener(&self, listener: Weak<dyn DeviceListener>) {
        *self.listener.write() = Some(listener);
    }

    fn create_stream(&self, config: StreamConfig) -> Result<DeviceStreamId, DeviceError> {
        let mut state = self.state.lock();
        state.take_busy()?;
        if let Some(reason) = state.reject_next_stream.take() {
            return Err(DeviceError::Unsupported(reason));
        }
        if !self.info.supports(&config.format) {
            return Err(DeviceError::Unsupported(format!(
                "{} not advertised for {}",
                config.format, config.kind
            )));
        }
        state.next_stream += 1;
        let id = DeviceStreamId(state.next_stream);
        debug!(stream = %id, kind = %config.kind, format = %config.format, "stream created");
        state.events.push(DeviceEvent::StreamCreated {
            id,
            kind: config.kind,
            format: config.format,
        });
        state.streams.insert(id, config);
        Ok(id)
    }

    fn delete_stream(&self, id: DeviceStreamId) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.streams.remove(&id).is_none() {
            return Err(DeviceError::NoSuchStream(id));
        }
        for frame in state.in_flight.iter_mut() {
            frame.buffers.retain(|(stream, slot, pool)| {
                if *stream != id {
                    return true;
                }
                if let Err(err) = pool.abandon(*slot) {
                    debug!(stream = %id, %err, "in-flight slot already gone");
                }
                false
            });
        }
        debug!(stream = %id, "stream deleted");
        state.events.push(DeviceEvent::StreamDeleted(id));
        Ok(())
    }

    fn set_repeating_request(&self, request: CaptureRequest) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.take_busy()?;
        state.check_targets(&request)?;
        state.events.push(DeviceEvent::RepeatingSet(request.request_id()));
        state.repeating = Some(request);
        Ok(())
    }

    fn clear_repeating_request(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.repeating.take().is_some() {
            state.events.push(DeviceEvent::RepeatingCleared);
        }
        Ok(())
    }

    fn capture(&self, request: CaptureRequest) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.take_busy()?;
        state.check_targets(&request)?;
        state.events.push(DeviceEvent::CaptureQueued(request.request_id()));
        state.one_shots.push_back(request);
        Ok(())
    }

    fn next_result(&self, timeout: Duration) -> Result<Option<CaptureResult>, DeviceError> {
        match self.results_rx.recv_timeout(timeout) {
            Ok(result) => Ok(Some(result)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DeviceError::Disconnected),
        }
    }
}

/// Background thread producing frames for a [`VirtualDevice`].
pub struct VirtualDriver {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl VirtualDriver {
    /// Stop producing frames and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            error!("virtual device driver panicked");
        }
    }
}

impl Drop for VirtualDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{AfMode, RequestIntent};

    #[derive(Default)]
    struct Recorder {
        focus: Mutex<Vec<(AfState, TriggerId)>>,
        shutters: Mutex<Vec<u64>>,
    }

    impl DeviceListener for Recorder {
        fn on_device_error(&self, _code: DeviceErrorCode, _arg1: i32, _arg2: i32) {}
        fn on_shutter(&self, frame_number: u64, _timestamp: u64) {
            self.shutters.lock().push(frame_number);
        }
        fn on_auto_focus_state_change(&self, state: AfState, trigger: TriggerId) {
            self.focus.lock().push((state, trigger));
        }
        fn on_auto_exposure_state_change(&self, _state: AeState, _trigger: TriggerId) {}
        fn on_auto_white_balance_state_change(&self, _state: AwbState, _trigger: TriggerId) {}
    }

    fn stream(device: &VirtualDevice, kind: StreamKind, code: FourCc, count: usize) -> (DeviceStreamId, BufferPool) {
        let format = StreamFormat::new(code, Resolution::new(640, 480).unwrap());
        let pool = BufferPool::new(count, format.buffer_size().unwrap(), ExhaustionPolicy::Block);
        let id = device
            .create_stream(StreamConfig {
                kind,
                format,
                pool: pool.clone(),
            })
            .expect("stream");
        (id, pool)
    }

    fn request(device: &VirtualDevice, id: i32, targets: &[DeviceStreamId], intent: RequestIntent, af: AfTrigger) -> CaptureRequest {
        let mut settings = RequestSettings::new(CropRegion::full(device.info().active_array));
        settings.af_trigger = af;
        CaptureRequest::new(
            RequestId(id),
            targets.iter().copied(),
            settings,
            intent,
            intent == RequestIntent::Preview,
            1,
        )
        .expect("request")
    }

    fn completed_requests(device: &VirtualDevice) -> Vec<i32> {
        device
            .events()
            .into_iter()
            .filter_map(|event| match event {
                DeviceEvent::FrameCompleted { request_id, .. } => Some(request_id.0),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn one_shot_runs_between_repeating_frames() {
        let device = VirtualDevice::with_defaults();
        let (preview, preview_pool) = stream(&device, StreamKind::Preview, FourCc::OPAQUE, 4);
        let (capture, capture_pool) = stream(&device, StreamKind::Capture, FourCc::JPEG, 1);
        let repeating = request(&device, 1000, &[preview], RequestIntent::Preview, AfTrigger::Idle);
        device.set_repeating_request(repeating.clone()).unwrap();
        device.pump().unwrap();
        device
            .capture(request(&device, 3000, &[preview, capture], RequestIntent::StillCapture, AfTrigger::Idle))
            .unwrap();
        device.pump_frames(2).unwrap();
        assert_eq!(completed_requests(&device), vec![1000, 3000, 1000]);
        assert_eq!(device.repeating_request(), Some(repeating));
        assert_eq!(capture_pool.stats().filled, 1);
        assert_eq!(preview_pool.stats().filled, 3);
    }

    #[test]
    fn exhausted_pool_keeps_one_shot_queued() {
        let device = VirtualDevice::with_defaults();
        let (capture, pool) = stream(&device, StreamKind::Capture, FourCc::JPEG, 1);
        let held = pool.acquire().unwrap();
        device
            .capture(request(&device, 3000, &[capture], RequestIntent::StillCapture, AfTrigger::Idle))
            .unwrap();
        assert_eq!(device.begin_frame(), Err(DeviceError::ResourceExhausted(capture)));
        assert_eq!(device.pending_one_shots(), 1);
        pool.abandon(held).unwrap();
        assert!(device.pump().unwrap());
        assert_eq!(device.pending_one_shots(), 0);
    }

    #[test]
    fn autofocus_trigger_locks_after_scan() {
        let device = VirtualDevice::with_defaults();
        let recorder: Arc<Recorder> = Arc::new(Recorder::default());
        let weak: Weak<dyn DeviceListener> = Arc::downgrade(&recorder) as Weak<dyn DeviceListener>;
        device.set_listener(weak);
        let (preview, pool) = stream(&device, StreamKind::Preview, FourCc::OPAQUE, 8);
        device
            .set_repeating_request(request(&device, 1000, &[preview], RequestIntent::Preview, AfTrigger::Idle))
            .unwrap();
        device
            .capture(request(&device, 4000, &[preview], RequestIntent::Trigger, AfTrigger::Start(TriggerId(5))))
            .unwrap();
        device.pump_frames(3).unwrap();
        assert_eq!(
            *recorder.focus.lock(),
            vec![
                (AfState::ActiveScan, TriggerId(5)),
                (AfState::FocusedLocked, TriggerId(5))
            ]
        );
        assert!(recorder.shutters.lock().is_empty());
        assert_eq!(pool.stats().filled, 3);
    }

    #[test]
    fn continuous_focus_scans_without_trigger() {
        let mut sim = AfSim::default();
        let mut settings = RequestSettings::new(CropRegion::full(Resolution::new(8, 8).unwrap()));
        settings.af_mode = AfMode::ContinuousPicture;
        let config = VirtualDeviceConfig::default();
        assert_eq!(sim.step(&settings, &config), Some((AfState::PassiveScan, TriggerId(0))));
        assert_eq!(sim.step(&settings, &config), None);
        assert_eq!(sim.step(&settings, &config), Some((AfState::PassiveFocused, TriggerId(0))));
    }

    #[test]
    fn deleting_a_stream_abandons_in_flight_slots() {
        let device = VirtualDevice::with_defaults();
        let (preview, pool) = stream(&device, StreamKind::Preview, FourCc::OPAQUE, 2);
        device
            .set_repeating_request(request(&device, 1000, &[preview], RequestIntent::Preview, AfTrigger::Idle))
            .unwrap();
        device.begin_frame().unwrap();
        assert_eq!(pool.stats().in_flight, 1);
        device.delete_stream(preview).unwrap();
        assert_eq!(pool.stats().in_flight, 0);
        // the emptied frame still completes, without buffers
        assert!(device.complete_frame().unwrap());
        let result = device.next_result(Duration::from_millis(10)).unwrap().expect("result");
        assert!(result.buffers.is_empty());
        assert_eq!(device.begin_frame().unwrap(), None);
    }

    #[test]
    fn busy_injection_fails_control_calls() {
        let device = VirtualDevice::with_defaults();
        device.inject_busy(1);
        let format = StreamFormat::new(FourCc::OPAQUE, Resolution::new(640, 480).unwrap());
        let config = StreamConfig {
            kind: StreamKind::Preview,
            format,
            pool: BufferPool::new(2, 16, ExhaustionPolicy::Block),
        };
        assert_eq!(device.create_stream(config.clone()), Err(DeviceError::Busy));
        assert!(device.create_stream(config).is_ok());
    }

    #[test]
    fn unsupported_format_is_rejected() {
        let device = VirtualDevice::with_defaults();
        let format = StreamFormat::new(FourCc::OPAQUE, Resolution::new(123, 45).unwrap());
        let err = device
            .create_stream(StreamConfig {
                kind: StreamKind::Preview,
                format,
                pool: BufferPool::new(1, 16, ExhaustionPolicy::Block),
            })
            .unwrap_err();
        assert_eq!(err.code(), "unsupported");
    }
}
