use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use camlink_core::prelude::*;
use camlink_device::{
    CameraDevice, DeviceErrorCode, DeviceInfo, DeviceListener, DeviceStreamId, StreamKind,
    metadata::{AeState, AfState, AwbState, FrameMetadata},
    request::{AfTrigger, TriggerId},
};
use parking_lot::{Mutex, RwLock};
use smallvec::{SmallVec, smallvec};
use tracing::{debug, error, info, trace, warn};

use crate::{
    command::Command,
    error::{ClientError, retry_busy},
    frame_processor::FrameProcessor,
    metrics::FrameMetrics,
    notify::{BufferPayload, ClientListener, DeliveredBuffer, Notification, PreviewSurface},
    params::{CallbackFlags, Parameters, SharedParameters},
    request::RequestBuilder,
    stream::{RouteTable, StreamContext, StreamController, StreamSpec, StreamState},
    trigger::{TriggerKind, TriggerOutcome, TriggerTracker},
    tunables::ClientTunables,
};

/// Identity of the application process issuing client calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerId(pub u32);

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "caller#{}", self.0)
    }
}

/// State only touched under the operation lock.
pub(crate) struct OpState {
    owner: Option<CallerId>,
    connected: bool,
    preview_enabled: bool,
    recording_enabled: bool,
    surface: Option<Arc<dyn PreviewSurface>>,
    preview: StreamController,
    callback: StreamController,
    capture: StreamController,
    recording: StreamController,
    builder: RequestBuilder,
}

impl OpState {
    fn new(owner: CallerId, info: &DeviceInfo) -> Self {
        Self {
            owner: Some(owner),
            connected: true,
            preview_enabled: false,
            recording_enabled: false,
            surface: None,
            preview: StreamController::new(StreamKind::Preview),
            callback: StreamController::new(StreamKind::Callback),
            capture: StreamController::new(StreamKind::Capture),
            recording: StreamController::new(StreamKind::Recording),
            builder: RequestBuilder::new(info),
        }
    }

    fn controller(&self, kind: StreamKind) -> &StreamController {
        match kind {
            StreamKind::Preview => &self.preview,
            StreamKind::Callback => &self.callback,
            StreamKind::Capture => &self.capture,
            StreamKind::Recording => &self.recording,
        }
    }

    fn controller_mut(&mut self, kind: StreamKind) -> &mut StreamController {
        match kind {
            StreamKind::Preview => &mut self.preview,
            StreamKind::Callback => &mut self.callback,
            StreamKind::Capture => &mut self.capture,
            StreamKind::Recording => &mut self.recording,
        }
    }

    /// Preview stream id while preview is running.
    fn preview_stream(&self) -> Option<DeviceStreamId> {
        if self.preview_enabled && self.preview.is_active() {
            self.preview.stream_id()
        } else {
            None
        }
    }
}

/// State shared between the façade, the frame processor and device
/// callbacks.
pub(crate) struct ClientShared {
    pub(crate) device: Arc<dyn CameraDevice>,
    pub(crate) tunables: ClientTunables,
    ops: Mutex<OpState>,
    listener: Mutex<Option<Arc<dyn ClientListener>>>,
    pub(crate) params: SharedParameters,
    pub(crate) routes: RouteTable,
    pub(crate) triggers: Mutex<TriggerTracker>,
    last_frame: LatestValue<FrameMetadata>,
    fault_pending: AtomicBool,
    af_in_motion: AtomicBool,
    pub(crate) still_capture_pending: AtomicBool,
    pub(crate) recording_frames: AtomicU64,
    pub(crate) metrics: FrameMetrics,
}

impl ClientShared {
    /// Deliver a notification; the listener runs outside the listener lock.
    /// Returns whether a listener accepted it.
    pub(crate) fn notify(&self, notification: Notification) -> bool {
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) => listener.notify(notification),
            None => {
                trace!(event = notification.name(), "no listener attached");
                false
            }
        }
    }

    pub(crate) fn store_last_frame(&self, metadata: FrameMetadata) {
        self.last_frame.store(metadata);
    }

    pub(crate) fn apply_trigger_outcome(&self, outcome: TriggerOutcome) {
        match outcome {
            TriggerOutcome::AutoFocus {
                trigger_id,
                focused,
            } => {
                debug!(trigger = trigger_id.0, focused, "autofocus finished");
                self.notify(Notification::AutoFocus {
                    focused,
                    trigger_id,
                });
            }
            TriggerOutcome::Precapture {
                trigger_id,
                settled,
                follow_up,
            } => {
                debug!(trigger = trigger_id.0, settled, "precapture finished");
                self.notify(Notification::AutoExposure {
                    settled,
                    trigger_id,
                });
                let Some(request) = follow_up else {
                    return;
                };
                if let Err(err) = retry_busy("still capture", || self.device.capture(request.clone()))
                {
                    warn!(request = %request.request_id(), %err, "still capture after precapture failed");
                    self.still_capture_pending.store(false, Ordering::Release);
                    self.notify(Notification::Error {
                        code: DeviceErrorCode::Request,
                        arg1: request.request_id().0,
                        arg2: 0,
                    });
                }
            }
        }
    }

    /// Tear streams down after a fatal device error, if one is pending and
    /// the operation lock frees up within the fault wait.
    pub(crate) fn service_fault(&self) {
        if !self.fault_pending.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(mut ops) = self.ops.try_lock_for(self.tunables.fault_lock_wait()) else {
            trace!("operation lock busy, deferring fault teardown");
            self.fault_pending.store(true, Ordering::Release);
            return;
        };
        if !ops.connected {
            return;
        }
        error!("tearing down streams after device fault");
        if let Err(err) = self.stop_repeating() {
            warn!(%err, "failed to stop repeating request after fault");
        }
        ops.preview_enabled = false;
        ops.recording_enabled = false;
        let ctx = self.ctx();
        for kind in StreamKind::ALL {
            if let Err(err) = ops.controller_mut(kind).discard(&ctx) {
                warn!(%kind, %err, "stream teardown after fault incomplete");
            }
        }
        self.triggers.lock().clear();
        self.still_capture_pending.store(false, Ordering::Release);
    }

    fn ctx(&self) -> StreamContext<'_> {
        StreamContext {
            device: &*self.device,
            routes: &self.routes,
            tunables: &self.tunables,
        }
    }

    /// Disconnected first, then ownership; neither has side effects.
    fn check(&self, ops: &OpState, caller: CallerId) -> Result<(), ClientError> {
        if !ops.connected {
            return Err(ClientError::Disconnected);
        }
        if ops.owner != Some(caller) {
            return Err(ClientError::PermissionDenied {
                caller,
                owner: ops.owner,
            });
        }
        Ok(())
    }

    fn spec_for(&self, kind: StreamKind, params: &Parameters) -> StreamSpec {
        match kind {
            StreamKind::Preview => StreamSpec {
                format: params.preview,
                buffers: self.tunables.preview_buffers,
            },
            StreamKind::Callback => StreamSpec {
                format: params.callback_format(),
                buffers: self.tunables.callback_buffers,
            },
            StreamKind::Capture => StreamSpec {
                format: params.picture,
                buffers: self.tunables.capture_buffers,
            },
            StreamKind::Recording => StreamSpec {
                format: params.video,
                buffers: params.video_buffer_count,
            },
        }
    }

    fn stop_repeating(&self) -> Result<(), ClientError> {
        retry_busy("clear repeating request", || self.device.clear_repeating_request())
    }

    /// Bring the preview, callback and recording streams in line with
    /// `params`. The repeating request is stopped first whenever a stream
    /// it may target has to be removed or recreated.
    fn configure_streams(&self, ops: &mut OpState, params: &Parameters) -> Result<(), ClientError> {
        let ctx = self.ctx();
        let preview = self.spec_for(StreamKind::Preview, params);
        let callback = self.spec_for(StreamKind::Callback, params);
        let recording = self.spec_for(StreamKind::Recording, params);
        let flags = params.callback_flags;

        let disruptive = (ops.preview.is_active() && ops.preview.needs_reconfigure(&preview))
            || (ops.callback.is_active() && (!flags.enabled || ops.callback.needs_reconfigure(&callback)))
            || (ops.recording_enabled
                && ops.recording.is_active()
                && ops.recording.needs_reconfigure(&recording));
        if disruptive {
            self.stop_repeating()?;
        }

        ops.preview.update(preview, ops.surface.clone(), &ctx)?;
        if flags.enabled {
            ops.callback.update(callback, None, &ctx)?;
            ops.callback.arm(true, flags.one_shot);
        } else if ops.callback.is_active() {
            ops.callback.delete(&ctx)?;
        }
        if ops.recording_enabled {
            ops.recording.update(recording, None, &ctx)?;
            ops.recording.arm(true, false);
        }
        Ok(())
    }

    fn submit_repeating(&self, ops: &mut OpState, params: &Parameters) -> Result<(), ClientError> {
        let preview = ops
            .preview
            .stream_id()
            .ok_or_else(|| ClientError::InvalidOperation("no preview stream configured".into()))?;
        let mut targets: SmallVec<[DeviceStreamId; 4]> = smallvec![preview];
        if params.callback_flags.enabled
            && let Some(callback) = ops.callback.stream_id()
        {
            targets.push(callback);
        }
        if ops.recording_enabled {
            let recording = ops.recording.stream_id().ok_or_else(|| {
                ClientError::InvalidOperation("no recording stream configured".into())
            })?;
            targets.push(recording);
        }
        let request = ops.builder.preview(params, &targets, ops.recording_enabled)?;
        debug!(request = %request.request_id(), targets = targets.len(), version = params.version(), "submitting repeating request");
        retry_busy("set repeating request", || {
            self.device.set_repeating_request(request.clone())
        })
    }

    fn stream_locked(&self, ops: &mut OpState, params: &Parameters) -> Result<(), ClientError> {
        self.configure_streams(ops, params)?;
        self.submit_repeating(ops, params)
    }

    fn start_preview_locked(&self, ops: &mut OpState) -> Result<(), ClientError> {
        if ops.recording_enabled {
            return Err(ClientError::InvalidOperation(
                "cannot start preview while recording".into(),
            ));
        }
        if ops.preview_stream().is_some() {
            return Ok(());
        }
        ops.preview_enabled = true;
        if ops.surface.is_none() {
            debug!("preview deferred until a preview target is set");
            return Ok(());
        }
        let params = self.params.snapshot();
        if let Err(err) = self.stream_locked(ops, &params) {
            ops.preview_enabled = false;
            return Err(err);
        }
        info!(format = %params.preview, "preview started");
        Ok(())
    }

    fn stop_preview_locked(&self, ops: &mut OpState) -> Result<(), ClientError> {
        ops.preview_enabled = false;
        ops.recording_enabled = false;
        ops.recording.arm(false, false);
        self.stop_repeating()?;
        for kind in StreamKind::ALL {
            if let Some(pool) = ops.controller(kind).pool() {
                pool.wait_for_drain(self.tunables.drain_timeout())
                    .map_err(|err| ClientError::from_pool(kind, err).escalate())?;
            }
        }
        info!("preview stopped");
        Ok(())
    }

    /// Reapply streams and the repeating request after a snapshot change.
    fn restream_locked(&self, ops: &mut OpState, params: &Parameters) -> Result<(), ClientError> {
        if ops.preview_stream().is_none() {
            return Ok(());
        }
        if let Err(err) = self.stream_locked(ops, params) {
            warn!(%err, "preview stopped after failed reconfiguration");
            ops.preview_enabled = false;
            ops.recording_enabled = false;
            ops.recording.arm(false, false);
            return Err(err);
        }
        Ok(())
    }

    fn trigger_focus(&self, ops: &mut OpState, params: &Parameters) -> Result<(), ClientError> {
        let preview = ops.preview_stream().ok_or_else(|| {
            ClientError::InvalidOperation("autofocus needs a running preview".into())
        })?;
        let id = self.triggers.lock().next_id();
        let request = ops
            .builder
            .focus_trigger(params, &[preview], AfTrigger::Start(id))?;
        self.triggers
            .lock()
            .issue(TriggerKind::AutoFocus, id, request.request_id(), None);
        if let Err(err) = retry_busy("autofocus trigger", || self.device.capture(request.clone())) {
            self.triggers.lock().cancel(TriggerKind::AutoFocus);
            return Err(err);
        }
        debug!(trigger = id.0, request = %request.request_id(), "autofocus triggered");
        Ok(())
    }

    fn take_picture_locked(&self, ops: &mut OpState) -> Result<(), ClientError> {
        let preview = ops.preview_stream().ok_or_else(|| {
            ClientError::InvalidOperation("taking a picture needs a running preview".into())
        })?;
        if self.still_capture_pending.load(Ordering::Acquire) {
            return Err(ClientError::InvalidOperation(
                "a still capture is already in progress".into(),
            ));
        }
        let params = self.params.snapshot();
        let capture = ops.capture.update(
            self.spec_for(StreamKind::Capture, &params),
            None,
            &self.ctx(),
        )?;
        let mut targets: SmallVec<[DeviceStreamId; 4]> = smallvec![capture, preview];
        if ops.recording_enabled
            && let Some(recording) = ops.recording.stream_id()
        {
            targets.push(recording);
        }
        let request = ops
            .builder
            .still_capture(&params, &targets, ops.recording_enabled)?;
        let precapture = if params.flash_mode.needs_precapture() && !ops.recording_enabled {
            let id = self.triggers.lock().next_id();
            Some((id, ops.builder.precapture_trigger(&params, &[preview], id)?))
        } else {
            None
        };

        self.still_capture_pending.store(true, Ordering::Release);
        let submitted = match precapture {
            Some((id, trigger)) => {
                self.triggers.lock().issue(
                    TriggerKind::Precapture,
                    id,
                    trigger.request_id(),
                    Some(request),
                );
                retry_busy("precapture trigger", || self.device.capture(trigger.clone()))
                    .inspect_err(|_| {
                        self.triggers.lock().cancel(TriggerKind::Precapture);
                    })
            }
            None => retry_busy("still capture", || self.device.capture(request.clone())),
        };
        if let Err(err) = submitted {
            self.still_capture_pending.store(false, Ordering::Release);
            return Err(err);
        }
        info!(picture = %params.picture, "still capture requested");
        Ok(())
    }

    fn release_delivered(&self, buffer: &DeliveredBuffer) -> Result<(), ClientError> {
        let route = self
            .routes
            .read()
            .get(&buffer.stream)
            .cloned()
            .ok_or(ClientError::StaleBuffer(buffer.slot))?;
        route
            .pool
            .release(buffer.slot)
            .map_err(|_| ClientError::StaleBuffer(buffer.slot))
    }

    /// Stop requests and shut every stream down. The first error is
    /// returned once everything has been attempted.
    fn teardown_locked(&self, ops: &mut OpState) -> Result<(), ClientError> {
        let mut result = self.stop_repeating();
        ops.preview_enabled = false;
        ops.recording_enabled = false;
        let ctx = self.ctx();
        for kind in StreamKind::ALL {
            let shut = ops.controller_mut(kind).shutdown(&ctx);
            if let Err(err) = shut {
                error!(%kind, %err, "stream shutdown incomplete");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        self.triggers.lock().clear();
        self.still_capture_pending.store(false, Ordering::Release);
        ops.connected = false;
        ops.owner = None;
        result
    }
}

impl DeviceListener for ClientShared {
    fn on_device_error(&self, code: DeviceErrorCode, arg1: i32, arg2: i32) {
        error!(?code, arg1, arg2, "device error");
        if code.is_fatal() {
            self.fault_pending.store(true, Ordering::Release);
        }
        self.notify(Notification::Error { code, arg1, arg2 });
    }

    fn on_shutter(&self, frame_number: u64, timestamp: u64) {
        if !self.still_capture_pending.load(Ordering::Acquire) {
            trace!(frame = frame_number, "shutter without pending capture");
            return;
        }
        let play_sound = self.params.snapshot().play_shutter_sound;
        self.notify(Notification::Shutter {
            frame_number,
            timestamp,
            play_sound,
        });
    }

    fn on_auto_focus_state_change(&self, state: AfState, trigger: TriggerId) {
        let outcome = self.triggers.lock().resolve_af(state, trigger);
        if let Some(outcome) = outcome {
            self.apply_trigger_outcome(outcome);
        }
        let params = self.params.snapshot();
        if params.focus_move_messages && params.focus_mode.is_continuous() {
            let moving = state == AfState::PassiveScan;
            if self.af_in_motion.swap(moving, Ordering::AcqRel) != moving {
                self.notify(Notification::FocusMoving { moving });
            }
        }
    }

    fn on_auto_exposure_state_change(&self, state: AeState, trigger: TriggerId) {
        let outcome = self.triggers.lock().resolve_ae(state, trigger);
        if let Some(outcome) = outcome {
            self.apply_trigger_outcome(outcome);
        }
    }

    fn on_auto_white_balance_state_change(&self, state: AwbState, trigger: TriggerId) {
        trace!(?state, trigger = trigger.0, "white balance state");
    }
}

/// Client of one camera device.
///
/// Mutating calls are serialized by an operation lock and take the caller's
/// identity; only the owner may use the camera. Frames are processed on a
/// dedicated thread, which reports through the [`ClientListener`].
///
/// # Example
/// ```rust
/// use std::{sync::Arc, time::Duration};
/// use camlink::prelude::*;
///
/// struct Discard;
/// impl PreviewSurface for Discard {
///     fn id(&self) -> SurfaceId {
///         SurfaceId(1)
///     }
///     fn queue_frame(&self, _frame: &[u8], _timestamp: u64) {}
/// }
///
/// let device = Arc::new(VirtualDevice::with_defaults());
/// let events = Arc::new(NotificationQueue::default());
/// let app = CallerId(7);
/// let client =
///     CameraClient::new(device.clone(), app, events.clone(), ClientTunables::default()).unwrap();
///
/// client.set_preview_target(app, Some(Arc::new(Discard))).unwrap();
/// client.start_preview(app).unwrap();
/// device.pump().unwrap();
/// client.take_picture(app).unwrap();
/// device.pump().unwrap();
///
/// let picture = events
///     .wait_for(Duration::from_secs(1), |n| matches!(n, Notification::PictureTaken(_)))
///     .unwrap();
/// if let Notification::PictureTaken(buffer) = picture {
///     client.release_buffer(app, &buffer).unwrap();
/// }
/// client.disconnect(app).unwrap();
/// ```
pub struct CameraClient {
    shared: Arc<ClientShared>,
    processor: Mutex<Option<FrameProcessor>>,
}

impl CameraClient {
    /// Connect to `device` on behalf of `owner` with default parameters
    /// derived from the device's capabilities.
    pub fn new(
        device: Arc<dyn CameraDevice>,
        owner: CallerId,
        listener: Arc<dyn ClientListener>,
        tunables: ClientTunables,
    ) -> Result<Self, ClientError> {
        let tunables = tunables.sanitized();
        let info = device.info().clone();
        let defaults = Parameters::defaults_for(&info);
        defaults.validate(&info)?;
        let shared = Arc::new(ClientShared {
            device: device.clone(),
            tunables,
            ops: Mutex::new(OpState::new(owner, &info)),
            listener: Mutex::new(Some(listener)),
            params: SharedParameters::new(defaults),
            routes: RwLock::new(HashMap::new()),
            triggers: Mutex::new(TriggerTracker::default()),
            last_frame: LatestValue::new(),
            fault_pending: AtomicBool::new(false),
            af_in_motion: AtomicBool::new(false),
            still_capture_pending: AtomicBool::new(false),
            recording_frames: AtomicU64::new(0),
            metrics: FrameMetrics::default(),
        });
        let as_listener: Arc<dyn DeviceListener> = shared.clone();
        device.set_listener(Arc::downgrade(&as_listener));
        let processor = FrameProcessor::spawn(Arc::downgrade(&shared))?;
        info!(%owner, array = ?info.active_array, "camera client connected");
        Ok(Self {
            shared,
            processor: Mutex::new(Some(processor)),
        })
    }

    /// Attach `listener` for `caller`, who must own the camera or find it
    /// unowned.
    pub fn connect(
        &self,
        caller: CallerId,
        listener: Arc<dyn ClientListener>,
    ) -> Result<(), ClientError> {
        let mut ops = self.shared.ops.lock();
        if !ops.connected {
            return Err(ClientError::Disconnected);
        }
        if let Some(owner) = ops.owner
            && owner != caller
        {
            return Err(ClientError::PermissionDenied {
                caller,
                owner: Some(owner),
            });
        }
        ops.owner = Some(caller);
        *self.shared.listener.lock() = Some(listener);
        info!(%caller, "listener attached");
        Ok(())
    }

    /// Stop all requests, shut down every stream and the frame processor.
    ///
    /// Streams are torn down even when the device does not return in-flight
    /// buffers within the drain timeout; that case is reported as a
    /// `DeviceError` after everything has been released. Disconnecting twice
    /// is a no-op.
    pub fn disconnect(&self, caller: CallerId) -> Result<(), ClientError> {
        let result = {
            let mut ops = self.shared.ops.lock();
            if !ops.connected {
                return Ok(());
            }
            if let Some(owner) = ops.owner
                && owner != caller
            {
                return Err(ClientError::PermissionDenied {
                    caller,
                    owner: Some(owner),
                });
            }
            self.shared.teardown_locked(&mut ops)
        };
        self.stop_processor();
        *self.shared.listener.lock() = None;
        info!(%caller, "camera client disconnected");
        result
    }

    /// Take ownership; succeeds for the current owner too.
    pub fn lock(&self, caller: CallerId) -> Result<(), ClientError> {
        let mut ops = self.shared.ops.lock();
        if !ops.connected {
            return Err(ClientError::Disconnected);
        }
        match ops.owner {
            None => {
                ops.owner = Some(caller);
                debug!(%caller, "camera locked");
                Ok(())
            }
            Some(owner) if owner == caller => Ok(()),
            owner => Err(ClientError::PermissionDenied { caller, owner }),
        }
    }

    /// Give up ownership so another caller may connect.
    pub fn unlock(&self, caller: CallerId) -> Result<(), ClientError> {
        let mut ops = self.shared.ops.lock();
        self.shared.check(&ops, caller)?;
        ops.owner = None;
        debug!(%caller, "camera unlocked");
        Ok(())
    }

    /// Replace the display surface. The preview stream is recreated for the
    /// new surface; setting the current surface again does nothing.
    pub fn set_preview_target(
        &self,
        caller: CallerId,
        surface: Option<Arc<dyn PreviewSurface>>,
    ) -> Result<(), ClientError> {
        let mut guard = self.shared.ops.lock();
        let ops = &mut *guard;
        self.shared.check(ops, caller)?;
        let current = ops.surface.as_ref().map(|s| s.id());
        if current == surface.as_ref().map(|s| s.id()) {
            return Ok(());
        }
        if ops.recording_enabled {
            return Err(ClientError::InvalidOperation(
                "cannot change preview target while recording".into(),
            ));
        }
        if ops.preview.is_active() {
            self.shared.stop_repeating()?;
            ops.preview.delete(&self.shared.ctx())?;
        }
        if let Some(surface) = &surface {
            surface.set_orientation(self.shared.params.snapshot().display_orientation);
        }
        debug!(from = ?current, to = ?surface.as_ref().map(|s| s.id()), "preview target changed");
        ops.surface = surface;
        if ops.preview_enabled {
            ops.preview_enabled = false;
            self.shared.start_preview_locked(ops)?;
        }
        Ok(())
    }

    pub fn set_preview_callback_flags(
        &self,
        caller: CallerId,
        flags: CallbackFlags,
    ) -> Result<(), ClientError> {
        let mut guard = self.shared.ops.lock();
        let ops = &mut *guard;
        self.shared.check(ops, caller)?;
        let params = self.shared.params.update(|p| p.callback_flags = flags);
        debug!(bits = flags.bits(), "preview callback flags set");
        if ops.preview_stream().is_some() {
            self.shared.restream_locked(ops, &params)
        } else {
            ops.callback.arm(flags.enabled, flags.one_shot);
            Ok(())
        }
    }

    /// Start streaming preview. Without a preview target the start is
    /// deferred until one is set.
    pub fn start_preview(&self, caller: CallerId) -> Result<(), ClientError> {
        let mut guard = self.shared.ops.lock();
        let ops = &mut *guard;
        self.shared.check(ops, caller)?;
        self.shared.start_preview_locked(ops)
    }

    /// Stop preview (and recording) and wait for in-flight buffers. Streams
    /// stay configured.
    pub fn stop_preview(&self, caller: CallerId) -> Result<(), ClientError> {
        let mut guard = self.shared.ops.lock();
        let ops = &mut *guard;
        self.shared.check(ops, caller)?;
        self.shared.stop_preview_locked(ops)
    }

    /// Whether preview frames are streaming to a target.
    pub fn preview_enabled(&self) -> bool {
        let ops = self.shared.ops.lock();
        ops.preview_enabled && ops.surface.is_some()
    }

    pub fn store_metadata_in_buffers(
        &self,
        caller: CallerId,
        enabled: bool,
    ) -> Result<(), ClientError> {
        let ops = self.shared.ops.lock();
        self.shared.check(&ops, caller)?;
        if ops.recording_enabled {
            return Err(ClientError::InvalidOperation(
                "cannot change buffer mode while recording".into(),
            ));
        }
        self.shared
            .params
            .update(|p| p.store_metadata_in_buffers = enabled);
        Ok(())
    }

    /// Start recording, starting preview first if needed.
    pub fn start_recording(&self, caller: CallerId) -> Result<(), ClientError> {
        let mut guard = self.shared.ops.lock();
        let ops = &mut *guard;
        self.shared.check(ops, caller)?;
        if ops.recording_enabled {
            return Ok(());
        }
        self.shared.start_preview_locked(ops)?;
        if ops.preview_stream().is_none() {
            return Err(ClientError::InvalidOperation(
                "recording needs a running preview stream".into(),
            ));
        }
        let params = self.shared.params.snapshot();
        ops.recording_enabled = true;
        if let Err(err) = self.shared.stream_locked(ops, &params) {
            ops.recording_enabled = false;
            ops.recording.arm(false, false);
            if let Err(restore) = self.shared.submit_repeating(ops, &params) {
                warn!(%restore, "failed to restore preview after recording failure");
                ops.preview_enabled = false;
            }
            return Err(err);
        }
        info!(format = %params.video, buffers = params.video_buffer_count, "recording started");
        Ok(())
    }

    /// Stop recording and go back to plain preview.
    pub fn stop_recording(&self, caller: CallerId) -> Result<(), ClientError> {
        let mut guard = self.shared.ops.lock();
        let ops = &mut *guard;
        self.shared.check(ops, caller)?;
        if !ops.recording_enabled {
            return Ok(());
        }
        ops.recording_enabled = false;
        ops.recording.arm(false, false);
        let params = self.shared.params.snapshot();
        self.shared.submit_repeating(ops, &params)?;
        info!("recording stopped");
        Ok(())
    }

    pub fn recording_enabled(&self) -> bool {
        self.shared.ops.lock().recording_enabled
    }

    /// Return a buffer from [`Notification::RecordingFrame`].
    pub fn release_recording_frame(
        &self,
        caller: CallerId,
        buffer: &DeliveredBuffer,
    ) -> Result<(), ClientError> {
        let ops = self.shared.ops.lock();
        self.shared.check(&ops, caller)?;
        if buffer.kind != StreamKind::Recording {
            return Err(ClientError::InvalidOperation(format!(
                "{} buffer is not a recording frame",
                buffer.kind
            )));
        }
        self.shared.release_delivered(buffer)
    }

    /// Return any delivered buffer to its pool.
    pub fn release_buffer(&self, caller: CallerId, buffer: &DeliveredBuffer) -> Result<(), ClientError> {
        let ops = self.shared.ops.lock();
        self.shared.check(&ops, caller)?;
        self.shared.release_delivered(buffer)
    }

    /// Read a delivered buffer's bytes. Metadata-mode recording frames are
    /// refused.
    pub fn read_buffer<R>(
        &self,
        caller: CallerId,
        buffer: &DeliveredBuffer,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, ClientError> {
        let route = {
            let ops = self.shared.ops.lock();
            self.shared.check(&ops, caller)?;
            self.shared.routes.read().get(&buffer.stream).cloned()
        };
        let route = route.ok_or(ClientError::StaleBuffer(buffer.slot))?;
        if buffer.payload == BufferPayload::Metadata {
            return Err(ClientError::InvalidOperation(
                "metadata-mode recording frames have no readable bytes".into(),
            ));
        }
        route
            .pool
            .with_slot(buffer.slot, f)
            .map_err(|_| ClientError::StaleBuffer(buffer.slot))
    }

    /// Start an autofocus scan. Fixed-focus modes report success at once.
    pub fn auto_focus(&self, caller: CallerId) -> Result<(), ClientError> {
        let immediate = {
            let mut guard = self.shared.ops.lock();
            let ops = &mut *guard;
            self.shared.check(ops, caller)?;
            let params = self.shared.params.snapshot();
            if params.focus_mode.is_fixed() || !self.shared.device.info().has_autofocus {
                let trigger_id = self.shared.triggers.lock().next_id();
                Some(Notification::AutoFocus {
                    focused: true,
                    trigger_id,
                })
            } else {
                self.shared.trigger_focus(ops, &params)?;
                None
            }
        };
        if let Some(notification) = immediate {
            self.shared.notify(notification);
        }
        Ok(())
    }

    /// Abandon a pending autofocus; its result is never reported.
    pub fn cancel_auto_focus(&self, caller: CallerId) -> Result<(), ClientError> {
        let mut guard = self.shared.ops.lock();
        let ops = &mut *guard;
        self.shared.check(ops, caller)?;
        let cancelled = self.shared.triggers.lock().cancel(TriggerKind::AutoFocus);
        let Some(preview) = ops.preview_stream() else {
            return Ok(());
        };
        let id = match cancelled {
            Some(trigger) => trigger.id,
            None => self.shared.triggers.lock().next_id(),
        };
        let params = self.shared.params.snapshot();
        let request = ops
            .builder
            .focus_trigger(&params, &[preview], AfTrigger::Cancel(id))?;
        retry_busy("autofocus cancel", || self.shared.device.capture(request.clone()))
    }

    /// Capture a still image. Preview keeps running; with flash on or auto a
    /// precapture metering sequence runs first.
    pub fn take_picture(&self, caller: CallerId) -> Result<(), ClientError> {
        let mut guard = self.shared.ops.lock();
        let ops = &mut *guard;
        self.shared.check(ops, caller)?;
        self.shared.take_picture_locked(ops)
    }

    /// Validate and commit a new snapshot, reconfiguring running streams.
    ///
    /// Streams whose format changes are recreated once their in-flight
    /// buffers are back. On failure preview is stopped.
    pub fn set_parameters(&self, caller: CallerId, next: Parameters) -> Result<(), ClientError> {
        let mut guard = self.shared.ops.lock();
        let ops = &mut *guard;
        self.shared.check(ops, caller)?;
        next.validate(self.shared.device.info())?;
        let current = self.shared.params.snapshot();
        if ops.recording_enabled
            && (next.video != current.video || next.video_buffer_count != current.video_buffer_count)
        {
            return Err(ClientError::InvalidOperation(
                "video stream cannot change while recording".into(),
            ));
        }
        let committed = self.shared.params.commit(next);
        debug!(version = committed.version(), "parameters committed");
        if committed.display_orientation != current.display_orientation
            && let Some(surface) = &ops.surface
        {
            surface.set_orientation(committed.display_orientation);
        }
        self.shared.restream_locked(ops, &committed)
    }

    /// The current snapshot.
    pub fn parameters(&self) -> Arc<Parameters> {
        self.shared.params.snapshot()
    }

    pub fn send_command(&self, caller: CallerId, command: Command) -> Result<(), ClientError> {
        let mut guard = self.shared.ops.lock();
        let ops = &mut *guard;
        self.shared.check(ops, caller)?;
        debug!(command = command.name(), "command");
        let params = &self.shared.params;
        match command {
            Command::StartSmoothZoom(_) | Command::StopSmoothZoom => {
                debug!("smooth zoom is not supported");
            }
            Command::SetDisplayOrientation(degrees) => {
                if !matches!(degrees, 0 | 90 | 180 | 270) {
                    return Err(ClientError::ConfigurationRejected(format!(
                        "display orientation {degrees} is not a multiple of 90 below 360"
                    )));
                }
                params.update(|p| p.display_orientation = degrees);
                if let Some(surface) = &ops.surface {
                    surface.set_orientation(degrees);
                }
            }
            Command::EnableShutterSound(enabled) => {
                params.update(|p| p.play_shutter_sound = enabled);
            }
            Command::PlayRecordingSound => {
                debug!("recording sound is played by the application");
            }
            Command::StartFaceDetection => {
                if self.shared.device.info().max_faces == 0 {
                    return Err(ClientError::ConfigurationRejected(
                        "face detection is not supported".into(),
                    ));
                }
                if ops.preview_stream().is_none() {
                    return Err(ClientError::InvalidOperation(
                        "face detection needs a running preview".into(),
                    ));
                }
                let committed = params.update(|p| p.face_detection = true);
                self.shared.submit_repeating(ops, &committed)?;
            }
            Command::StopFaceDetection => {
                let committed = params.update(|p| p.face_detection = false);
                if ops.preview_stream().is_some() {
                    self.shared.submit_repeating(ops, &committed)?;
                }
            }
            Command::EnableFocusMoveMessages(enabled) => {
                params.update(|p| p.focus_move_messages = enabled);
            }
            Command::Ping => {}
            Command::SetVideoBufferCount(count) => {
                if ops.recording_enabled {
                    return Err(ClientError::InvalidOperation(
                        "cannot change video buffer count while recording".into(),
                    ));
                }
                if count == 0 {
                    return Err(ClientError::ConfigurationRejected(
                        "video buffer count must be at least 1".into(),
                    ));
                }
                params.update(|p| p.video_buffer_count = count);
            }
        }
        Ok(())
    }

    /// Metadata of the newest processed frame.
    pub fn last_frame_metadata(&self) -> Option<FrameMetadata> {
        self.shared.last_frame.load()
    }

    pub fn stream_state(&self, kind: StreamKind) -> StreamState {
        self.shared.ops.lock().controller(kind).state()
    }

    pub fn stream_id(&self, kind: StreamKind) -> Option<DeviceStreamId> {
        self.shared.ops.lock().controller(kind).stream_id()
    }

    pub fn pool_stats(&self, kind: StreamKind) -> Option<BufferPoolStats> {
        self.shared
            .ops
            .lock()
            .controller(kind)
            .pool()
            .map(BufferPool::stats)
    }

    pub fn pool_metrics(&self, kind: StreamKind) -> Option<BufferPoolMetrics> {
        self.shared
            .ops
            .lock()
            .controller(kind)
            .pool()
            .map(BufferPool::metrics)
    }

    pub fn metrics(&self) -> FrameMetrics {
        self.shared.metrics.clone()
    }

    /// Recording frames delivered since the client was created.
    pub fn recording_frame_count(&self) -> u64 {
        self.shared.recording_frames.load(Ordering::Relaxed)
    }

    fn stop_processor(&self) {
        if let Some(processor) = self.processor.lock().take() {
            processor.stop();
        }
    }
}

impl Drop for CameraClient {
    fn drop(&mut self) {
        let result = {
            let mut ops = self.shared.ops.lock();
            if ops.connected {
                Some(self.shared.teardown_locked(&mut ops))
            } else {
                None
            }
        };
        if let Some(Err(err)) = result {
            warn!(%err, "teardown on drop incomplete");
        }
        self.stop_processor();
    }
}
