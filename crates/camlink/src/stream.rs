//! Per-output stream lifecycle.
//!
//! A controller owns one device stream, its buffer pool and the route the
//! frame processor uses to dispatch that stream's buffers. Streams are never
//! resized in place: a changed format or depth tears the old stream down and
//! creates a new one, and the device stream is only deleted once none of its
//! slots are still in flight.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use camlink_core::prelude::*;
use camlink_device::{CameraDevice, DeviceError, DeviceStreamId, StreamConfig, StreamKind};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{
    error::{ClientError, retry_busy},
    notify::PreviewSurface,
    tunables::ClientTunables,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Absent,
    Configuring,
    Active,
    Reconfiguring,
    /// Terminal; reached on disconnect.
    TornDown,
}

/// What a stream should look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub format: StreamFormat,
    pub buffers: usize,
}

/// Frame processor's view of a stream.
pub(crate) struct StreamRoute {
    pub(crate) kind: StreamKind,
    pub(crate) pool: BufferPool,
    pub(crate) surface: Option<Arc<dyn PreviewSurface>>,
    /// Set while the stream is being torn down; buffers are released unseen.
    pub(crate) retired: AtomicBool,
    /// Whether buffers go to the application.
    pub(crate) deliver: AtomicBool,
    /// Disarm delivery after the next buffer.
    pub(crate) one_shot: AtomicBool,
}

impl StreamRoute {
    pub(crate) fn is_live(&self) -> bool {
        !self.retired.load(Ordering::Acquire)
    }

    /// Whether the next buffer goes to the application, consuming a
    /// one-shot arming.
    pub(crate) fn take_delivery(&self) -> bool {
        if self.one_shot.load(Ordering::Acquire) {
            self.deliver
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        } else {
            self.deliver.load(Ordering::Acquire)
        }
    }

    pub(crate) fn release(&self, slot: SlotHandle) {
        if let Err(err) = self.pool.release(slot) {
            debug!(kind = %self.kind, %err, "buffer already gone");
        }
    }
}

pub(crate) type RouteTable = RwLock<HashMap<DeviceStreamId, Arc<StreamRoute>>>;

pub(crate) struct StreamContext<'a> {
    pub(crate) device: &'a dyn CameraDevice,
    pub(crate) routes: &'a RouteTable,
    pub(crate) tunables: &'a ClientTunables,
}

struct Configured {
    id: DeviceStreamId,
    spec: StreamSpec,
    pool: BufferPool,
    route: Arc<StreamRoute>,
}

pub(crate) struct StreamController {
    kind: StreamKind,
    state: StreamState,
    current: Option<Configured>,
}

impl StreamController {
    pub(crate) fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            state: StreamState::Absent,
            current: None,
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        self.state
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state == StreamState::Active
    }

    pub(crate) fn stream_id(&self) -> Option<DeviceStreamId> {
        self.current.as_ref().map(|c| c.id)
    }

    pub(crate) fn pool(&self) -> Option<&BufferPool> {
        self.current.as_ref().map(|c| &c.pool)
    }

    pub(crate) fn route(&self) -> Option<&Arc<StreamRoute>> {
        self.current.as_ref().map(|c| &c.route)
    }

    /// Whether `update(spec)` would create or recreate the device stream.
    pub(crate) fn needs_reconfigure(&self, spec: &StreamSpec) -> bool {
        !self.is_active() || self.current.as_ref().is_none_or(|c| c.spec != *spec)
    }

    /// Arm or disarm application delivery.
    pub(crate) fn arm(&self, deliver: bool, one_shot: bool) {
        if let Some(route) = self.route() {
            route.one_shot.store(one_shot, Ordering::Release);
            route.deliver.store(deliver, Ordering::Release);
        }
    }

    /// Configure the stream, recreating it when `spec` differs from the
    /// active one.
    ///
    /// The caller must make sure no repeating request targets the stream
    /// when it is recreated.
    pub(crate) fn update(
        &mut self,
        spec: StreamSpec,
        surface: Option<Arc<dyn PreviewSurface>>,
        ctx: &StreamContext<'_>,
    ) -> Result<DeviceStreamId, ClientError> {
        match self.state {
            StreamState::TornDown => return Err(ClientError::Disconnected),
            StreamState::Active if !self.needs_reconfigure(&spec) => {
                if let Some(current) = &self.current {
                    return Ok(current.id);
                }
            }
            StreamState::Active => {
                debug!(kind = %self.kind, format = %spec.format, buffers = spec.buffers, "reconfiguring stream");
                self.state = StreamState::Reconfiguring;
                if let Err(err) = self.teardown(ctx, false) {
                    self.state = StreamState::Active;
                    return Err(err);
                }
            }
            _ => {}
        }
        self.state = StreamState::Configuring;
        match self.configure(spec, surface, ctx) {
            Ok(id) => {
                self.state = StreamState::Active;
                Ok(id)
            }
            Err(err) => {
                self.state = StreamState::Absent;
                Err(err)
            }
        }
    }

    /// Remove the stream; it can be configured again later.
    ///
    /// When in-flight buffers do not come back in time the stream stays
    /// active and the escalated error is returned.
    pub(crate) fn delete(&mut self, ctx: &StreamContext<'_>) -> Result<(), ClientError> {
        if self.state == StreamState::TornDown {
            return Ok(());
        }
        self.teardown(ctx, false)?;
        self.state = StreamState::Absent;
        Ok(())
    }

    /// Remove the stream even when the device does not return its buffers
    /// in time; it can be configured again later.
    pub(crate) fn discard(&mut self, ctx: &StreamContext<'_>) -> Result<(), ClientError> {
        if self.state == StreamState::TornDown {
            return Ok(());
        }
        let result = self.teardown(ctx, true);
        self.state = StreamState::Absent;
        result
    }

    /// Remove the stream for good, even when the device does not return its
    /// buffers in time.
    pub(crate) fn shutdown(&mut self, ctx: &StreamContext<'_>) -> Result<(), ClientError> {
        let result = self.teardown(ctx, true);
        self.state = StreamState::TornDown;
        result
    }

    fn configure(
        &mut self,
        spec: StreamSpec,
        surface: Option<Arc<dyn PreviewSurface>>,
        ctx: &StreamContext<'_>,
    ) -> Result<DeviceStreamId, ClientError> {
        if !ctx.device.info().supports(&spec.format) {
            return Err(ClientError::ConfigurationRejected(format!(
                "{} format {} not supported by device",
                self.kind, spec.format
            )));
        }
        let slot_bytes = spec.format.buffer_size().ok_or_else(|| {
            ClientError::ConfigurationRejected(format!("no buffer size known for {}", spec.format))
        })?;
        let policy = match self.kind {
            StreamKind::Callback => ExhaustionPolicy::DropOldest,
            _ => ExhaustionPolicy::Block,
        };
        let pool = BufferPool::new(spec.buffers.max(1), slot_bytes, policy);
        let config = StreamConfig {
            kind: self.kind,
            format: spec.format,
            pool: pool.clone(),
        };
        let id = match retry_busy("create stream", || ctx.device.create_stream(config.clone())) {
            Ok(id) => id,
            Err(err) => {
                pool.close();
                return Err(err);
            }
        };
        let route = Arc::new(StreamRoute {
            kind: self.kind,
            pool: pool.clone(),
            surface,
            retired: AtomicBool::new(false),
            deliver: AtomicBool::new(false),
            one_shot: AtomicBool::new(false),
        });
        ctx.routes.write().insert(id, route.clone());
        info!(kind = %self.kind, stream = %id, format = %spec.format, buffers = spec.buffers, "stream configured");
        self.current = Some(Configured {
            id,
            spec,
            pool,
            route,
        });
        Ok(id)
    }

    /// Retire the route, wait for in-flight buffers, delete the device
    /// stream and close the pool.
    ///
    /// Unforced, a drain timeout puts the route back and leaves everything
    /// in place.
    fn teardown(&mut self, ctx: &StreamContext<'_>, force: bool) -> Result<(), ClientError> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };
        current.route.retired.store(true, Ordering::Release);
        let mut result = Ok(());
        if let Err(err) = current.pool.wait_for_drain(ctx.tunables.drain_timeout()) {
            let err = ClientError::from_pool(self.kind, err).escalate();
            if !force {
                warn!(kind = %self.kind, stream = %current.id, %err, "stream still busy, keeping it");
                current.route.retired.store(false, Ordering::Release);
                self.current = Some(current);
                return Err(err);
            }
            warn!(kind = %self.kind, stream = %current.id, %err, "forcing stream teardown");
            result = Err(err);
        }

        ctx.routes.write().remove(&current.id);
        let deleted = match ctx.device.delete_stream(current.id) {
            Err(DeviceError::Busy) => {
                debug!(kind = %self.kind, stream = %current.id, "device busy, retrying deletion once");
                ctx.device.delete_stream(current.id)
            }
            other => other,
        };
        match deleted {
            Ok(()) => {}
            Err(DeviceError::NoSuchStream(_)) => {
                debug!(kind = %self.kind, stream = %current.id, "device already dropped stream");
            }
            Err(err) => {
                warn!(kind = %self.kind, stream = %current.id, %err, "device refused stream deletion");
                if result.is_ok() {
                    result = Err(err.into());
                }
            }
        }
        current.pool.close();
        debug!(kind = %self.kind, stream = %current.id, "stream removed");
        result
    }
}
