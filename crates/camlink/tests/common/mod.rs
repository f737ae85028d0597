#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicU32, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use camlink::prelude::*;

pub const APP: CallerId = CallerId(10);
pub const OTHER: CallerId = CallerId(11);

/// Display stand-in counting the frames it was handed.
#[derive(Default)]
pub struct CountingSurface {
    pub id: u64,
    pub frames: AtomicU64,
    pub orientation: AtomicU32,
}

impl CountingSurface {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            ..Self::default()
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }
}

impl PreviewSurface for CountingSurface {
    fn id(&self) -> SurfaceId {
        SurfaceId(self.id)
    }

    fn queue_frame(&self, frame: &[u8], _timestamp: u64) {
        assert!(!frame.is_empty());
        self.frames.fetch_add(1, Ordering::AcqRel);
    }

    fn set_orientation(&self, degrees: u32) {
        self.orientation.store(degrees, Ordering::Release);
    }
}

pub struct Rig {
    pub device: Arc<VirtualDevice>,
    pub events: Arc<NotificationQueue>,
    pub client: CameraClient,
    pub surface: Arc<CountingSurface>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn rig() -> Rig {
    rig_with(ClientConfig::new().drain_timeout_ms(2000).build())
}

pub fn rig_with(tunables: ClientTunables) -> Rig {
    let events = Arc::new(NotificationQueue::new(256));
    rig_from(events.clone(), events, tunables)
}

/// Rig whose client reports to `listener`; `events` is what tests poll.
pub fn rig_from(
    events: Arc<NotificationQueue>,
    listener: Arc<dyn ClientListener>,
    tunables: ClientTunables,
) -> Rig {
    init_tracing();
    let device = Arc::new(VirtualDevice::with_defaults());
    let client =
        CameraClient::new(device.clone(), APP, listener, tunables).expect("client connects");
    Rig {
        device,
        events,
        client,
        surface: CountingSurface::new(1),
    }
}

impl Rig {
    /// Attach the surface and start preview.
    pub fn preview(&self) {
        self.client
            .set_preview_target(APP, Some(self.surface.clone()))
            .expect("preview target");
        self.client.start_preview(APP).expect("preview starts");
    }

    /// Produce one frame, waiting while the frame processor returns
    /// preview slots.
    pub fn pump(&self) -> bool {
        for _ in 0..500 {
            match self.device.pump() {
                Ok(produced) => return produced,
                Err(DeviceError::ResourceExhausted(_)) => thread::sleep(Duration::from_millis(2)),
                Err(err) => panic!("frame failed: {err}"),
            }
        }
        panic!("device stayed exhausted");
    }

    pub fn pump_n(&self, count: usize) {
        for _ in 0..count {
            assert!(self.pump(), "device idle");
        }
    }

    /// Pump frames until a matching notification shows up.
    pub fn pump_until(&self, mut pred: impl FnMut(&Notification) -> bool) -> Notification {
        for _ in 0..100 {
            self.pump();
            if let Some(found) = self.events.wait_for(Duration::from_millis(20), &mut pred) {
                return found;
            }
        }
        panic!("notification never arrived");
    }

    /// Notifications that arrive within `window`.
    pub fn collect(&self, window: Duration) -> Vec<Notification> {
        let deadline = Instant::now() + window;
        let mut seen = Vec::new();
        while let Some(n) = self
            .events
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
        {
            seen.push(n);
        }
        seen
    }

    /// Wait until the frame processor has handled every produced frame.
    pub fn settle(&self) {
        wait_until(Duration::from_secs(2), || {
            let frames = self
                .device
                .events()
                .iter()
                .filter(|e| matches!(e, DeviceEvent::FrameCompleted { .. }))
                .count() as u64;
            let metrics = self.client.metrics();
            metrics.frames() + metrics.stale_frames() >= frames
        });
    }

    pub fn params(&self) -> Parameters {
        Parameters::clone(&self.client.parameters())
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within {timeout:?}");
        thread::sleep(Duration::from_millis(2));
    }
}

pub fn count(events: &[Notification], pred: impl Fn(&Notification) -> bool) -> usize {
    events.iter().filter(|n| pred(n)).count()
}
