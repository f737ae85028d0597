#![doc = include_str!("../README.md")]

pub mod client;
pub mod command;
pub mod error;
mod frame_processor;
pub mod metrics;
pub mod notify;
pub mod params;
pub mod request;
pub mod stream;
pub mod trigger;
pub mod tunables;

pub use client::{CallerId, CameraClient};

pub mod prelude {
    pub use crate::{
        client::{CallerId, CameraClient},
        command::Command,
        error::ClientError,
        metrics::FrameMetrics,
        notify::{
            BufferPayload, ClientListener, CopiedFrame, DeliveredBuffer, Face, Notification,
            NotificationQueue, PreviewSurface, SurfaceId,
        },
        params::{CallbackFlags, FocusMode, MeteringArea, NUM_ZOOM_STEPS, Parameters, SharedParameters},
        request::{PREVIEW_REQUEST_ID, RECORDING_REQUEST_ID, RequestBuilder, zoom_crop},
        stream::{StreamSpec, StreamState},
        trigger::{PendingTrigger, TriggerKind, TriggerOutcome, TriggerTracker},
        tunables::{ClientConfig, ClientTunables},
    };
    pub use camlink_device::prelude::*;
}
