#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod format;
pub mod metrics;
pub mod queue;
pub mod transform;

pub mod prelude {
    pub use crate::{
        buffer::{
            BufferPool, BufferPoolMetrics, BufferPoolStats, ExhaustionPolicy, PoolError, PoolId,
            SlotHandle, SlotState,
        },
        format::{FourCc, FpsRange, Resolution, StreamFormat, frame_size},
        metrics::Metrics,
        queue::{BoundedRx, BoundedTx, LatestValue, RecvOutcome, SendOutcome, bounded},
        transform::{
            ArrayRect, CoordinateMap, CropRegion, NORMALIZED_MAX, NORMALIZED_MIN, NormalizedRect,
        },
    };
}
