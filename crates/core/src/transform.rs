//! Mapping between normalized coordinates and sensor pixel-array coordinates.
//!
//! Applications describe regions (focus areas, metering areas, detected
//! faces) in a resolution-independent space spanning `[-1000, 1000]` on both
//! axes. The device works in pixel-array coordinates. The mapping is affine
//! over the active crop region, so zoom changes which pixels the normalized
//! space covers.

use std::num::NonZeroU32;

use crate::format::Resolution;

/// Lowest normalized coordinate.
pub const NORMALIZED_MIN: i32 = -1000;
/// Highest normalized coordinate.
pub const NORMALIZED_MAX: i32 = 1000;
const NORMALIZED_SPAN: i64 = (NORMALIZED_MAX - NORMALIZED_MIN) as i64;

/// Rectangle in pixel-array coordinates (inclusive edges).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArrayRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// Rectangle in normalized coordinates (inclusive edges).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NormalizedRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl NormalizedRect {
    /// The whole normalized space.
    pub const FULL: NormalizedRect = NormalizedRect {
        left: NORMALIZED_MIN,
        top: NORMALIZED_MIN,
        right: NORMALIZED_MAX,
        bottom: NORMALIZED_MAX,
    };

    /// Whether every edge is in range and the rectangle is not inverted.
    pub fn is_valid(&self) -> bool {
        let in_range = |v: i32| (NORMALIZED_MIN..=NORMALIZED_MAX).contains(&v);
        in_range(self.left)
            && in_range(self.top)
            && in_range(self.right)
            && in_range(self.bottom)
            && self.left <= self.right
            && self.top <= self.bottom
    }
}

/// Region of the pixel array currently read out by the sensor.
///
/// # Example
/// ```rust
/// use camlink_core::prelude::{CropRegion, Resolution};
///
/// let array = Resolution::new(4000, 3000).unwrap();
/// let crop = CropRegion::for_zoom(array, 2.0);
/// assert_eq!((crop.left, crop.top), (1000, 750));
/// assert_eq!((crop.width.get(), crop.height.get()), (2000, 1500));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CropRegion {
    pub left: u32,
    pub top: u32,
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl CropRegion {
    /// The entire pixel array.
    pub fn full(array: Resolution) -> Self {
        Self {
            left: 0,
            top: 0,
            width: array.width,
            height: array.height,
        }
    }

    /// Centered crop magnified by `ratio` (values below 1 are treated as 1).
    pub fn for_zoom(array: Resolution, ratio: f32) -> Self {
        let ratio = if ratio.is_finite() { ratio.max(1.0) } else { 1.0 };
        let shrink = |extent: NonZeroU32| {
            let scaled = (extent.get() as f32 / ratio).round() as u32;
            NonZeroU32::new(scaled.clamp(1, extent.get())).unwrap_or(extent)
        };
        let width = shrink(array.width);
        let height = shrink(array.height);
        Self {
            left: (array.width.get() - width.get()) / 2,
            top: (array.height.get() - height.get()) / 2,
            width,
            height,
        }
    }

    /// The crop as an inclusive array rectangle.
    pub fn to_rect(&self) -> ArrayRect {
        ArrayRect {
            left: self.left,
            top: self.top,
            right: self.left + self.width.get() - 1,
            bottom: self.top + self.height.get() - 1,
        }
    }
}

/// Affine mapping between normalized space and the pixel array over a crop.
///
/// Corners map to corners and the normalized origin maps to the crop
/// center, in both directions, for any crop at least three pixels wide and
/// tall. Array coordinates survive a round trip through normalized space
/// whenever the crop axis is no longer than 2001 pixels; past that, several
/// pixels share one normalized value.
///
/// # Example
/// ```rust
/// use camlink_core::prelude::{CoordinateMap, CropRegion, Resolution};
///
/// let map = CoordinateMap::new(CropRegion::full(Resolution::new(640, 480).unwrap()));
/// assert_eq!(map.normalized_x_to_array(-1000), 0);
/// assert_eq!(map.normalized_x_to_array(1000), 639);
/// assert_eq!(map.array_x_to_normalized(639), 1000);
/// assert_eq!(map.array_x_to_normalized(map.normalized_x_to_array(0)), 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinateMap {
    crop: CropRegion,
}

impl CoordinateMap {
    pub fn new(crop: CropRegion) -> Self {
        Self { crop }
    }

    pub fn crop(&self) -> CropRegion {
        self.crop
    }

    pub fn normalized_x_to_array(&self, x: i32) -> u32 {
        to_array(x, self.crop.left, self.crop.width)
    }

    pub fn normalized_y_to_array(&self, y: i32) -> u32 {
        to_array(y, self.crop.top, self.crop.height)
    }

    pub fn array_x_to_normalized(&self, x: u32) -> i32 {
        to_normalized(x, self.crop.left, self.crop.width)
    }

    pub fn array_y_to_normalized(&self, y: u32) -> i32 {
        to_normalized(y, self.crop.top, self.crop.height)
    }

    pub fn rect_to_array(&self, rect: NormalizedRect) -> ArrayRect {
        ArrayRect {
            left: self.normalized_x_to_array(rect.left),
            top: self.normalized_y_to_array(rect.top),
            right: self.normalized_x_to_array(rect.right),
            bottom: self.normalized_y_to_array(rect.bottom),
        }
    }

    pub fn rect_to_normalized(&self, rect: ArrayRect) -> NormalizedRect {
        NormalizedRect {
            left: self.array_x_to_normalized(rect.left),
            top: self.array_y_to_normalized(rect.top),
            right: self.array_x_to_normalized(rect.right),
            bottom: self.array_y_to_normalized(rect.bottom),
        }
    }
}

fn to_array(value: i32, origin: u32, extent: NonZeroU32) -> u32 {
    let span = extent.get() as i64 - 1;
    let shifted = (value.clamp(NORMALIZED_MIN, NORMALIZED_MAX) - NORMALIZED_MIN) as i64;
    origin + (shifted * span / NORMALIZED_SPAN) as u32
}

fn to_normalized(value: u32, origin: u32, extent: NonZeroU32) -> i32 {
    let span = extent.get() as i64 - 1;
    if span == 0 {
        return 0;
    }
    let offset = (value.saturating_sub(origin) as i64).min(span);
    // normalized values (shifted to 0..=2000) that map forward onto `offset`
    let lo = div_ceil(offset * NORMALIZED_SPAN, span).min(NORMALIZED_SPAN);
    let hi = (div_ceil((offset + 1) * NORMALIZED_SPAN, span) - 1).min(NORMALIZED_SPAN);
    let (lo, hi) = (
        (lo + NORMALIZED_MIN as i64) as i32,
        (hi + NORMALIZED_MIN as i64) as i32,
    );
    if lo > hi {
        lo
    } else if lo == NORMALIZED_MIN {
        NORMALIZED_MIN
    } else if hi == NORMALIZED_MAX {
        NORMALIZED_MAX
    } else if lo <= 0 && hi >= 0 {
        0
    } else if hi < 0 {
        hi
    } else {
        lo
    }
}

fn div_ceil(num: i64, den: i64) -> i64 {
    (num + den - 1) / den
}
