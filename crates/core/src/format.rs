use std::{fmt, num::NonZeroU32, str::FromStr};

/// Four-character code describing a stream pixel format.
///
/// # Example
/// ```rust
/// use camlink_core::prelude::FourCc;
///
/// let fcc = FourCc::new(*b"NV21");
/// assert_eq!(fcc.to_string(), "NV21");
/// assert_eq!(fcc, FourCc::NV21);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FourCc([u8; 4]);

impl FourCc {
    /// YCrCb 4:2:0 semi-planar (the default callback format).
    pub const NV21: FourCc = FourCc::new(*b"NV21");
    /// YCbCr 4:2:2 semi-planar.
    pub const NV16: FourCc = FourCc::new(*b"NV16");
    /// Planar YCrCb 4:2:0 with 16-byte aligned chroma stride.
    pub const YV12: FourCc = FourCc::new(*b"YV12");
    /// Packed YCbCr 4:2:2.
    pub const YUYV: FourCc = FourCc::new(*b"YUYV");
    /// Packed RGB 5:6:5.
    pub const RGB565: FourCc = FourCc::new(*b"RGBP");
    /// Packed RGBA 8:8:8:8.
    pub const RGBA: FourCc = FourCc::new(*b"RGBA");
    /// 16-bit raw sensor data.
    pub const RAW16: FourCc = FourCc::new(*b"RW16");
    /// Compressed still image; contents are opaque to the client.
    pub const JPEG: FourCc = FourCc::new(*b"JPEG");
    /// Device-chosen layout used for display and encoder streams.
    pub const OPAQUE: FourCc = FourCc::new(*b"OPAQ");

    /// Construct from raw bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Try to convert to a printable string.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<u32> for FourCc {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

impl FromStr for FourCc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err("fourcc must be four ASCII bytes".into());
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(FourCc(arr))
    }
}

/// Resolution of a frame.
///
/// # Example
/// ```rust
/// use camlink_core::prelude::Resolution;
///
/// let res = Resolution::new(640, 480).unwrap();
/// assert_eq!(res.width.get(), 640);
/// assert_eq!(res.to_string(), "640x480");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resolution {
    /// Width in pixels (non-zero).
    pub width: NonZeroU32,
    /// Height in pixels (non-zero).
    pub height: NonZeroU32,
}

impl Resolution {
    /// 1x1, the smallest representable resolution.
    pub const MIN: Resolution = Resolution {
        width: NonZeroU32::MIN,
        height: NonZeroU32::MIN,
    };

    /// Create a resolution, returning `None` if width or height are zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }

    /// Number of pixels covered.
    pub fn pixel_count(&self) -> usize {
        self.width.get() as usize * self.height.get() as usize
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Target frame-rate range in frames per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FpsRange {
    pub min: u32,
    pub max: u32,
}

impl FpsRange {
    /// Create a range, returning `None` when empty or inverted.
    pub fn new(min: u32, max: u32) -> Option<Self> {
        (min > 0 && min <= max).then_some(Self { min, max })
    }

    /// Whether `other` lies fully inside this range.
    pub fn contains(&self, other: FpsRange) -> bool {
        other.min >= self.min && other.max <= self.max
    }
}

impl Default for FpsRange {
    fn default() -> Self {
        Self { min: 15, max: 30 }
    }
}

/// Pixel format plus dimensions of one output stream.
///
/// # Example
/// ```rust
/// use camlink_core::prelude::{FourCc, Resolution, StreamFormat};
///
/// let format = StreamFormat::new(FourCc::NV21, Resolution::new(640, 480).unwrap());
/// assert_eq!(format.buffer_size(), Some(640 * 480 * 3 / 2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamFormat {
    pub code: FourCc,
    pub resolution: Resolution,
}

impl StreamFormat {
    pub fn new(code: FourCc, resolution: Resolution) -> Self {
        Self { code, resolution }
    }

    /// Bytes needed per buffer, using the width as stride.
    pub fn buffer_size(&self) -> Option<usize> {
        frame_size(
            self.code,
            self.resolution,
            self.resolution.width.get() as usize,
        )
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.resolution)
    }
}

/// Bytes needed to hold one frame of `code` at `resolution` with the given
/// luma stride, or `None` for formats whose size is not derivable.
///
/// Compressed and opaque formats are bounded by the 12-bit-per-pixel size so
/// pools backing them can still be allocated up front.
///
/// # Example
/// ```rust
/// use camlink_core::prelude::{FourCc, Resolution, frame_size};
///
/// let res = Resolution::new(64, 32).unwrap();
/// assert_eq!(frame_size(FourCc::RGBA, res, 64), Some(64 * 32 * 4));
/// assert_eq!(frame_size(FourCc::YV12, res, 64), Some(64 * 32 + 2 * (32 * 16)));
/// ```
pub fn frame_size(code: FourCc, resolution: Resolution, stride: usize) -> Option<usize> {
    let width = resolution.width.get() as usize;
    let height = resolution.height.get() as usize;
    match code {
        FourCc::NV16 | FourCc::YUYV | FourCc::RGB565 | FourCc::RAW16 => Some(width * height * 2),
        FourCc::NV21 => Some(width * height * 3 / 2),
        FourCc::RGBA => Some(width * height * 4),
        FourCc::YV12 => {
            let stride = stride.max(width);
            let y_size = stride * height;
            let uv_stride = (stride / 2 + 0xf) & !0xf;
            let uv_size = uv_stride * height / 2;
            Some(y_size + uv_size * 2)
        }
        FourCc::JPEG | FourCc::OPAQUE => Some(width * height * 3 / 2),
        _ => None,
    }
}
