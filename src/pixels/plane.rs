//! Single 2-D pixel planes and the geometric operations stitching needs.

use std::fmt;
use std::str::FromStr;

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma, Pixel};
use serde::{Deserialize, Serialize};

use crate::error::StitchError;

/// Single-band plane with primitive element type `T`.
pub type Plane<T> = ImageBuffer<Luma<T>, Vec<T>>;

// =============================================================================
// Pixel Type
// =============================================================================

/// Element type of a pixel plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "uint16")]
    U16,
    #[serde(rename = "float")]
    F32,
}

impl PixelType {
    /// Name used in metadata documents.
    pub const fn name(&self) -> &'static str {
        match self {
            PixelType::U8 => "uint8",
            PixelType::U16 => "uint16",
            PixelType::F32 => "float",
        }
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, PixelType::F32)
    }

    pub const fn is_uint(&self) -> bool {
        matches!(self, PixelType::U8 | PixelType::U16)
    }

    /// Largest representable value, used when clamping corrected pixels.
    pub const fn max_value(&self) -> f64 {
        match self {
            PixelType::U8 => u8::MAX as f64,
            PixelType::U16 => u16::MAX as f64,
            PixelType::F32 => f32::MAX as f64,
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uint8" | "u8" => Ok(PixelType::U8),
            "uint16" | "u16" => Ok(PixelType::U16),
            "float" | "float32" | "f32" => Ok(PixelType::F32),
            other => Err(format!("unknown pixel type '{other}'")),
        }
    }
}

// =============================================================================
// Join Direction
// =============================================================================

/// Direction in which two planes are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDirection {
    /// Second plane to the right of the first
    Horizontal,
    /// Second plane below the first
    Vertical,
}

// =============================================================================
// Pixel Plane
// =============================================================================

/// A single 2-D pixel plane of one of the supported element types.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelPlane {
    U8(GrayImage),
    U16(Plane<u16>),
    F32(Plane<f32>),
}

macro_rules! map_plane {
    ($plane:expr, $buf:ident => $body:expr) => {
        match $plane {
            PixelPlane::U8($buf) => PixelPlane::U8($body),
            PixelPlane::U16($buf) => PixelPlane::U16($body),
            PixelPlane::F32($buf) => PixelPlane::F32($body),
        }
    };
}

impl PixelPlane {
    /// Zero-filled plane.
    pub fn zeros(pixel_type: PixelType, width: u32, height: u32) -> Self {
        match pixel_type {
            PixelType::U8 => PixelPlane::U8(GrayImage::new(width, height)),
            PixelType::U16 => PixelPlane::U16(Plane::<u16>::new(width, height)),
            PixelType::F32 => PixelPlane::F32(Plane::<f32>::new(width, height)),
        }
    }

    pub fn pixel_type(&self) -> PixelType {
        match self {
            PixelPlane::U8(_) => PixelType::U8,
            PixelPlane::U16(_) => PixelType::U16,
            PixelPlane::F32(_) => PixelType::F32,
        }
    }

    pub fn width(&self) -> u32 {
        match self {
            PixelPlane::U8(b) => b.width(),
            PixelPlane::U16(b) => b.width(),
            PixelPlane::F32(b) => b.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            PixelPlane::U8(b) => b.height(),
            PixelPlane::U16(b) => b.height(),
            PixelPlane::F32(b) => b.height(),
        }
    }

    /// `(height, width)`, i.e. (y, x) extent.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.height(), self.width())
    }

    /// Pixel value at `(x, y)` as `f64`.
    pub fn value_at(&self, x: u32, y: u32) -> f64 {
        match self {
            PixelPlane::U8(b) => b.get_pixel(x, y)[0] as f64,
            PixelPlane::U16(b) => b.get_pixel(x, y)[0] as f64,
            PixelPlane::F32(b) => b.get_pixel(x, y)[0] as f64,
        }
    }

    /// Largest pixel value, `0.0` for empty planes.
    pub fn max_value(&self) -> f64 {
        match self {
            PixelPlane::U8(b) => b.pixels().map(|p| p[0] as f64).fold(0.0, f64::max),
            PixelPlane::U16(b) => b.pixels().map(|p| p[0] as f64).fold(0.0, f64::max),
            PixelPlane::F32(b) => b.pixels().map(|p| p[0] as f64).fold(0.0, f64::max),
        }
    }

    /// Borrow the plane as 8-bit, if it is one.
    pub fn as_u8(&self) -> Option<&GrayImage> {
        match self {
            PixelPlane::U8(b) => Some(b),
            _ => None,
        }
    }

    /// Join `other` to this plane.
    ///
    /// `shim` is the spacing between the two planes along the join axis; a
    /// negative shim overlaps them, with `other` drawn on top. The extent
    /// along the join axis is the sum of both extents plus `shim`; the other
    /// extent is the larger of the two.
    pub fn join(
        &self,
        other: &PixelPlane,
        direction: JoinDirection,
        shim: i64,
    ) -> Result<PixelPlane, StitchError> {
        let (along_a, along_b) = match direction {
            JoinDirection::Horizontal => (self.width() as i64, other.width() as i64),
            JoinDirection::Vertical => (self.height() as i64, other.height() as i64),
        };
        if shim < 0 && -shim > along_a.min(along_b) {
            return Err(StitchError::InvalidArgument(format!(
                "overlap of {} pixels exceeds plane extent {}",
                -shim,
                along_a.min(along_b)
            )));
        }

        match (self, other) {
            (PixelPlane::U8(a), PixelPlane::U8(b)) => {
                Ok(PixelPlane::U8(join_buffers(a, b, direction, shim)))
            }
            (PixelPlane::U16(a), PixelPlane::U16(b)) => {
                Ok(PixelPlane::U16(join_buffers(a, b, direction, shim)))
            }
            (PixelPlane::F32(a), PixelPlane::F32(b)) => {
                Ok(PixelPlane::F32(join_buffers(a, b, direction, shim)))
            }
            (a, b) => Err(StitchError::TypeMismatch {
                expected: a.pixel_type().name(),
                found: b.pixel_type().name(),
            }),
        }
    }

    /// Draw `other` onto this plane with its top-left corner at `(x, y)`.
    /// Parts falling outside this plane are clipped.
    pub fn insert(&mut self, other: &PixelPlane, x: i64, y: i64) -> Result<(), StitchError> {
        match (self, other) {
            (PixelPlane::U8(a), PixelPlane::U8(b)) => imageops::replace(a, b, x, y),
            (PixelPlane::U16(a), PixelPlane::U16(b)) => imageops::replace(a, b, x, y),
            (PixelPlane::F32(a), PixelPlane::F32(b)) => imageops::replace(a, b, x, y),
            (a, b) => {
                return Err(StitchError::TypeMismatch {
                    expected: a.pixel_type().name(),
                    found: b.pixel_type().name(),
                })
            }
        }
        Ok(())
    }

    /// Zero-pad to `height` x `width`, centering the content.
    ///
    /// Dimensions smaller than the current ones are kept as they are.
    pub fn padded(&self, height: u32, width: u32) -> PixelPlane {
        let height = height.max(self.height());
        let width = width.max(self.width());
        let top = ((height - self.height()) / 2) as i64;
        let left = ((width - self.width()) / 2) as i64;
        map_plane!(self, b => {
            let mut out = ImageBuffer::new(width, height);
            imageops::replace(&mut out, b, left, top);
            out
        })
    }

    /// Translate the content by `(dx, dy)` without changing the plane size.
    /// Vacated pixels are zero.
    pub fn shifted(&self, dx: i64, dy: i64) -> PixelPlane {
        map_plane!(self, b => {
            let mut out = ImageBuffer::new(b.width(), b.height());
            imageops::replace(&mut out, b, dx, dy);
            out
        })
    }

    /// Resize to `width` x `height` with a triangle filter.
    pub fn resized(&self, width: u32, height: u32) -> PixelPlane {
        map_plane!(self, b => imageops::resize(b, width, height, FilterType::Triangle))
    }

    /// Map every pixel through `f`, clamping to the element type's range.
    pub fn map_values(&self, f: impl Fn(u32, u32, f64) -> f64) -> PixelPlane {
        match self {
            PixelPlane::U8(b) => PixelPlane::U8(ImageBuffer::from_fn(b.width(), b.height(), |x, y| {
                let v = f(x, y, b.get_pixel(x, y)[0] as f64);
                Luma([v.round().clamp(0.0, u8::MAX as f64) as u8])
            })),
            PixelPlane::U16(b) => {
                PixelPlane::U16(ImageBuffer::from_fn(b.width(), b.height(), |x, y| {
                    let v = f(x, y, b.get_pixel(x, y)[0] as f64);
                    Luma([v.round().clamp(0.0, u16::MAX as f64) as u16])
                }))
            }
            PixelPlane::F32(b) => {
                PixelPlane::F32(ImageBuffer::from_fn(b.width(), b.height(), |x, y| {
                    Luma([f(x, y, b.get_pixel(x, y)[0] as f64) as f32])
                }))
            }
        }
    }

    /// Clip at `clip_value` and rescale linearly to the 8-bit range.
    pub fn rescaled_u8(&self, clip_value: f64) -> Result<GrayImage, StitchError> {
        if !(clip_value > 0.0) {
            return Err(StitchError::InvalidArgument(format!(
                "clip value must be positive, got {clip_value}"
            )));
        }
        let scale = u8::MAX as f64 / clip_value;
        Ok(GrayImage::from_fn(self.width(), self.height(), |x, y| {
            let v = self.value_at(x, y).clamp(0.0, clip_value);
            Luma([(v * scale).round() as u8])
        }))
    }
}

/// Place `a` at the origin and `b` after it along `direction`, `shim` apart.
fn join_buffers<P: Pixel>(
    a: &ImageBuffer<P, Vec<P::Subpixel>>,
    b: &ImageBuffer<P, Vec<P::Subpixel>>,
    direction: JoinDirection,
    shim: i64,
) -> ImageBuffer<P, Vec<P::Subpixel>> {
    let (width, height, bx, by) = match direction {
        JoinDirection::Horizontal => {
            let width = a.width() as i64 + b.width() as i64 + shim;
            let height = a.height().max(b.height()) as i64;
            (width, height, a.width() as i64 + shim, 0)
        }
        JoinDirection::Vertical => {
            let width = a.width().max(b.width()) as i64;
            let height = a.height() as i64 + b.height() as i64 + shim;
            (width, height, 0, a.height() as i64 + shim)
        }
    };
    let mut out = ImageBuffer::new(width.max(0) as u32, height.max(0) as u32);
    imageops::replace(&mut out, a, 0, 0);
    imageops::replace(&mut out, b, bx, by);
    out
}
