//! Mosaic engine.
//!
//! Two composition variants share one contract and are selected by the
//! [`StitchKind`] tag:
//!
//! - [`StitchKind::Mosaic`]: a dense acquisition grid stitched by each
//!   image's recorded grid position, neighbours overlapping by `dx`/`dy`
//! - [`StitchKind::Collage`]: any set of images of one cycle and channel,
//!   padded to a common size and laid out in a square grid separated by
//!   `dx`/`dy` spacers
//!
//! Both are pure functions of their inputs. Events are emitted to the
//! dispatcher that is current at the call site.
//!
//! # Example
//!
//! ```
//! use image::{ImageBuffer, Luma};
//! use tm_pipeline::mosaic::{StitchKind, StitchOptions};
//! use tm_pipeline::pixels::{ChannelImage, ChannelImageMetadata, PixelPlane};
//!
//! let image = |y, x| ChannelImage::new(
//!     PixelPlane::U16(ImageBuffer::from_pixel(100, 80, Luma([1u16]))),
//!     ChannelImageMetadata { y, x, ..Default::default() },
//! );
//! let images = vec![image(0, 0), image(0, 1), image(1, 0), image(1, 1)];
//!
//! let options = StitchOptions::new(10, 5).unwrap();
//! let mosaic = StitchKind::Mosaic.create(&images, &options).unwrap();
//! assert_eq!(mosaic.dimensions(), (2 * 80 - 5, 2 * 100 - 10));
//! ```

mod collage;
mod grid;
mod options;
mod stitch;

pub use collage::collage_side;
pub use grid::ImageGrid;
pub use options::StitchOptions;

use std::fmt;

use crate::error::StitchError;
use crate::pixels::{ChannelImage, PixelPlane, PixelType};

// =============================================================================
// Stitch Kind
// =============================================================================

/// Composition variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StitchKind {
    Mosaic,
    Collage,
}

impl StitchKind {
    /// Arrange `images` in the variant's grid.
    pub fn build_grid<'a>(&self, images: &'a [ChannelImage]) -> Result<ImageGrid<'a>, StitchError> {
        match self {
            StitchKind::Mosaic => stitch::build_grid(images),
            StitchKind::Collage => collage::build_grid(images),
        }
    }

    /// Compose `images` into one plane.
    pub fn create(
        &self,
        images: &[ChannelImage],
        options: &StitchOptions,
    ) -> Result<StitchedImage, StitchError> {
        let plane = match self {
            StitchKind::Mosaic => stitch::create(images, options)?,
            StitchKind::Collage => collage::create(images, options)?,
        };
        Ok(StitchedImage::new(*self, plane))
    }

    pub const fn name(&self) -> &'static str {
        match self {
            StitchKind::Mosaic => "mosaic",
            StitchKind::Collage => "collage",
        }
    }
}

impl fmt::Display for StitchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Stitched Image
// =============================================================================

/// Result of a stitching call.
///
/// Dimensions and element type are captured once at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct StitchedImage {
    kind: StitchKind,
    plane: PixelPlane,
    height: u32,
    width: u32,
    pixel_type: PixelType,
}

impl StitchedImage {
    fn new(kind: StitchKind, plane: PixelPlane) -> Self {
        Self {
            kind,
            height: plane.height(),
            width: plane.width(),
            pixel_type: plane.pixel_type(),
            plane,
        }
    }

    pub fn kind(&self) -> StitchKind {
        self.kind
    }

    /// `(height, width)` of the stitched plane.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.height, self.width)
    }

    /// Number of bands; stitched images are always single-band.
    pub fn bands(&self) -> u32 {
        1
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn is_float(&self) -> bool {
        self.pixel_type.is_float()
    }

    pub fn is_uint(&self) -> bool {
        self.pixel_type.is_uint()
    }

    /// Whether the plane is 8-bit.
    pub fn is_binary(&self) -> bool {
        self.pixel_type == PixelType::U8
    }

    pub fn plane(&self) -> &PixelPlane {
        &self.plane
    }

    pub fn into_plane(self) -> PixelPlane {
        self.plane
    }
}
