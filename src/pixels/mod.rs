//! Pixel planes and channel images.
//!
//! - [`PixelPlane`]: one 2-D plane of `uint8`, `uint16` or `float` pixels
//!   with join/pad/shift operations used by the mosaic engine
//! - [`ChannelImage`]: a plane plus the cycle/channel/well/grid address it
//!   was reconciled to
//! - [`IllumStats`], [`ImageShift`]: corrections applied before stitching
//! - [`encode_png`], [`decode_png`]: persistence of planes as PNG datasets

mod channel_image;
mod codec;
mod correction;
mod plane;

pub use channel_image::{ChannelImage, ChannelImageMetadata};
pub use codec::{decode_png, encode_png};
pub use correction::{IllumStats, ImageShift};
pub use plane::{JoinDirection, PixelPlane, PixelType, Plane};
