//! PNG persistence of pixel planes.
//!
//! Channel images live in the dataset store as single-band PNG files (8 or 16
//! bit). Float planes are kept in memory only.

use std::io::Cursor;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat, ImageReader};

use super::plane::PixelPlane;
use crate::error::StoreError;

/// Encode a plane as lossless PNG.
pub fn encode_png(name: &str, plane: &PixelPlane) -> Result<Bytes, StoreError> {
    let image = match plane {
        PixelPlane::U8(buf) => DynamicImage::ImageLuma8(buf.clone()),
        PixelPlane::U16(buf) => DynamicImage::ImageLuma16(buf.clone()),
        PixelPlane::F32(_) => {
            return Err(serialization(name, "float planes cannot be stored as PNG"));
        }
    };
    let mut output = Cursor::new(Vec::new());
    image
        .write_to(&mut output, ImageFormat::Png)
        .map_err(|e| serialization(name, e))?;
    Ok(Bytes::from(output.into_inner()))
}

/// Decode a PNG dataset into an 8- or 16-bit plane.
pub fn decode_png(name: &str, data: &[u8]) -> Result<PixelPlane, StoreError> {
    let reader = ImageReader::with_format(Cursor::new(data), ImageFormat::Png);
    let image = reader.decode().map_err(|e| serialization(name, e))?;
    Ok(match image {
        DynamicImage::ImageLuma8(buf) => PixelPlane::U8(buf),
        DynamicImage::ImageLuma16(buf) => PixelPlane::U16(buf),
        other if other.color().bytes_per_pixel() > other.color().channel_count() => {
            PixelPlane::U16(other.into_luma16())
        }
        other => PixelPlane::U8(other.into_luma8()),
    })
}

fn serialization(name: &str, message: impl ToString) -> StoreError {
    StoreError::Serialization {
        name: name.to_string(),
        message: message.to_string(),
    }
}
