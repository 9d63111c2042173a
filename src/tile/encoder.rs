//! PNG tile encoder.
//!
//! Pyramid tiles are single-band 8-bit planes stored as lossless PNG. The
//! only knob is the compression effort, which trades encode time against
//! tile size without touching pixel values.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use bytes::Bytes;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, GrayImage, ImageEncoder, ImageFormat, ImageReader};

use crate::error::TileError;
use crate::pixels::PixelPlane;

// =============================================================================
// Compression Level
// =============================================================================

/// Effort spent compressing tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileCompression {
    Fast,
    #[default]
    Default,
    Best,
}

impl TileCompression {
    fn as_png(self) -> CompressionType {
        match self {
            TileCompression::Fast => CompressionType::Fast,
            TileCompression::Default => CompressionType::Default,
            TileCompression::Best => CompressionType::Best,
        }
    }
}

impl FromStr for TileCompression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(TileCompression::Fast),
            "default" => Ok(TileCompression::Default),
            "best" => Ok(TileCompression::Best),
            other => Err(format!(
                "unknown tile compression '{other}' (expected fast, default or best)"
            )),
        }
    }
}

impl fmt::Display for TileCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TileCompression::Fast => "fast",
            TileCompression::Default => "default",
            TileCompression::Best => "best",
        })
    }
}

// =============================================================================
// PNG Encoder
// =============================================================================

/// Encodes 8-bit planes to PNG tiles and decodes them back.
///
/// # Example
///
/// ```
/// use image::{GrayImage, Luma};
/// use tm_pipeline::pixels::PixelPlane;
/// use tm_pipeline::tile::PngTileEncoder;
///
/// let encoder = PngTileEncoder::new();
/// let plane = PixelPlane::U8(GrayImage::from_pixel(4, 4, Luma([7])));
/// let png = encoder.encode(&plane).unwrap();
/// assert_eq!(encoder.decode(&png).unwrap().get_pixel(3, 3)[0], 7);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PngTileEncoder {
    compression: TileCompression,
}

impl PngTileEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compression(compression: TileCompression) -> Self {
        Self { compression }
    }

    pub fn compression(&self) -> TileCompression {
        self.compression
    }

    /// Encode a tile plane.
    ///
    /// # Errors
    ///
    /// Returns [`TileError::InvalidPlane`] unless the plane is 8-bit, and
    /// [`TileError::Encode`] if the PNG writer fails.
    pub fn encode(&self, plane: &PixelPlane) -> Result<Bytes, TileError> {
        let PixelPlane::U8(buffer) = plane else {
            return Err(TileError::InvalidPlane(format!(
                "tiles must be uint8, got {}",
                plane.pixel_type()
            )));
        };
        if buffer.width() == 0 || buffer.height() == 0 {
            return Err(TileError::InvalidPlane("tile has no pixels".to_string()));
        }

        let mut output = Vec::new();
        let encoder = PngEncoder::new_with_quality(
            &mut output,
            self.compression.as_png(),
            FilterType::Adaptive,
        );
        encoder
            .write_image(
                buffer.as_raw(),
                buffer.width(),
                buffer.height(),
                ExtendedColorType::L8,
            )
            .map_err(|e| TileError::Encode {
                message: e.to_string(),
            })?;

        Ok(Bytes::from(output))
    }

    /// Decode a stored tile.
    pub fn decode(&self, data: &[u8]) -> Result<GrayImage, TileError> {
        let reader = ImageReader::with_format(Cursor::new(data), ImageFormat::Png);
        let image = reader.decode().map_err(|e| TileError::Decode {
            message: e.to_string(),
        })?;
        Ok(image.into_luma8())
    }

    /// `(width, height)` of a stored tile without decoding pixel data.
    pub fn dimensions(&self, data: &[u8]) -> Result<(u32, u32), TileError> {
        let reader = ImageReader::with_format(Cursor::new(data), ImageFormat::Png);
        reader.into_dimensions().map_err(|e| TileError::Decode {
            message: e.to_string(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixels::{PixelType, Plane};
    use image::Luma;

    fn gradient(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| Luma([((x + y) * 16) as u8]))
    }

    #[test]
    fn test_output_is_png() {
        let encoder = PngTileEncoder::new();
        let output = encoder.encode(&PixelPlane::U8(gradient(8, 8))).unwrap();
        assert_eq!(&output[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_lossless_at_every_compression() {
        let tile = gradient(16, 9);
        for compression in [
            TileCompression::Fast,
            TileCompression::Default,
            TileCompression::Best,
        ] {
            let encoder = PngTileEncoder::with_compression(compression);
            let png = encoder.encode(&PixelPlane::U8(tile.clone())).unwrap();
            assert_eq!(encoder.decode(&png).unwrap(), tile);
        }
    }

    #[test]
    fn test_rejects_wide_planes() {
        let encoder = PngTileEncoder::new();
        let plane = PixelPlane::U16(Plane::<u16>::new(4, 4));
        assert!(matches!(
            encoder.encode(&plane),
            Err(TileError::InvalidPlane(_))
        ));
        let plane = PixelPlane::zeros(PixelType::F32, 4, 4);
        assert!(matches!(
            encoder.encode(&plane),
            Err(TileError::InvalidPlane(_))
        ));
    }

    #[test]
    fn test_rejects_empty_plane() {
        let encoder = PngTileEncoder::new();
        assert!(matches!(
            encoder.encode(&PixelPlane::U8(GrayImage::new(0, 0))),
            Err(TileError::InvalidPlane(_))
        ));
    }

    #[test]
    fn test_decode_invalid_data() {
        let encoder = PngTileEncoder::new();
        assert!(matches!(
            encoder.decode(&[0x00, 0x01, 0x02, 0x03]),
            Err(TileError::Decode { .. })
        ));
        assert!(encoder.decode(&[]).is_err());
    }

    #[test]
    fn test_dimensions() {
        let encoder = PngTileEncoder::new();
        let png = encoder.encode(&PixelPlane::U8(gradient(12, 5))).unwrap();
        assert_eq!(encoder.dimensions(&png).unwrap(), (12, 5));
        assert!(encoder.dimensions(&[0x00, 0x01]).is_err());
    }

    #[test]
    fn test_compression_from_str() {
        assert_eq!("fast".parse::<TileCompression>(), Ok(TileCompression::Fast));
        assert_eq!("BEST".parse::<TileCompression>(), Ok(TileCompression::Best));
        assert!("ultra".parse::<TileCompression>().is_err());
        assert_eq!(TileCompression::default().to_string(), "default");
    }
}
