//! Zoomify-style tile pyramid.
//!
//! Level 0 fits into a single tile; every following level doubles the
//! resolution until the last level holds the full-resolution image:
//!
//! ```text
//! level 0     1x1 tiles      width / 2^(n-1)
//! level 1     2x1 tiles      width / 2^(n-2)
//! ...
//! level n-1   CxR tiles      width
//! ```
//!
//! Level dimensions are `ceil(size / 2^(n - 1 - level))`. Edge tiles are
//! cropped, not padded. Tiles are numbered level by level in row-major order
//! and bucketed into groups of [`TILES_PER_GROUP`].

use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::store::{PyramidTileStore, TileKey};
use crate::diagnostics::Diagnostics;
use crate::error::TileError;
use crate::pixels::PixelPlane;
use crate::store::DatasetStore;

/// Edge length of a tile in pixels.
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Tiles per `TileGroup` directory.
pub const TILES_PER_GROUP: u64 = 256;

// =============================================================================
// Layout
// =============================================================================

/// Dimensions and tile grid of one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidLevel {
    pub width: u32,
    pub height: u32,
    pub rows: u32,
    pub columns: u32,
}

impl PyramidLevel {
    pub fn n_tiles(&self) -> u64 {
        self.rows as u64 * self.columns as u64
    }
}

/// Geometry of a pyramid built over a `width x height` image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidLayout {
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,

    /// Ordered from the single-tile level to full resolution
    pub levels: Vec<PyramidLevel>,
}

impl PyramidLayout {
    pub fn new(width: u32, height: u32, tile_size: u32) -> Result<Self, TileError> {
        if width == 0 || height == 0 {
            return Err(TileError::InvalidPlane(format!(
                "cannot build a pyramid over a {width}x{height} image"
            )));
        }
        if tile_size == 0 {
            return Err(TileError::InvalidPlane(
                "tile size must be positive".to_string(),
            ));
        }

        let mut levels = Vec::new();
        let (mut w, mut h) = (width, height);
        loop {
            levels.push(PyramidLevel {
                width: w,
                height: h,
                rows: h.div_ceil(tile_size),
                columns: w.div_ceil(tile_size),
            });
            if w <= tile_size && h <= tile_size {
                break;
            }
            w = w.div_ceil(2);
            h = h.div_ceil(2);
        }
        levels.reverse();

        Ok(Self {
            width,
            height,
            tile_size,
            levels,
        })
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    /// Index of the full-resolution level.
    pub fn max_level(&self) -> u32 {
        self.levels.len().saturating_sub(1) as u32
    }

    pub fn level(&self, level: u32) -> Option<&PyramidLevel> {
        self.levels.get(level as usize)
    }

    /// Total number of tiles over all levels.
    pub fn n_tiles(&self) -> u64 {
        self.levels.iter().map(PyramidLevel::n_tiles).sum()
    }

    /// Running index of a tile, counting level by level in row-major order.
    pub fn tile_index(&self, level: u32, row: u32, column: u32) -> Option<u64> {
        let info = self.level(level)?;
        if row >= info.rows || column >= info.columns {
            return None;
        }
        let before: u64 = self.levels[..level as usize]
            .iter()
            .map(PyramidLevel::n_tiles)
            .sum();
        Some(before + row as u64 * info.columns as u64 + column as u64)
    }

    /// Group directory a tile belongs to.
    pub fn tile_group(&self, level: u32, row: u32, column: u32) -> Option<u32> {
        self.tile_index(level, row, column)
            .map(|index| (index / TILES_PER_GROUP) as u32)
    }

    /// Pixel rectangle `(x, y, width, height)` of a tile in its level image.
    pub fn tile_bounds(&self, level: u32, row: u32, column: u32) -> Option<(u32, u32, u32, u32)> {
        let info = self.level(level)?;
        if row >= info.rows || column >= info.columns {
            return None;
        }
        let x = column * self.tile_size;
        let y = row * self.tile_size;
        let width = self.tile_size.min(info.width - x);
        let height = self.tile_size.min(info.height - y);
        Some((x, y, width, height))
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Cuts an 8-bit layer image into pyramid tiles.
#[derive(Debug, Clone)]
pub struct PyramidBuilder {
    tile_size: u32,
    diagnostics: Diagnostics,
}

impl PyramidBuilder {
    pub fn new(diagnostics: Diagnostics) -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            diagnostics,
        }
    }

    pub fn with_tile_size(mut self, tile_size: u32) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Write every tile of `image` as `layer` and return the layout.
    ///
    /// Levels are produced from full resolution downwards, each one a
    /// half-size resample of the previous.
    pub async fn build<S: DatasetStore>(
        &self,
        tiles: &PyramidTileStore<S>,
        layer: u32,
        image: &GrayImage,
    ) -> Result<PyramidLayout, TileError> {
        let layout = PyramidLayout::new(image.width(), image.height(), self.tile_size)?;
        self.diagnostics.in_scope(|| {
            info!(
                layer,
                width = layout.width,
                height = layout.height,
                levels = layout.n_levels(),
                tiles = layout.n_tiles(),
                "Building pyramid"
            )
        });

        let mut current = image.clone();
        for level in (0..=layout.max_level()).rev() {
            let Some(info) = layout.level(level).copied() else {
                continue;
            };
            if (current.width(), current.height()) != (info.width, info.height) {
                current = imageops::resize(&current, info.width, info.height, FilterType::Triangle);
            }
            self.diagnostics.in_scope(|| {
                debug!(
                    layer,
                    level,
                    rows = info.rows,
                    columns = info.columns,
                    "Writing pyramid level"
                )
            });

            for row in 0..info.rows {
                for column in 0..info.columns {
                    let (Some((x, y, w, h)), Some(group)) = (
                        layout.tile_bounds(level, row, column),
                        layout.tile_group(level, row, column),
                    ) else {
                        continue;
                    };
                    let tile = imageops::crop_imm(&current, x, y, w, h).to_image();
                    let key = TileKey::new(layer, level, row, column);
                    tiles.put(key, group, &PixelPlane::U8(tile)).await?;
                }
            }
        }

        Ok(layout)
    }
}
