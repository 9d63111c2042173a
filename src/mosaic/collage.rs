//! Collage: images of one cycle and channel laid out side by side for
//! inspection, without geometric meaning.

use std::collections::BTreeSet;

use tracing::debug;

use super::grid::ImageGrid;
use super::options::StitchOptions;
use crate::error::{MetadataError, StitchError};
use crate::pixels::{ChannelImage, JoinDirection, PixelPlane};

/// Cells per side of the square collage grid for `n` images.
///
/// `ceil(n / 2)`, grown where needed so the grid holds all images.
pub fn collage_side(n: usize) -> usize {
    let side = n.div_ceil(2).max(1);
    if side * side < n {
        side + 1
    } else {
        side
    }
}

/// Place images into a square grid in input order.
pub(crate) fn build_grid(images: &[ChannelImage]) -> Result<ImageGrid<'_>, StitchError> {
    if images.is_empty() {
        return Err(StitchError::EmptyInput);
    }
    let side = collage_side(images.len());
    let mut grid = ImageGrid::new(side, side);
    for (i, image) in images.iter().enumerate() {
        grid.set(i / side, i % side, image);
    }
    Ok(grid)
}

/// Check that all images share cycle, channel and element type.
fn check_compatible(images: &[ChannelImage]) -> Result<(), StitchError> {
    let cycles: BTreeSet<u32> = images.iter().map(|im| im.metadata.cycle).collect();
    if cycles.len() > 1 {
        return Err(MetadataError::Inconsistent(format!(
            "all images of a collage must be of the same cycle, got cycles {cycles:?}"
        ))
        .into());
    }
    let channels: BTreeSet<&str> = images
        .iter()
        .map(|im| im.metadata.channel_name.as_str())
        .collect();
    if channels.len() > 1 {
        return Err(MetadataError::Inconsistent(format!(
            "all images of a collage must be of the same channel, got {channels:?}"
        ))
        .into());
    }
    let expected = images[0].plane.pixel_type();
    if let Some(other) = images.iter().find(|im| im.plane.pixel_type() != expected) {
        return Err(StitchError::TypeMismatch {
            expected: expected.name(),
            found: other.plane.pixel_type().name(),
        });
    }
    Ok(())
}

/// Pad every image to the largest extent, then join cells with `dx` wide
/// spacers and rows with `dy` high spacers. Empty cells are zero.
pub(crate) fn create(
    images: &[ChannelImage],
    options: &StitchOptions,
) -> Result<PixelPlane, StitchError> {
    if images.is_empty() {
        return Err(StitchError::EmptyInput);
    }
    check_compatible(images)?;

    let grid = build_grid(images)?;
    let height = images.iter().map(|im| im.plane.height()).max().unwrap_or(0);
    let width = images.iter().map(|im| im.plane.width()).max().unwrap_or(0);
    let pixel_type = images[0].plane.pixel_type();
    debug!(
        images = images.len(),
        side = grid.rows(),
        height,
        width,
        "Creating collage"
    );

    let mut collage: Option<PixelPlane> = None;
    for r in 0..grid.rows() {
        let mut row: Option<PixelPlane> = None;
        for cell in grid.row(r) {
            let padded = match cell {
                Some(image) => options.prepare(image)?.plane.padded(height, width),
                None => PixelPlane::zeros(pixel_type, width, height),
            };
            row = Some(match row {
                None => padded,
                Some(left) => {
                    left.join(&padded, JoinDirection::Horizontal, options.dx() as i64)?
                }
            });
        }
        let Some(row) = row else {
            continue;
        };
        collage = Some(match collage {
            None => row,
            Some(top) => top.join(&row, JoinDirection::Vertical, options.dy() as i64)?,
        });
    }
    collage.ok_or(StitchError::EmptyInput)
}
