//! Mosaic: dense acquisition grid stitched by recorded grid position.

use tracing::debug;

use super::grid::ImageGrid;
use super::options::StitchOptions;
use crate::error::StitchError;
use crate::pixels::{ChannelImage, JoinDirection, PixelPlane};

/// Place images by their well-relative grid coordinates.
pub(crate) fn build_grid(images: &[ChannelImage]) -> Result<ImageGrid<'_>, StitchError> {
    if images.is_empty() {
        return Err(StitchError::EmptyInput);
    }
    let rows = images.iter().map(|im| im.metadata.y).max().unwrap_or(0) as usize + 1;
    let columns = images.iter().map(|im| im.metadata.x).max().unwrap_or(0) as usize + 1;

    let mut grid = ImageGrid::new(rows, columns);
    for image in images {
        let (row, column) = (image.metadata.y as usize, image.metadata.x as usize);
        if let Some(previous) = grid.set(row, column, image) {
            return Err(StitchError::InvalidArgument(format!(
                "images '{}' and '{}' share grid position ({}, {})",
                previous.metadata.name, image.metadata.name, row, column
            )));
        }
    }
    Ok(grid)
}

/// Join every row left to right with shim `-dx`, then the rows top to bottom
/// with shim `-dy`.
pub(crate) fn create(
    images: &[ChannelImage],
    options: &StitchOptions,
) -> Result<PixelPlane, StitchError> {
    let grid = build_grid(images)?;
    if let Some((row, column)) = grid.gaps().first() {
        return Err(StitchError::InvalidArgument(format!(
            "mosaic grid of {}x{} has no image at ({}, {})",
            grid.rows(),
            grid.columns(),
            row,
            column
        )));
    }

    let reference = &images[0].plane;
    for image in &images[1..] {
        if image.plane.pixel_type() != reference.pixel_type() {
            return Err(StitchError::InvalidArgument(format!(
                "image '{}' is {} but mosaic is {}",
                image.metadata.name,
                image.plane.pixel_type(),
                reference.pixel_type()
            )));
        }
        if image.plane.dimensions() != reference.dimensions() {
            return Err(StitchError::InvalidArgument(format!(
                "image '{}' is {:?} but mosaic tiles are {:?}",
                image.metadata.name,
                image.plane.dimensions(),
                reference.dimensions()
            )));
        }
    }

    let x_shim = -(options.dx() as i64);
    let y_shim = -(options.dy() as i64);

    let mut mosaic: Option<PixelPlane> = None;
    for r in 0..grid.rows() {
        let mut row: Option<PixelPlane> = None;
        for cell in grid.row(r).iter().flatten() {
            debug!(image = %cell.metadata.name, "Adding image to mosaic");
            let plane = options.prepare(cell)?.plane;
            row = Some(match row {
                None => plane,
                Some(left) => left.join(&plane, JoinDirection::Horizontal, x_shim)?,
            });
        }
        let Some(row) = row else {
            continue;
        };
        mosaic = Some(match mosaic {
            None => row,
            Some(top) => top.join(&row, JoinDirection::Vertical, y_shim)?,
        });
    }
    mosaic.ok_or(StitchError::EmptyInput)
}
