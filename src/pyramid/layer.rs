//! Channel layer documents and the loading of their source images.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{JobError, StitchError};
use crate::metadata::{FileMapperEntry, ImageRecord};
use crate::pixels::{decode_png, ChannelImageMetadata, ImageShift, PixelPlane};
use crate::store::DatasetStore;
use crate::tile::PyramidLayout;

/// Address of one channel layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerKey {
    pub cycle: u32,
    pub channel: u32,
    pub zplane: u32,
}

/// Contents of `layers/layer_LLL/layer.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDescription {
    pub layer: u32,
    pub cycle: u32,
    pub channel: u32,
    pub channel_name: String,
    pub zplane: u32,
    pub layout: PyramidLayout,
}

/// Alignment of one site, as stored in a cycle's `shifts.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteShift {
    pub well: String,
    pub y: u32,
    pub x: u32,
    pub shift: ImageShift,
}

/// Lookup of shifts by (well, y, x).
pub(crate) fn shift_lookup(shifts: &[SiteShift]) -> HashMap<(&str, u32, u32), ImageShift> {
    shifts
        .iter()
        .map(|s| ((s.well.as_str(), s.y, s.x), s.shift))
        .collect()
}

/// Addressing metadata of a reconciled record.
///
/// Returns `None` for records that were never fully resolved.
pub(crate) fn channel_metadata(cycle: u32, record: &ImageRecord) -> Option<ChannelImageMetadata> {
    let grid = record.grid?;
    Some(ChannelImageMetadata {
        name: record.name.clone()?,
        cycle,
        channel: record.channel?,
        channel_name: record.channel_name.clone().unwrap_or_default(),
        well: record.well.clone()?,
        y: grid.row,
        x: grid.column,
        tpoint: record.tpoint?,
        zplane: record.zplane?,
        shift: None,
    })
}

/// Pixels of a mapped image.
///
/// The cycle image is used when it has been materialized; otherwise the
/// source planes are decoded and, when there are several, max-projected.
pub(crate) async fn load_plane<S: DatasetStore + ?Sized>(
    store: &S,
    entry: &FileMapperEntry,
) -> Result<PixelPlane, JobError> {
    if store.exists(&entry.ref_file).await? {
        let data = store.read(&entry.ref_file).await?;
        return Ok(decode_png(&entry.ref_file, &data)?);
    }

    let mut projected: Option<PixelPlane> = None;
    for file in &entry.files {
        let data = store.read(file).await?;
        let plane = decode_png(file, &data)?;
        projected = Some(match projected {
            None => plane,
            Some(acc) => max_projection(&acc, &plane)?,
        });
    }
    projected.ok_or_else(|| {
        JobError::InvalidDescription(format!("{} has no source files", entry.ref_id))
    })
}

/// Pixel-wise maximum of two planes of equal type and size.
pub(crate) fn max_projection(a: &PixelPlane, b: &PixelPlane) -> Result<PixelPlane, StitchError> {
    if a.pixel_type() != b.pixel_type() {
        return Err(StitchError::TypeMismatch {
            expected: a.pixel_type().name(),
            found: b.pixel_type().name(),
        });
    }
    if a.dimensions() != b.dimensions() {
        return Err(StitchError::InvalidArgument(format!(
            "cannot project planes of size {:?} and {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }
    Ok(a.map_values(|x, y, value| value.max(b.value_at(x, y))))
}
