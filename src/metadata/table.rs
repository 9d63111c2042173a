//! Canonical per-image metadata records.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pixels::PixelType;

// =============================================================================
// Field Names
// =============================================================================

/// Required metadata fields, in reporting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldName {
    ChannelName,
    Timepoint,
    Plane,
    PixelDimensions,
    Well,
}

impl FieldName {
    /// Every field an image record must carry before grid resolution.
    pub const REQUIRED: [FieldName; 5] = [
        FieldName::ChannelName,
        FieldName::Timepoint,
        FieldName::Plane,
        FieldName::PixelDimensions,
        FieldName::Well,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            FieldName::ChannelName => "channel name",
            FieldName::Timepoint => "timepoint",
            FieldName::Plane => "plane index",
            FieldName::PixelDimensions => "pixel dimensions",
            FieldName::Well => "well",
        }
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Record Parts
// =============================================================================

/// Zero-based position in the acquisition grid of a well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GridPosition {
    pub row: u32,
    pub column: u32,
}

impl GridPosition {
    pub fn new(row: u32, column: u32) -> Self {
        Self { row, column }
    }
}

/// Microscope stage coordinates of an acquisition site.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StagePosition {
    pub x: f64,
    pub y: f64,
}

impl StagePosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Element type and size of the image plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelInfo {
    pub pixel_type: PixelType,
    pub width: u32,
    pub height: u32,
}

/// Where the pixels of an image live in the raw upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Raw file names, relative to the upload's image directory
    pub files: Vec<String>,
    /// Series index within the first file
    pub series: u32,
    /// Plane indices within the series; several when z-planes were projected
    pub planes: Vec<u32>,
}

impl SourceRef {
    pub fn new(file: impl Into<String>, series: u32, plane: u32) -> Self {
        Self {
            files: vec![file.into()],
            series,
            planes: vec![plane],
        }
    }

    /// Name of the first source file, if any.
    pub fn first_file(&self) -> Option<&str> {
        self.files.first().map(String::as_str)
    }
}

// =============================================================================
// Image Record
// =============================================================================

/// Canonical unit of image metadata.
///
/// Fields are `None` until a source (embedded metadata, side file, filename
/// pattern, grid resolution) provides them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Index within the owning table
    pub id: usize,
    pub name: Option<String>,
    pub acquired_at: Option<String>,
    pub well: Option<String>,
    /// Acquisition site within the well, in acquisition order
    pub site: Option<u32>,
    pub grid: Option<GridPosition>,
    pub channel_name: Option<String>,
    /// Channel index; vendor numbering until normalized
    pub channel: Option<u32>,
    /// Z-plane index; vendor numbering until normalized
    pub zplane: Option<u32>,
    pub tpoint: Option<u32>,
    pub stage: Option<StagePosition>,
    pub pixels: Option<PixelInfo>,
    pub source: SourceRef,
}

impl ImageRecord {
    pub fn new(source: SourceRef) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }

    /// Reference id of this record (`Image:<id>`).
    pub fn ref_id(&self) -> String {
        image_ref_id(self.id)
    }

    /// Whether `field` is populated.
    pub fn has(&self, field: FieldName) -> bool {
        match field {
            FieldName::ChannelName => self.channel_name.is_some(),
            FieldName::Timepoint => self.tpoint.is_some(),
            FieldName::Plane => self.zplane.is_some(),
            FieldName::PixelDimensions => self.pixels.is_some(),
            FieldName::Well => self.well.is_some(),
        }
    }
}

/// Reference id for the image with index `id`.
pub fn image_ref_id(id: usize) -> String {
    format!("Image:{id}")
}

/// Inverse of [`image_ref_id`].
pub fn parse_image_ref_id(ref_id: &str) -> Option<usize> {
    ref_id.strip_prefix("Image:")?.parse().ok()
}

// =============================================================================
// Metadata Table
// =============================================================================

/// Plate naming information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateInfo {
    pub name: Option<String>,
    pub rows: Option<u32>,
    pub columns: Option<u32>,
}

/// Ordered image records of one upload or one cycle.
///
/// Record `i` always has `id == i`; [`MetadataTable::push`] and
/// [`MetadataTable::reindex`] maintain this.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataTable {
    pub plate: PlateInfo,
    pub images: Vec<ImageRecord>,
}

impl MetadataTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Append a record, assigning the next id. Returns the id.
    pub fn push(&mut self, mut record: ImageRecord) -> usize {
        let id = self.images.len();
        record.id = id;
        self.images.push(record);
        id
    }

    pub fn image(&self, id: usize) -> Option<&ImageRecord> {
        self.images.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageRecord> {
        self.images.iter()
    }

    /// Reassign ids to match positions after records were removed or
    /// reordered.
    pub fn reindex(&mut self) {
        for (id, record) in self.images.iter_mut().enumerate() {
            record.id = id;
        }
    }

    /// Distinct timepoints, ascending.
    pub fn tpoints(&self) -> Vec<u32> {
        let mut tpoints: Vec<u32> = self.images.iter().filter_map(|r| r.tpoint).collect();
        tpoints.sort_unstable();
        tpoints.dedup();
        tpoints
    }

    /// Distinct well names, sorted.
    pub fn wells(&self) -> Vec<String> {
        let mut wells: Vec<String> = self.images.iter().filter_map(|r| r.well.clone()).collect();
        wells.sort();
        wells.dedup();
        wells
    }

    /// Derive plate rows/columns from well names where not set.
    pub fn update_plate_dimensions(&mut self) {
        let positions: Vec<(u32, u32)> = self
            .images
            .iter()
            .filter_map(|r| r.well.as_deref().and_then(parse_well_name))
            .collect();
        if positions.is_empty() {
            return;
        }
        let rows = positions.iter().map(|p| p.0 + 1).max().unwrap_or(1);
        let columns = positions.iter().map(|p| p.1 + 1).max().unwrap_or(1);
        self.plate.rows = Some(self.plate.rows.map_or(rows, |r| r.max(rows)));
        self.plate.columns = Some(self.plate.columns.map_or(columns, |c| c.max(columns)));
    }
}

// =============================================================================
// Well Names
// =============================================================================

/// Well name for zero-based plate `row` and `column`, e.g. `(1, 2)` -> `B03`.
pub fn format_well_name(row: u32, column: u32) -> String {
    let mut letters = Vec::new();
    let mut n = row + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    let letters: String = letters.into_iter().rev().collect();
    format!("{}{:02}", letters, column + 1)
}

/// Zero-based plate `(row, column)` of a well name such as `B03`.
pub fn parse_well_name(name: &str) -> Option<(u32, u32)> {
    let split = name.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = name.split_at(split);
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let row = letters
        .chars()
        .fold(0u32, |acc, c| acc * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1));
    let column: u32 = digits.parse().ok()?;
    if column == 0 {
        return None;
    }
    Some((row - 1, column - 1))
}
