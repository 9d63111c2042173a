//! Metadata handler contract and the format-independent table operations.
//!
//! A handler turns the embedded metadata of the raw image files of one
//! upload, plus optional vendor side files, into a [`MetadataTable`]. The
//! remaining operations are shared by every format:
//!
//! - [`determine_missing`]: which required fields are still unset
//! - [`fill_from_pattern`]: recover fields from file names
//! - [`normalize_ids`]: dense zero-based channel and plane ids
//! - [`project_z_stacks`]: collapse focal planes into one record
//! - [`build_image_names`]: canonical image names

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;

use crate::error::MetadataError;
use crate::store::base_name;

use super::formats::MetadataFormat;
use super::naming::{ImageNameFields, ImageNameTemplate};
use super::table::{FieldName, MetadataTable};

/// Capture group names understood by [`fill_from_pattern`].
pub const PATTERN_GROUPS: [&str; 5] = ["w", "c", "z", "t", "s"];

// =============================================================================
// Inputs
// =============================================================================

/// A raw image file together with its embedded metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSource {
    /// File name relative to the upload's image directory
    pub file: String,
    /// Table parsed from the file's extracted metadata document
    pub metadata: MetadataTable,
}

/// A vendor side file (measurement description, channel list, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideFile {
    pub name: String,
    pub content: String,
}

impl SideFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Whether the file name ends with `.<extension>` (case-insensitive).
    pub fn has_extension(&self, extension: &str) -> bool {
        has_extension(&self.name, extension)
    }
}

pub(crate) fn has_extension(name: &str, extension: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

// =============================================================================
// Handler Trait
// =============================================================================

/// Per-vendor metadata extraction.
pub trait MetadataHandler: Send + Sync {
    /// Format this handler implements.
    fn format(&self) -> MetadataFormat;

    /// Side file extensions this handler accepts (without the dot).
    fn side_file_extensions(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether this handler uses side files at all.
    fn supports_side_files(&self) -> bool {
        !self.side_file_extensions().is_empty()
    }

    /// File name pattern used when the caller does not provide one.
    fn default_pattern(&self) -> Option<&'static str> {
        None
    }

    /// Build the upload's table from embedded metadata and side files.
    ///
    /// Fields that no source provides are left unset; callers check them with
    /// [`determine_missing`] after applying fallbacks.
    fn extract(
        &self,
        sources: &[ImageSource],
        side_files: &[SideFile],
    ) -> Result<MetadataTable, MetadataError>;
}

/// Concatenate the embedded tables of all sources, in source order.
///
/// Records without a source file are attributed to the image file whose
/// document described them.
pub fn combine_embedded(sources: &[ImageSource]) -> MetadataTable {
    let mut table = MetadataTable::new();
    for source in sources {
        if table.plate.name.is_none() {
            table.plate.name = source.metadata.plate.name.clone();
        }
        for record in source.metadata.iter() {
            let mut record = record.clone();
            if record.source.files.is_empty() {
                record.source.files.push(source.file.clone());
            }
            table.push(record);
        }
    }
    table.update_plate_dimensions();
    table
}

// =============================================================================
// Table Operations
// =============================================================================

/// Required fields that at least one record lacks.
pub fn determine_missing(table: &MetadataTable) -> BTreeSet<FieldName> {
    FieldName::REQUIRED
        .into_iter()
        .filter(|field| table.iter().any(|record| !record.has(*field)))
        .collect()
}

/// Fill unset fields from each record's first source file name.
///
/// `pattern` must contain at least one of the named groups `w` (well), `c`
/// (channel), `z` (plane), `t` (timepoint) or `s` (site). Fields that are
/// already set are never overwritten.
pub fn fill_from_pattern(
    table: &MetadataTable,
    pattern: &str,
) -> Result<MetadataTable, MetadataError> {
    let regex = Regex::new(pattern)
        .map_err(|e| MetadataError::Pattern(format!("invalid pattern '{pattern}': {e}")))?;
    let known = regex
        .capture_names()
        .flatten()
        .any(|name| PATTERN_GROUPS.contains(&name));
    if !known {
        return Err(MetadataError::Pattern(format!(
            "pattern '{pattern}' has none of the groups {}",
            PATTERN_GROUPS.join(", ")
        )));
    }

    let mut table = table.clone();
    for record in table.images.iter_mut() {
        let file = record
            .source
            .first_file()
            .map(base_name)
            .ok_or_else(|| MetadataError::Pattern(format!("image {} has no source file", record.id)))?;
        let captures = regex.captures(file).ok_or_else(|| {
            MetadataError::Pattern(format!("file '{file}' does not match pattern '{pattern}'"))
        })?;

        let number = |group: &str| -> Result<Option<u32>, MetadataError> {
            captures
                .name(group)
                .map(|m| {
                    m.as_str().parse::<u32>().map_err(|_| {
                        MetadataError::Pattern(format!(
                            "group '{group}' of '{file}' is not a number: '{}'",
                            m.as_str()
                        ))
                    })
                })
                .transpose()
        };

        if record.well.is_none() {
            record.well = captures.name("w").map(|m| m.as_str().to_string());
        }
        if let Some(c) = captures.name("c") {
            if record.channel_name.is_none() {
                record.channel_name = Some(c.as_str().to_string());
            }
            if record.channel.is_none() {
                record.channel = c.as_str().parse().ok();
            }
        }
        if record.zplane.is_none() {
            record.zplane = number("z")?;
        }
        if record.tpoint.is_none() {
            record.tpoint = number("t")?;
        }
        if record.site.is_none() {
            record.site = number("s")?;
        }
    }
    Ok(table)
}

/// Remap channel and plane ids to dense zero-based values.
///
/// Channels are ordered by their original index, then by name; planes by
/// their original z value. Unset values stay unset.
pub fn normalize_ids(table: &MetadataTable) -> MetadataTable {
    let channel_keys: BTreeSet<(Option<u32>, Option<String>)> = table
        .iter()
        .filter(|r| r.channel.is_some() || r.channel_name.is_some())
        .map(|r| (r.channel, r.channel_name.clone()))
        .collect();
    let channel_ids: BTreeMap<_, u32> = channel_keys
        .into_iter()
        .enumerate()
        .map(|(i, key)| (key, i as u32))
        .collect();

    let planes: BTreeSet<u32> = table.iter().filter_map(|r| r.zplane).collect();
    let plane_ids: BTreeMap<u32, u32> = planes
        .into_iter()
        .enumerate()
        .map(|(i, z)| (z, i as u32))
        .collect();

    let mut table = table.clone();
    for record in table.images.iter_mut() {
        let key = (record.channel, record.channel_name.clone());
        if let Some(id) = channel_ids.get(&key) {
            record.channel = Some(*id);
        }
        record.zplane = record.zplane.and_then(|z| plane_ids.get(&z).copied());
    }
    table
}

/// Collapse records that differ only in their z-plane into one record per
/// (well, site, channel, timepoint).
///
/// The merged record keeps the fields of the lowest plane, has plane 0, and
/// its source lists the planes of all merged records in ascending z order.
pub fn project_z_stacks(table: &MetadataTable) -> MetadataTable {
    type StackKey = (Option<String>, Option<u32>, Option<u32>, Option<String>, Option<u32>);

    let mut order: Vec<StackKey> = Vec::new();
    let mut stacks: BTreeMap<StackKey, Vec<usize>> = BTreeMap::new();
    for (index, record) in table.iter().enumerate() {
        let key = (
            record.well.clone(),
            record.site,
            record.channel,
            record.channel_name.clone(),
            record.tpoint,
        );
        let members = stacks.entry(key.clone()).or_default();
        if members.is_empty() {
            order.push(key);
        }
        members.push(index);
    }

    let mut projected = MetadataTable {
        plate: table.plate.clone(),
        images: Vec::with_capacity(order.len()),
    };
    for key in order {
        let mut members = stacks.remove(&key).unwrap_or_default();
        members.sort_by_key(|&i| (table.images[i].zplane, i));
        let Some((&first, rest)) = members.split_first() else {
            continue;
        };
        let mut record = table.images[first].clone();
        for &i in rest {
            let other = &table.images[i].source;
            for file in &other.files {
                if !record.source.files.contains(file) {
                    record.source.files.push(file.clone());
                }
            }
            record.source.planes.extend(other.planes.iter().copied());
        }
        record.zplane = Some(0);
        record.name = None;
        projected.push(record);
    }
    projected
}

/// Set each record's canonical name from `template`.
///
/// Requires well, grid position, channel, plane and timepoint on every
/// record.
pub fn build_image_names(
    table: &MetadataTable,
    template: &ImageNameTemplate,
    experiment: &str,
) -> Result<MetadataTable, MetadataError> {
    let mut table = table.clone();
    for record in table.images.iter_mut() {
        let mut missing = BTreeSet::new();
        if record.well.is_none() {
            missing.insert(FieldName::Well);
        }
        if record.channel.is_none() {
            missing.insert(FieldName::ChannelName);
        }
        if record.zplane.is_none() {
            missing.insert(FieldName::Plane);
        }
        if record.tpoint.is_none() {
            missing.insert(FieldName::Timepoint);
        }
        let grid = record.grid.ok_or_else(|| {
            MetadataError::InvalidLayout(format!("image {} has no grid position", record.id))
        })?;
        if !missing.is_empty() {
            return Err(MetadataError::Missing(missing));
        }
        record.name = Some(template.format(&ImageNameFields {
            experiment,
            t: record.tpoint.unwrap_or_default(),
            w: record.well.as_deref().unwrap_or_default(),
            y: grid.row,
            x: grid.column,
            c: record.channel.unwrap_or_default(),
            z: record.zplane.unwrap_or_default(),
        }));
    }
    Ok(table)
}
