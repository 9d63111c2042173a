//! Visitron VisiView acquisitions.
//!
//! The `.nd` side file is a list of quoted key/value lines:
//!
//! ```text
//! "NDInfoFile", Version 1.0
//! "DoTimelapse", FALSE
//! "NWavelengths", 2
//! "WaveName1", "GFP"
//! "WaveName2", "DAPI"
//! "EndFile"
//! ```
//!
//! Image files are named `<base>_w<wave><name>_s<site>_t<time>.<ext>`; the
//! wave index selects the channel name from the `.nd` file. VisiView does not
//! record plate positions, so every image is placed in well `A01`.

use std::collections::HashMap;

use regex::Regex;

use crate::error::MetadataError;
use crate::metadata::handler::{combine_embedded, ImageSource, MetadataHandler, SideFile};
use crate::metadata::table::MetadataTable;
use crate::store::base_name;

use super::MetadataFormat;

/// File name pattern of VisiView image files.
pub const VISIVIEW_PATTERN: &str = r"_w(?P<c>\d+)[^_]*_s(?P<s>\d+)(?:_t(?P<t>\d+))?\.";

const VISIVIEW_WELL: &str = "A01";

#[derive(Debug, Clone, Copy, Default)]
pub struct VisiViewHandler;

#[derive(Debug, Clone, Default, PartialEq)]
struct NdInfo {
    wave_names: HashMap<u32, String>,
    timelapse: Option<bool>,
    z_series: Option<bool>,
}

impl MetadataHandler for VisiViewHandler {
    fn format(&self) -> MetadataFormat {
        MetadataFormat::VisiView
    }

    fn side_file_extensions(&self) -> &'static [&'static str] {
        &["nd"]
    }

    fn default_pattern(&self) -> Option<&'static str> {
        Some(VISIVIEW_PATTERN)
    }

    fn extract(
        &self,
        sources: &[ImageSource],
        side_files: &[SideFile],
    ) -> Result<MetadataTable, MetadataError> {
        let mut info = NdInfo::default();
        for file in side_files.iter().filter(|f| f.has_extension("nd")) {
            let parsed = parse_nd(file)?;
            info.wave_names.extend(parsed.wave_names);
            info.timelapse = info.timelapse.or(parsed.timelapse);
            info.z_series = info.z_series.or(parsed.z_series);
        }

        let pattern = Regex::new(VISIVIEW_PATTERN)
            .map_err(|e| MetadataError::Pattern(e.to_string()))?;

        let mut table = combine_embedded(sources);
        for record in table.images.iter_mut() {
            if record.well.is_none() {
                record.well = Some(VISIVIEW_WELL.to_string());
            }
            if info.timelapse == Some(false) && record.tpoint.is_none() {
                record.tpoint = Some(0);
            }
            if info.z_series == Some(false) && record.zplane.is_none() {
                record.zplane = Some(0);
            }

            let wave = record
                .source
                .first_file()
                .map(base_name)
                .and_then(|file| pattern.captures(file))
                .and_then(|caps| caps.name("c"))
                .and_then(|c| c.as_str().parse::<u32>().ok());
            if let Some(wave) = wave {
                if record.channel.is_none() {
                    record.channel = Some(wave);
                }
                if record.channel_name.is_none() {
                    record.channel_name = info.wave_names.get(&wave).cloned();
                }
            }
        }
        table.update_plate_dimensions();
        Ok(table)
    }
}

fn parse_nd(file: &SideFile) -> Result<NdInfo, MetadataError> {
    let mut info = NdInfo::default();
    for (number, line) in file.content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once(',') {
            Some((key, value)) => (key, value),
            None => (line, ""),
        };
        let key = unquote(key);
        let value = unquote(value);
        if key.is_empty() {
            return Err(MetadataError::Parse {
                source_name: file.name.clone(),
                message: format!("line {}: missing key", number + 1),
            });
        }

        if let Some(index) = key.strip_prefix("WaveName") {
            let index = index.parse::<u32>().map_err(|_| MetadataError::Parse {
                source_name: file.name.clone(),
                message: format!("line {}: invalid wave key '{}'", number + 1, key),
            })?;
            info.wave_names.insert(index, value.to_string());
        } else if key == "DoTimelapse" {
            info.timelapse = Some(value.eq_ignore_ascii_case("TRUE"));
        } else if key == "DoZSeries" {
            info.z_series = Some(value.eq_ignore_ascii_case("TRUE"));
        }
    }
    Ok(info)
}

fn unquote(raw: &str) -> &str {
    raw.trim().trim_matches('"')
}
