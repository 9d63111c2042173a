//! Yokogawa CellVoyager measurement files.
//!
//! The `.mlf` side file lists one `MeasurementRecord` per image file:
//!
//! ```text
//! <bts:MeasurementData>
//!   <bts:MeasurementRecord bts:Type="IMG" bts:Row="2" bts:Column="3"
//!       bts:FieldIndex="1" bts:TimePoint="1" bts:ZIndex="1" bts:Ch="1"
//!       bts:X="-1088.2" bts:Y="512.0" bts:Time="...">W0001F0001T0001Z001C1.tif</bts:MeasurementRecord>
//! </bts:MeasurementData>
//! ```
//!
//! All indices are one-based. Values from the side file take precedence over
//! embedded metadata.

use std::collections::HashMap;

use crate::error::MetadataError;
use crate::metadata::handler::{combine_embedded, ImageSource, MetadataHandler, SideFile};
use crate::metadata::table::{format_well_name, MetadataTable, StagePosition};
use crate::metadata::xml::{parse_document, XmlElement};
use crate::store::base_name;

use super::MetadataFormat;

#[derive(Debug, Clone, Copy, Default)]
pub struct CellVoyagerHandler;

#[derive(Debug, Clone, PartialEq)]
struct MeasurementRecord {
    row: u32,
    column: u32,
    field: u32,
    tpoint: u32,
    zindex: u32,
    channel: u32,
    stage: Option<StagePosition>,
    time: Option<String>,
}

impl MetadataHandler for CellVoyagerHandler {
    fn format(&self) -> MetadataFormat {
        MetadataFormat::CellVoyager
    }

    fn side_file_extensions(&self) -> &'static [&'static str] {
        &["mlf", "mrf"]
    }

    fn extract(
        &self,
        sources: &[ImageSource],
        side_files: &[SideFile],
    ) -> Result<MetadataTable, MetadataError> {
        let mut measurements = HashMap::new();
        for file in side_files.iter().filter(|f| f.has_extension("mlf")) {
            measurements.extend(parse_measurement_file(file)?);
        }

        let mut table = combine_embedded(sources);
        for record in table.images.iter_mut() {
            let Some(file) = record.source.first_file().map(base_name) else {
                continue;
            };
            let Some(m) = measurements.get(file) else {
                continue;
            };
            record.well = Some(format_well_name(m.row - 1, m.column - 1));
            record.site = Some(m.field - 1);
            record.tpoint = Some(m.tpoint - 1);
            record.zplane = Some(m.zindex - 1);
            record.channel = Some(m.channel - 1);
            if record.channel_name.is_none() {
                record.channel_name = Some(m.channel.to_string());
            }
            if m.stage.is_some() {
                record.stage = m.stage;
            }
            if m.time.is_some() {
                record.acquired_at = m.time.clone();
            }
        }
        table.update_plate_dimensions();
        Ok(table)
    }
}

/// Parse an `.mlf` document into records keyed by image file name.
fn parse_measurement_file(
    file: &SideFile,
) -> Result<HashMap<String, MeasurementRecord>, MetadataError> {
    let parse_error = |message: String| MetadataError::Parse {
        source_name: file.name.clone(),
        message,
    };

    let root = parse_document(&file.content).map_err(parse_error)?;
    let mut records = HashMap::new();
    for element in root.children_named("MeasurementRecord") {
        if element.attr("Type").is_some_and(|t| t != "IMG") {
            continue;
        }
        let image = element.text.trim();
        if image.is_empty() {
            return Err(parse_error("measurement record without image file".to_string()));
        }
        let record = MeasurementRecord {
            row: one_based(element, "Row").map_err(parse_error)?,
            column: one_based(element, "Column").map_err(parse_error)?,
            field: one_based(element, "FieldIndex").map_err(parse_error)?,
            tpoint: one_based(element, "TimePoint").map_err(parse_error)?,
            zindex: one_based(element, "ZIndex").map_err(parse_error)?,
            channel: one_based(element, "Ch").map_err(parse_error)?,
            stage: element
                .parse_attr::<f64>("X")
                .map_err(parse_error)?
                .zip(element.parse_attr::<f64>("Y").map_err(parse_error)?)
                .map(|(x, y)| StagePosition::new(x, y)),
            time: element.attr("Time").map(str::to_string),
        };
        if records.insert(image.to_string(), record).is_some() {
            return Err(MetadataError::Inconsistent(format!(
                "{}: image file '{}' is listed more than once",
                file.name, image
            )));
        }
    }
    Ok(records)
}

fn one_based(element: &XmlElement, name: &str) -> Result<u32, String> {
    match element.parse_attr::<u32>(name)? {
        Some(value) if value >= 1 => Ok(value),
        Some(value) => Err(format!("attribute {name} must be one-based, got {value}")),
        None => Err(format!("measurement record without {name}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ImageRecord, SourceRef};

    const MLF: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<bts:MeasurementData xmlns:bts="http://www.yokogawa.co.jp/BTS/BTSSchema/1.0">
  <bts:MeasurementRecord bts:Type="IMG" bts:Row="2" bts:Column="3" bts:FieldIndex="2"
      bts:TimePoint="1" bts:ZIndex="1" bts:Ch="2" bts:X="-100.5" bts:Y="20"
      bts:Time="2016-03-01T10:00:00">W0015F0002T0001Z001C2.tif</bts:MeasurementRecord>
  <bts:MeasurementRecord bts:Type="ERR">W0015F0003T0001Z001C2.tif</bts:MeasurementRecord>
</bts:MeasurementData>"#;

    fn source(file: &str) -> ImageSource {
        let mut metadata = MetadataTable::new();
        let mut record = ImageRecord::new(SourceRef::default());
        record.channel_name = Some("DAPI".to_string());
        record.tpoint = Some(7);
        metadata.push(record);
        ImageSource {
            file: file.to_string(),
            metadata,
        }
    }

    #[test]
    fn test_side_file_overrides_embedded() {
        let sources = vec![source("W0015F0002T0001Z001C2.tif"), source("other.tif")];
        let side = vec![
            SideFile::new("MeasurementData.mlf", MLF),
            SideFile::new("MeasurementDetail.mrf", "<ignored/>"),
        ];
        let table = CellVoyagerHandler.extract(&sources, &side).unwrap();

        let r = &table.images[0];
        assert_eq!(r.well.as_deref(), Some("B03"));
        assert_eq!(r.site, Some(1));
        assert_eq!(r.tpoint, Some(0));
        assert_eq!(r.zplane, Some(0));
        assert_eq!(r.channel, Some(1));
        assert_eq!(r.channel_name.as_deref(), Some("DAPI"));
        assert_eq!(r.stage, Some(StagePosition::new(-100.5, 20.0)));
        assert_eq!(r.acquired_at.as_deref(), Some("2016-03-01T10:00:00"));

        // not listed in the measurement file
        assert_eq!(table.images[1].tpoint, Some(7));
        assert!(table.images[1].well.is_none());
    }

    #[test]
    fn test_zero_index_is_rejected() {
        let mlf = r#"<MeasurementData><MeasurementRecord Row="0" Column="1" FieldIndex="1"
            TimePoint="1" ZIndex="1" Ch="1">a.tif</MeasurementRecord></MeasurementData>"#;
        let result = CellVoyagerHandler.extract(&[source("a.tif")], &[SideFile::new("m.mlf", mlf)]);
        assert!(matches!(result, Err(MetadataError::Parse { .. })));
    }

    #[test]
    fn test_duplicate_listing_is_inconsistent() {
        let record = r#"<MeasurementRecord Row="1" Column="1" FieldIndex="1" TimePoint="1"
            ZIndex="1" Ch="1">a.tif</MeasurementRecord>"#;
        let mlf = format!("<MeasurementData>{record}{record}</MeasurementData>");
        let result = CellVoyagerHandler.extract(&[source("a.tif")], &[SideFile::new("m.mlf", mlf)]);
        assert!(matches!(result, Err(MetadataError::Inconsistent(_))));
    }
}
