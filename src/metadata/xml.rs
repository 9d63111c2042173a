//! Canonical metadata XML documents.
//!
//! Image metadata is exchanged as a small OME-like document:
//!
//! ```text
//! <OME>
//!   <Plate Name=".." Rows="8" Columns="12">
//!     <Well Name="B03" Row="1" Column="2">
//!       <WellSample Index="0" ImageRef="Image:0" GridRow="0" GridColumn="1"/>
//!     </Well>
//!   </Plate>
//!   <Image ID="Image:0" Name=".." AcquisitionDate="..">
//!     <Pixels Type="uint16" SizeX="512" SizeY="512">
//!       <Channel Index="0" Name="DAPI"/>
//!       <Plane TheC="0" TheZ="0" TheT="0" PositionX="1.5" PositionY="-3"/>
//!     </Pixels>
//!     <Source Series="0">
//!       <File Name="raw/a.tif"/>
//!       <Plane Index="0"/>
//!     </Source>
//!   </Image>
//! </OME>
//! ```
//!
//! Every `<Plane>` of an `<Image>` becomes one [`ImageRecord`]. Documents
//! produced by the extraction step may carry several planes per image and no
//! `<Source>`; documents written by [`render_metadata`] always carry exactly
//! one plane and one source per image, so parse and render are inverse.
//!
//! Parsing is done by a small tokenizer covering the subset of XML these
//! documents use: elements, attributes, text, comments, CDATA and the
//! predefined and numeric entities. Namespace prefixes are ignored.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use crate::error::MetadataError;
use crate::pixels::PixelType;
use crate::store::{read_text, write_text, DatasetStore};

use super::table::{
    format_well_name, image_ref_id, parse_well_name, GridPosition, ImageRecord, MetadataTable,
    PixelInfo, SourceRef, StagePosition,
};

// =============================================================================
// Element Tree
// =============================================================================

/// A parsed XML element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, key: &str, value: impl ToString) -> Self {
        self.attributes.push((key.to_string(), value.to_string()));
        self
    }

    /// Builder-style attribute setter, skipping `None`.
    pub fn with_opt_attr<T: ToString>(self, key: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.with_attr(key, value),
            None => self,
        }
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    /// Element name without namespace prefix.
    pub fn local_name(&self) -> &str {
        local(&self.name)
    }

    /// Attribute value by local name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| local(key) == name)
            .map(|(_, value)| value.as_str())
    }

    /// Attribute value parsed as `T`; `Ok(None)` when absent.
    pub fn parse_attr<T: FromStr>(&self, name: &str) -> Result<Option<T>, String> {
        match self.attr(name) {
            None => Ok(None),
            Some(value) => value.trim().parse().map(Some).map_err(|_| {
                format!(
                    "invalid value '{}' for attribute {} of <{}>",
                    value,
                    name,
                    self.local_name()
                )
            }),
        }
    }

    /// Children with the given local name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.local_name() == name)
    }

    /// First child with the given local name.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.local_name() == name)
    }

    /// Serialize the element and its subtree.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        out.push_str(&indent);
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            out.push_str(&format!(" {}=\"{}\"", key, escape(value)));
        }
        if self.children.is_empty() && self.text.is_empty() {
            out.push_str("/>\n");
            return;
        }
        out.push('>');
        if self.children.is_empty() {
            out.push_str(&escape(&self.text));
        } else {
            out.push('\n');
            for child in &self.children {
                child.render_into(out, depth + 1);
            }
            out.push_str(&indent);
        }
        out.push_str(&format!("</{}>\n", self.name));
    }
}

fn local(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

// =============================================================================
// Tokenizer
// =============================================================================

/// Deepest element nesting accepted by [`parse_document`].
pub const MAX_DEPTH: usize = 64;

/// Parse a document and return its root element.
pub fn parse_document(input: &str) -> Result<XmlElement, String> {
    let mut parser = Parser { input, pos: 0 };
    parser.skip_misc()?;
    if !parser.rest().starts_with('<') {
        return Err("document has no root element".to_string());
    }
    let root = parser.parse_element(1)?;
    parser.skip_misc()?;
    if !parser.rest().is_empty() {
        return Err(format!("unexpected content after root element at byte {}", parser.pos));
    }
    Ok(root)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn skip_past(&mut self, terminator: &str) -> Result<(), String> {
        match self.rest().find(terminator) {
            Some(offset) => {
                self.pos += offset + terminator.len();
                Ok(())
            }
            None => Err(format!("missing '{}' after byte {}", terminator, self.pos)),
        }
    }

    /// Skip whitespace, declarations, processing instructions and comments.
    fn skip_misc(&mut self) -> Result<(), String> {
        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.starts_with("<?") {
                self.skip_past("?>")?;
            } else if rest.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if rest.starts_with("<!") {
                self.skip_past(">")?;
            } else {
                return Ok(());
            }
        }
    }

    fn read_name(&mut self) -> Result<&'a str, String> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| c.is_whitespace() || matches!(c, '/' | '>' | '='))
            .unwrap_or(rest.len());
        if end == 0 {
            return Err(format!("expected a name at byte {}", self.pos));
        }
        self.pos += end;
        Ok(&rest[..end])
    }

    fn expect(&mut self, token: char) -> Result<(), String> {
        if self.rest().starts_with(token) {
            self.pos += token.len_utf8();
            Ok(())
        } else {
            Err(format!("expected '{}' at byte {}", token, self.pos))
        }
    }

    fn parse_element(&mut self, depth: usize) -> Result<XmlElement, String> {
        if depth > MAX_DEPTH {
            return Err(format!(
                "elements nested deeper than {MAX_DEPTH} levels at byte {}",
                self.pos
            ));
        }
        self.expect('<')?;
        let mut element = XmlElement::new(self.read_name()?);

        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.starts_with("/>") {
                self.pos += 2;
                return Ok(element);
            }
            if rest.starts_with('>') {
                self.pos += 1;
                break;
            }
            if rest.is_empty() {
                return Err(format!("unterminated tag <{}>", element.name));
            }
            let key = self.read_name()?.to_string();
            self.skip_whitespace();
            self.expect('=')?;
            self.skip_whitespace();
            let quote = self
                .rest()
                .chars()
                .next()
                .filter(|c| *c == '"' || *c == '\'')
                .ok_or_else(|| format!("expected quoted value for '{}' at byte {}", key, self.pos))?;
            self.pos += 1;
            let end = self
                .rest()
                .find(quote)
                .ok_or_else(|| format!("unterminated value for '{}'", key))?;
            let value = unescape(&self.rest()[..end])?;
            self.pos += end + 1;
            element.attributes.push((key, value));
        }

        let mut text = String::new();
        loop {
            let rest = self.rest();
            if rest.is_empty() {
                return Err(format!("unclosed element <{}>", element.name));
            }
            if rest.starts_with("</") {
                self.pos += 2;
                let name = self.read_name()?;
                if name != element.name {
                    return Err(format!(
                        "mismatched closing tag </{}> for <{}>",
                        name, element.name
                    ));
                }
                self.skip_whitespace();
                self.expect('>')?;
                element.text = text.trim().to_string();
                return Ok(element);
            } else if rest.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if let Some(cdata) = rest.strip_prefix("<![CDATA[") {
                let end = cdata
                    .find("]]>")
                    .ok_or_else(|| "unterminated CDATA section".to_string())?;
                text.push_str(&cdata[..end]);
                self.pos += "<![CDATA[".len() + end + 3;
            } else if rest.starts_with("<?") {
                self.skip_past("?>")?;
            } else if rest.starts_with('<') {
                let child = self.parse_element(depth + 1)?;
                element.children.push(child);
            } else {
                let end = rest.find('<').unwrap_or(rest.len());
                text.push_str(&unescape(&rest[..end])?);
                self.pos += end;
            }
        }
    }
}

fn unescape(raw: &str) -> Result<String, String> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let semi = after
            .find(';')
            .ok_or_else(|| format!("unterminated entity in '{raw}'"))?;
        let entity = &after[..semi];
        let ch = match entity {
            "amp" => '&',
            "lt" => '<',
            "gt" => '>',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32)
                    .ok_or_else(|| format!("unknown entity '&{entity};'"))?
            }
        };
        out.push(ch);
        rest = &after[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

// =============================================================================
// Metadata Documents
// =============================================================================

#[derive(Debug, Clone)]
struct SampleInfo {
    well: String,
    site: Option<u32>,
    grid: Option<GridPosition>,
}

/// Parse a metadata document into a table.
///
/// `source_name` is only used in error messages.
pub fn parse_metadata(text: &str, source_name: &str) -> Result<MetadataTable, MetadataError> {
    let parse_error = |message: String| MetadataError::Parse {
        source_name: source_name.to_string(),
        message,
    };

    let root = parse_document(text).map_err(parse_error)?;
    if root.local_name() != "OME" {
        return Err(parse_error(format!(
            "expected <OME> root, found <{}>",
            root.local_name()
        )));
    }

    let mut table = MetadataTable::new();
    let mut samples: HashMap<String, SampleInfo> = HashMap::new();

    if let Some(plate) = root.child("Plate") {
        table.plate.name = plate.attr("Name").map(str::to_string);
        table.plate.rows = plate.parse_attr("Rows").map_err(parse_error)?;
        table.plate.columns = plate.parse_attr("Columns").map_err(parse_error)?;

        for well in plate.children_named("Well") {
            let row: Option<u32> = well.parse_attr("Row").map_err(parse_error)?;
            let column: Option<u32> = well.parse_attr("Column").map_err(parse_error)?;
            let name = match (well.attr("Name"), row, column) {
                (Some(name), _, _) => name.to_string(),
                (None, Some(row), Some(column)) => format_well_name(row, column),
                _ => return Err(parse_error("<Well> without Name or Row/Column".to_string())),
            };
            for sample in well.children_named("WellSample") {
                let image_ref = sample
                    .attr("ImageRef")
                    .or_else(|| sample.child("ImageRef").and_then(|r| r.attr("ID")))
                    .ok_or_else(|| parse_error("<WellSample> without ImageRef".to_string()))?;
                let grid_row: Option<u32> = sample.parse_attr("GridRow").map_err(parse_error)?;
                let grid_column: Option<u32> =
                    sample.parse_attr("GridColumn").map_err(parse_error)?;
                let info = SampleInfo {
                    well: name.clone(),
                    site: sample.parse_attr("Index").map_err(parse_error)?,
                    grid: grid_row.zip(grid_column).map(|(r, c)| GridPosition::new(r, c)),
                };
                if samples.insert(image_ref.to_string(), info).is_some() {
                    return Err(MetadataError::Inconsistent(format!(
                        "{source_name}: image {image_ref} is referenced by more than one well sample"
                    )));
                }
            }
        }
    }

    for (series, image) in root.children_named("Image").enumerate() {
        let image_id = image.attr("ID").map(str::to_string);
        let sample = image_id.as_ref().and_then(|id| samples.get(id));
        let pixels = image.child("Pixels");

        let pixel_info = match pixels {
            Some(pixels) => {
                let pixel_type = pixels
                    .attr("Type")
                    .map(|t| t.parse::<PixelType>().map_err(parse_error))
                    .transpose()?;
                let width: Option<u32> = pixels.parse_attr("SizeX").map_err(parse_error)?;
                let height: Option<u32> = pixels.parse_attr("SizeY").map_err(parse_error)?;
                match (pixel_type, width, height) {
                    (Some(pixel_type), Some(width), Some(height)) => Some(PixelInfo {
                        pixel_type,
                        width,
                        height,
                    }),
                    _ => None,
                }
            }
            None => None,
        };

        let channels: Vec<&XmlElement> = pixels
            .map(|p| p.children_named("Channel").collect())
            .unwrap_or_default();
        let planes: Vec<&XmlElement> = pixels
            .map(|p| p.children_named("Plane").collect())
            .unwrap_or_default();
        let empty_plane = XmlElement::new("Plane");
        let planes = if planes.is_empty() {
            vec![&empty_plane]
        } else {
            planes
        };
        let single_plane = planes.len() == 1;

        let source = image.child("Source");

        for (plane_index, plane) in planes.into_iter().enumerate() {
            let mut record = ImageRecord::default();
            if single_plane {
                record.name = image.attr("Name").map(str::to_string);
            }
            record.acquired_at = image.attr("AcquisitionDate").map(str::to_string);
            record.channel = plane.parse_attr("TheC").map_err(parse_error)?;
            record.zplane = plane.parse_attr("TheZ").map_err(parse_error)?;
            record.tpoint = plane.parse_attr("TheT").map_err(parse_error)?;
            record.channel_name = channel_name(&channels, record.channel);
            let x: Option<f64> = plane.parse_attr("PositionX").map_err(parse_error)?;
            let y: Option<f64> = plane.parse_attr("PositionY").map_err(parse_error)?;
            record.stage = x.zip(y).map(|(x, y)| StagePosition::new(x, y));
            record.pixels = pixel_info;

            if let Some(sample) = sample {
                record.well = Some(sample.well.clone());
                record.site = sample.site;
                record.grid = sample.grid;
            }

            record.source = match source {
                Some(source) => {
                    let mut planes = Vec::new();
                    for p in source.children_named("Plane") {
                        let index: Option<u32> = p.parse_attr("Index").map_err(parse_error)?;
                        planes.extend(index);
                    }
                    if planes.is_empty() {
                        planes.push(plane_index as u32);
                    }
                    SourceRef {
                        files: source
                            .children_named("File")
                            .filter_map(|f| f.attr("Name").map(str::to_string))
                            .collect(),
                        series: source
                            .parse_attr("Series")
                            .map_err(parse_error)?
                            .unwrap_or(series as u32),
                        planes,
                    }
                }
                None => SourceRef {
                    files: Vec::new(),
                    series: series as u32,
                    planes: vec![plane_index as u32],
                },
            };

            table.push(record);
        }
    }

    Ok(table)
}

/// Look up a channel name by explicit `Index` attribute, then by position.
fn channel_name(channels: &[&XmlElement], index: Option<u32>) -> Option<String> {
    let by_index = index.and_then(|i| {
        channels
            .iter()
            .find(|c| c.attr("Index").and_then(|v| v.parse::<u32>().ok()) == Some(i))
    });
    let by_position = || match index {
        Some(i) if channels.iter().all(|c| c.attr("Index").is_none()) => {
            channels.get(i as usize)
        }
        None if channels.len() == 1 => channels.first(),
        _ => None,
    };
    by_index
        .or_else(by_position)
        .and_then(|c| c.attr("Name"))
        .map(str::to_string)
}

/// Render a table as a metadata document.
pub fn render_metadata(table: &MetadataTable) -> String {
    let mut plate = XmlElement::new("Plate")
        .with_opt_attr("Name", table.plate.name.as_deref())
        .with_opt_attr("Rows", table.plate.rows)
        .with_opt_attr("Columns", table.plate.columns);

    let mut wells: BTreeMap<&str, Vec<&ImageRecord>> = BTreeMap::new();
    for record in table.iter() {
        if let Some(well) = record.well.as_deref() {
            wells.entry(well).or_default().push(record);
        }
    }
    for (name, records) in wells {
        let position = parse_well_name(name);
        let mut well = XmlElement::new("Well")
            .with_attr("Name", name)
            .with_opt_attr("Row", position.map(|p| p.0))
            .with_opt_attr("Column", position.map(|p| p.1));
        for record in records {
            well.children.push(
                XmlElement::new("WellSample")
                    .with_opt_attr("Index", record.site)
                    .with_attr("ImageRef", record.ref_id())
                    .with_opt_attr("GridRow", record.grid.map(|g| g.row))
                    .with_opt_attr("GridColumn", record.grid.map(|g| g.column)),
            );
        }
        plate.children.push(well);
    }

    let mut root = XmlElement::new("OME").with_child(plate);
    for record in table.iter() {
        let mut pixels = XmlElement::new("Pixels")
            .with_opt_attr("Type", record.pixels.map(|p| p.pixel_type.name()))
            .with_opt_attr("SizeX", record.pixels.map(|p| p.width))
            .with_opt_attr("SizeY", record.pixels.map(|p| p.height));
        if let Some(name) = record.channel_name.as_deref() {
            pixels.children.push(
                XmlElement::new("Channel")
                    .with_opt_attr("Index", record.channel)
                    .with_attr("Name", name),
            );
        }
        pixels.children.push(
            XmlElement::new("Plane")
                .with_opt_attr("TheC", record.channel)
                .with_opt_attr("TheZ", record.zplane)
                .with_opt_attr("TheT", record.tpoint)
                .with_opt_attr("PositionX", record.stage.map(|s| s.x))
                .with_opt_attr("PositionY", record.stage.map(|s| s.y)),
        );

        let mut source = XmlElement::new("Source").with_attr("Series", record.source.series);
        for file in &record.source.files {
            source.children.push(XmlElement::new("File").with_attr("Name", file));
        }
        for plane in &record.source.planes {
            source.children.push(XmlElement::new("Plane").with_attr("Index", plane));
        }

        root.children.push(
            XmlElement::new("Image")
                .with_attr("ID", image_ref_id(record.id))
                .with_opt_attr("Name", record.name.as_deref())
                .with_opt_attr("AcquisitionDate", record.acquired_at.as_deref())
                .with_child(pixels)
                .with_child(source),
        );
    }

    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}", root.render())
}

/// Read a metadata document from the store.
pub async fn read_metadata<S: DatasetStore + ?Sized>(
    store: &S,
    name: &str,
) -> Result<MetadataTable, MetadataError> {
    let text = read_text(store, name).await?;
    parse_metadata(&text, name)
}

/// Write a metadata document to the store.
pub async fn write_metadata<S: DatasetStore + ?Sized>(
    store: &S,
    name: &str,
    table: &MetadataTable,
) -> Result<(), MetadataError> {
    write_text(store, name, render_metadata(table)).await?;
    Ok(())
}
