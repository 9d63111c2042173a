//! Canonical image file names.
//!
//! Reconciliation and every downstream consumer derive image names from the
//! same [`ImageNameTemplate`], so a name can always be recomputed from the
//! addressing fields of an image.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MetadataError;

/// Template used when an experiment does not declare its own.
pub const DEFAULT_IMAGE_NAME_TEMPLATE: &str =
    "{experiment}_t{t:0>3}_{w}_y{y:0>3}_x{x:0>3}_c{c:0>3}_z{z:0>3}.png";

/// Values substituted into an [`ImageNameTemplate`].
#[derive(Debug, Clone, Copy)]
pub struct ImageNameFields<'a> {
    pub experiment: &'a str,
    /// Timepoint; the cycle index after reconciliation
    pub t: u32,
    pub w: &'a str,
    pub y: u32,
    pub x: u32,
    pub c: u32,
    pub z: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    Experiment,
    T,
    W,
    Y,
    X,
    C,
    Z,
}

impl Placeholder {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "experiment" => Placeholder::Experiment,
            "t" => Placeholder::T,
            "w" => Placeholder::W,
            "y" => Placeholder::Y,
            "x" => Placeholder::X,
            "c" => Placeholder::C,
            "z" => Placeholder::Z,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field {
        placeholder: Placeholder,
        width: usize,
    },
}

/// Parsed file name template with `{experiment} {t} {w} {y} {x} {c} {z}`
/// placeholders and optional zero padding (`{t:0>3}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageNameTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl ImageNameTemplate {
    pub fn parse(template: &str) -> Result<Self, MetadataError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| MetadataError::Pattern(format!("unclosed '{{' in '{template}'")))?;
            let spec = &after[..close];
            let (name, format) = match spec.split_once(':') {
                Some((name, format)) => (name, Some(format)),
                None => (spec, None),
            };
            let placeholder = Placeholder::parse(name).ok_or_else(|| {
                MetadataError::Pattern(format!("unknown placeholder '{name}' in '{template}'"))
            })?;
            let width = match format {
                None => 0,
                Some(format) => format
                    .strip_prefix("0>")
                    .and_then(|w| w.parse().ok())
                    .ok_or_else(|| {
                        MetadataError::Pattern(format!(
                            "unsupported format '{format}' in '{template}'"
                        ))
                    })?,
            };
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Field { placeholder, width });
            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            return Err(MetadataError::Pattern(format!(
                "unmatched '}}' in '{template}'"
            )));
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Substitute `fields` into the template.
    pub fn format(&self, fields: &ImageNameFields<'_>) -> String {
        let mut name = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => name.push_str(text),
                Segment::Field { placeholder, width } => {
                    let value = match placeholder {
                        Placeholder::Experiment => fields.experiment.to_string(),
                        Placeholder::W => fields.w.to_string(),
                        Placeholder::T => fields.t.to_string(),
                        Placeholder::Y => fields.y.to_string(),
                        Placeholder::X => fields.x.to_string(),
                        Placeholder::C => fields.c.to_string(),
                        Placeholder::Z => fields.z.to_string(),
                    };
                    name.push_str(&format!("{value:0>width$}", width = *width));
                }
            }
        }
        name
    }
}

impl Default for ImageNameTemplate {
    fn default() -> Self {
        Self::parse(DEFAULT_IMAGE_NAME_TEMPLATE).unwrap_or_else(|_| Self {
            source: DEFAULT_IMAGE_NAME_TEMPLATE.to_string(),
            segments: vec![Segment::Literal(DEFAULT_IMAGE_NAME_TEMPLATE.to_string())],
        })
    }
}

impl fmt::Display for ImageNameTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for ImageNameTemplate {
    type Error = MetadataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageNameTemplate> for String {
    fn from(value: ImageNameTemplate) -> Self {
        value.source
    }
}
