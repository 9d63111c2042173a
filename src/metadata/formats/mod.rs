//! Static registry of supported metadata formats.
//!
//! Each format is a [`MetadataFormat`] variant with a handler implementation.
//! Adding a format means adding a variant, its handler and a match arm in
//! [`handler_for`].
//!
//! # Supported Formats
//!
//! - **default**: embedded metadata only
//! - **cellvoyager**: Yokogawa CellVoyager, `.mlf` measurement records
//!   (`.mrf` settings files are accepted and ignored)
//! - **visiview**: Visitron VisiView, `.nd` acquisition description

mod cellvoyager;
mod default;
mod visiview;

pub use cellvoyager::CellVoyagerHandler;
pub use default::DefaultHandler;
pub use visiview::VisiViewHandler;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::handler::{has_extension, MetadataHandler};
use crate::error::NotSupportedError;

// =============================================================================
// MetadataFormat
// =============================================================================

/// Declared metadata format of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataFormat {
    #[default]
    Default,
    CellVoyager,
    VisiView,
}

impl MetadataFormat {
    /// All registered formats.
    pub const ALL: [MetadataFormat; 3] = [
        MetadataFormat::Default,
        MetadataFormat::CellVoyager,
        MetadataFormat::VisiView,
    ];

    /// Declared name of the format.
    pub const fn name(&self) -> &'static str {
        match self {
            MetadataFormat::Default => "default",
            MetadataFormat::CellVoyager => "cellvoyager",
            MetadataFormat::VisiView => "visiview",
        }
    }
}

impl fmt::Display for MetadataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MetadataFormat {
    type Err = NotSupportedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetadataFormat::ALL
            .into_iter()
            .find(|format| format.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let known: Vec<_> = MetadataFormat::ALL.iter().map(|f| f.name()).collect();
                NotSupportedError::new(format!(
                    "unknown metadata format '{}' (supported: {})",
                    s,
                    known.join(", ")
                ))
            })
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Handler implementing `format`.
pub fn handler_for(format: MetadataFormat) -> Box<dyn MetadataHandler> {
    match format {
        MetadataFormat::Default => Box::new(DefaultHandler),
        MetadataFormat::CellVoyager => Box::new(CellVoyagerHandler),
        MetadataFormat::VisiView => Box::new(VisiViewHandler),
    }
}

/// Check that `handler` accepts every side file in `names`.
pub fn check_side_files(
    handler: &dyn MetadataHandler,
    names: &[String],
) -> Result<(), NotSupportedError> {
    let extensions = handler.side_file_extensions();
    for name in names {
        if !extensions.iter().any(|ext| has_extension(name, ext)) {
            return Err(NotSupportedError::new(if extensions.is_empty() {
                format!(
                    "format '{}' does not use side files, got '{}'",
                    handler.format(),
                    name
                )
            } else {
                format!(
                    "format '{}' does not accept side file '{}' (expected: {})",
                    handler.format(),
                    name,
                    extensions.join(", ")
                )
            }));
        }
    }
    Ok(())
}
