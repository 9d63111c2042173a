use crate::error::MetadataError;
use crate::metadata::handler::{combine_embedded, ImageSource, MetadataHandler, SideFile};
use crate::metadata::table::MetadataTable;

use super::MetadataFormat;

/// Handler for uploads whose embedded metadata is complete on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandler;

impl MetadataHandler for DefaultHandler {
    fn format(&self) -> MetadataFormat {
        MetadataFormat::Default
    }

    fn extract(
        &self,
        sources: &[ImageSource],
        _side_files: &[SideFile],
    ) -> Result<MetadataTable, MetadataError> {
        Ok(combine_embedded(sources))
    }
}
