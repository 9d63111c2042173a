//! File mapper: join table between raw source planes and reconciled images.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::{read_json, write_json, DatasetStore};

use super::table::MetadataTable;

/// One mapping from raw source planes to a reconciled image.
///
/// `ref_index` is the index of the image in its metadata table (upload-scoped
/// before reconciliation, cycle-scoped after) and is the only join key
/// between metadata and pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMapperEntry {
    pub series: u32,
    pub planes: Vec<u32>,
    pub files: Vec<String>,
    pub ref_index: usize,
    pub ref_id: String,
    /// Destination image dataset (or canonical image name before
    /// reconciliation)
    pub ref_file: String,
}

/// Build one mapper entry per record of a named table.
///
/// Records without a canonical name map to an empty `ref_file`.
pub fn create_file_mapper(table: &MetadataTable) -> Vec<FileMapperEntry> {
    table
        .iter()
        .map(|record| FileMapperEntry {
            series: record.source.series,
            planes: record.source.planes.clone(),
            files: record.source.files.clone(),
            ref_index: record.id,
            ref_id: record.ref_id(),
            ref_file: record.name.clone().unwrap_or_default(),
        })
        .collect()
}

/// Read a file mapper document.
pub async fn read_mapper<S: DatasetStore + ?Sized>(
    store: &S,
    name: &str,
) -> Result<Vec<FileMapperEntry>, StoreError> {
    read_json(store, name).await
}

/// Write a file mapper document.
pub async fn write_mapper<S: DatasetStore + ?Sized>(
    store: &S,
    name: &str,
    entries: &[FileMapperEntry],
) -> Result<(), StoreError> {
    write_json(store, name, entries).await
}
