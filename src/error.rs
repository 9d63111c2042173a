use std::collections::BTreeSet;

use thiserror::Error;

use crate::metadata::FieldName;

/// Errors raised by a dataset store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Dataset was never written (or has been removed)
    #[error("Dataset not found: {0}")]
    NotFound(String),

    /// Dataset name is empty, absolute, or escapes the store root
    #[error("Invalid dataset name: {0}")]
    InvalidName(String),

    /// Underlying filesystem error
    #[error("I/O error on {name}: {message}")]
    Io { name: String, message: String },

    /// A document could not be (de)serialized
    #[error("Serialization error on {name}: {message}")]
    Serialization { name: String, message: String },
}

impl StoreError {
    pub(crate) fn io(name: impl Into<String>, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            return StoreError::NotFound(name.into());
        }
        StoreError::Io {
            name: name.into(),
            message: err.to_string(),
        }
    }
}

/// Errors related to image metadata.
///
/// These are never defaulted away: once every documented fallback has been
/// tried the error surfaces to the job that requested the metadata.
#[derive(Debug, Clone, Error)]
pub enum MetadataError {
    /// Required fields could not be recovered from any source
    #[error("Required metadata is missing: {}", format_fields(.0))]
    Missing(BTreeSet<FieldName>),

    /// Sources contradict each other (duplicate reference ids, conflicting
    /// well/sample mappings, dangling mapper entries, ...)
    #[error("Inconsistent metadata: {0}")]
    Inconsistent(String),

    /// Grid coordinates cannot be inferred from stage positions
    #[error("Stage positions unusable: {0}")]
    StagePositions(String),

    /// Declared stitch layout does not fit the images
    #[error("Invalid stitch layout: {0}")]
    InvalidLayout(String),

    /// Filename pattern could not be compiled or applied
    #[error("Filename pattern error: {0}")]
    Pattern(String),

    /// Metadata document or side file is malformed
    #[error("Failed to parse {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    /// Metadata document could not be read or written
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

fn format_fields(fields: &BTreeSet<FieldName>) -> String {
    fields
        .iter()
        .map(|f| f.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// An unrecognized vendor format or side-file combination was requested.
#[derive(Debug, Clone, Error)]
#[error("Not supported: {reason}")]
pub struct NotSupportedError {
    pub reason: String,
}

impl NotSupportedError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors raised while composing mosaics and collages.
#[derive(Debug, Clone, Error)]
pub enum StitchError {
    /// Offsets, grid shape, or plane dimensions are unusable
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Images with different element types were combined
    #[error("Element type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Image metadata does not allow the requested composition
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Nothing to stitch
    #[error("No images to stitch")]
    EmptyInput,
}

/// Errors that can occur when storing or retrieving pyramid tiles.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// The addressed tile was never written
    #[error("Tile not found: layer {layer}, level {level}, row {row}, column {column}")]
    NotFound {
        layer: u32,
        level: u32,
        row: u32,
        column: u32,
    },

    /// Tiles hold exactly one 8-bit plane
    #[error("Invalid tile plane: {0}")]
    InvalidPlane(String),

    /// PNG encoding failed
    #[error("Failed to encode tile: {message}")]
    Encode { message: String },

    /// Stored bytes are not a decodable tile
    #[error("Failed to decode tile: {message}")]
    Decode { message: String },

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors surfaced by job creation and execution.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// One or more run jobs failed; the collect job was not scheduled
    #[error("Stage '{stage}' failed: {}", format_failures(.failures))]
    StageFailed {
        stage: String,
        failures: Vec<(usize, String)>,
    },

    /// Collect was requested before every run job completed
    #[error("Stage '{stage}' cannot be collected, run jobs not complete: {jobs:?}")]
    Incomplete { stage: String, jobs: Vec<usize> },

    /// Job descriptions break the run/collect contract
    #[error("Invalid job description: {0}")]
    InvalidDescription(String),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    NotSupported(#[from] NotSupportedError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Stitch error: {0}")]
    Stitch(#[from] StitchError),

    #[error("Tile error: {0}")]
    Tile(#[from] TileError),

    /// Job description could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn format_failures(failures: &[(usize, String)]) -> String {
    failures
        .iter()
        .map(|(id, message)| format!("job #{id}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}
