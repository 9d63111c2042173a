//! Image metadata: canonical records, vendor handlers and grid resolution.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────┐   ┌──────────────────────┐
//! │ embedded metadata (XML)   │   │ side files (.mlf/.nd)│
//! └─────────────┬─────────────┘   └──────────┬───────────┘
//!               └───────────────┬────────────┘
//!                               ▼
//!                ┌─────────────────────────────┐
//!                │ MetadataHandler (per format)│  formats::handler_for
//!                └──────────────┬──────────────┘
//!                               ▼
//!            determine_missing → fill_from_pattern
//!                               ▼
//!                ┌─────────────────────────────┐
//!                │ GridResolver                │  stage positions, then layout
//!                └──────────────┬──────────────┘
//!                               ▼
//!     project_z_stacks → normalize_ids → build_image_names → file mapper
//! ```

pub mod formats;
pub mod grid;
pub mod handler;
pub mod mapper;
pub mod naming;
pub mod table;
pub mod xml;

pub use formats::{check_side_files, handler_for, MetadataFormat};
pub use grid::{GridResolver, MajorAxis, StitchLayout, Traversal};
pub use handler::{
    build_image_names, determine_missing, fill_from_pattern, normalize_ids, project_z_stacks,
    ImageSource, MetadataHandler, SideFile,
};
pub use mapper::{create_file_mapper, read_mapper, write_mapper, FileMapperEntry};
pub use naming::{ImageNameFields, ImageNameTemplate, DEFAULT_IMAGE_NAME_TEMPLATE};
pub use table::{
    format_well_name, image_ref_id, parse_image_ref_id, parse_well_name, FieldName,
    GridPosition, ImageRecord, MetadataTable, PixelInfo, PlateInfo, SourceRef, StagePosition,
};
pub use xml::{parse_metadata, read_metadata, render_metadata, write_metadata};
