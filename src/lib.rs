//! # TM Pipeline
//!
//! Processing pipeline for high-throughput microscopy acquisitions.
//!
//! Large multi-field acquisitions are ingested as uploads of raw image files.
//! Heterogeneous vendor metadata is reconciled into a canonical per-cycle
//! schema, work is partitioned into independent run jobs merged by one
//! collect job per stage, and fields are stitched into mosaics and tiled
//! into multi-resolution pyramids.
//!
//! ## Features
//!
//! - **Vendor metadata**: embedded XML plus CellVoyager and VisiView side files
//! - **Grid resolution**: from stage positions, falling back to a declared layout
//! - **Run/collect jobs**: validated partitions executed as bounded parallel tasks
//! - **Cycle reconciliation**: uploads merged into cycles keyed by timepoint
//! - **Stitching**: well mosaics and collages with illumination correction and alignment
//! - **Tile pyramids**: Zoomify-style PNG tiles with an LRU tile cache
//!
//! ## Architecture
//!
//! - [`store`] - Named-dataset storage (filesystem and in-memory)
//! - [`metadata`] - Canonical records, vendor handlers and grid resolution
//! - [`experiment`] - Experiment layout and dataset locations
//! - [`jobs`] - Run/collect job descriptions and their execution
//! - [`metaconfig`] - Metadata stage and cycle reconciliation
//! - [`mosaic`] - Mosaic and collage stitching
//! - [`tile`] - Tile pyramids and their store
//! - [`pyramid`] - Pyramid stage
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tm_pipeline::{Diagnostics, FsStore, JobRunner, MetaconfigArgs, MetaconfigStage, Stage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tm_pipeline::JobError> {
//!     let store = Arc::new(FsStore::new("/data/experiment"));
//!     let stage = Arc::new(MetaconfigStage::new(
//!         store,
//!         MetaconfigArgs::default(),
//!         Diagnostics::current(),
//!     ));
//!
//!     let jobs = stage.create_job_descriptions().await?;
//!     JobRunner::new(Diagnostics::current())
//!         .run_stage(stage, &jobs)
//!         .await
//! }
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod experiment;
pub mod jobs;
pub mod metaconfig;
pub mod metadata;
pub mod mosaic;
pub mod pixels;
pub mod pyramid;
pub mod store;
pub mod tile;

// Re-export commonly used types
pub use config::{Cli, CollectConfig, Command, InitConfig, RunConfig, StageName, SubmitConfig};
pub use diagnostics::Diagnostics;
pub use error::{JobError, MetadataError, NotSupportedError, StitchError, StoreError, TileError};
pub use experiment::{Cycle, Experiment, ExperimentManifest, Upload};
pub use jobs::{JobDescription, JobDescriptions, JobRunner, NoParams, Stage};
pub use metaconfig::{CycleReconciler, MetaconfigArgs, MetaconfigStage};
pub use metadata::{
    handler_for, FileMapperEntry, GridResolver, ImageNameTemplate, ImageRecord, MetadataFormat,
    MetadataHandler, MetadataTable, StitchLayout,
};
pub use mosaic::{StitchKind, StitchOptions, StitchedImage};
pub use pixels::{ChannelImage, ChannelImageMetadata, IllumStats, ImageShift, PixelPlane, PixelType};
pub use pyramid::{LayerDescription, PyramidArgs, PyramidStage};
pub use store::{DatasetStore, FsStore, MemoryStore};
pub use tile::{PyramidBuilder, PyramidLayout, PyramidTileStore, TileCache, TileKey};
