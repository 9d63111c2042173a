//! Command line configuration.
//!
//! Every stage is driven through the same four subcommands:
//!
//! - `init`: create and persist a stage's job descriptions
//! - `run --job N`: execute one persisted run job
//! - `collect`: execute the persisted collect job
//! - `submit`: execute all persisted run jobs in parallel, then collect
//!
//! # Environment Variables
//!
//! - `TM_EXPERIMENT_DIR` - Root directory of the experiment (default: .)
//! - `TM_MAX_PARALLEL` - Concurrently running jobs for `submit` (default: 4)

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::jobs::DEFAULT_MAX_PARALLEL;
use crate::metadata::{MajorAxis, MetadataFormat, StitchLayout, Traversal};
use crate::metaconfig::MetaconfigArgs;
use crate::pyramid::PyramidArgs;
use crate::tile::DEFAULT_TILE_SIZE;

// =============================================================================
// CLI Arguments
// =============================================================================

/// TM Pipeline - metadata reconciliation, stitching and tile pyramids for
/// high-throughput microscopy.
#[derive(Parser, Debug, Clone)]
#[command(name = "tm-pipeline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory of the experiment.
    #[arg(long, global = true, default_value = ".", env = "TM_EXPERIMENT_DIR")]
    pub experiment_dir: PathBuf,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create and persist the job descriptions of a stage.
    Init(InitConfig),

    /// Execute a single run job.
    Run(RunConfig),

    /// Execute the collect job.
    Collect(CollectConfig),

    /// Execute every run job, then the collect job.
    Submit(SubmitConfig),
}

impl Command {
    pub fn stage(&self) -> StageName {
        match self {
            Command::Init(config) => config.stage,
            Command::Run(config) => config.stage,
            Command::Collect(config) => config.stage,
            Command::Submit(config) => config.stage,
        }
    }
}

/// Pipeline stage selector.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageName {
    Metaconfig,
    Pyramid,
}

impl StageName {
    pub const fn name(&self) -> &'static str {
        match self {
            StageName::Metaconfig => crate::metaconfig::STAGE_NAME,
            StageName::Pyramid => crate::pyramid::STAGE_NAME,
        }
    }
}

// =============================================================================
// Init
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct InitConfig {
    #[arg(long, value_enum)]
    pub stage: StageName,

    // =========================================================================
    // Metaconfig
    // =========================================================================
    /// Vendor metadata format of the uploads.
    #[arg(long, default_value = "default")]
    pub format: MetadataFormat,

    /// Named-capture pattern (w, c, z, t, s) for image file names.
    #[arg(long)]
    pub regex: Option<String>,

    /// Rows of the acquisition grid, used when stage positions are unusable.
    #[arg(long, requires = "stitch_columns")]
    pub stitch_rows: Option<u32>,

    /// Columns of the acquisition grid.
    #[arg(long, requires = "stitch_rows")]
    pub stitch_columns: Option<u32>,

    /// Axis along which sites were acquired first (row or column).
    #[arg(long, default_value = "row")]
    pub stitch_major_axis: MajorAxis,

    /// Site acquisition order (raster or serpentine).
    #[arg(long, default_value = "raster")]
    pub stitch_traversal: Traversal,

    /// Project focal planes onto a single plane.
    #[arg(long, default_value_t = false)]
    pub z_projection: bool,

    // =========================================================================
    // Pyramid
    // =========================================================================
    /// Horizontal overlap of neighbouring sites in pixels.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub dx: i64,

    /// Vertical overlap of neighbouring sites in pixels.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub dy: i64,

    /// Gap between wells in pixels.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub spacing: i64,

    /// Intensity mapped to white; defaults to the layer maximum.
    #[arg(long)]
    pub clip_value: Option<f64>,

    /// Correct images for illumination artifacts.
    #[arg(long, default_value_t = false)]
    pub illumcorr: bool,

    /// Align images between cycles.
    #[arg(long, default_value_t = false)]
    pub align: bool,

    /// Tile edge length in pixels.
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE)]
    pub tile_size: u32,
}

impl InitConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(regex) = &self.regex {
            regex::Regex::new(regex).map_err(|e| format!("Invalid --regex: {e}"))?;
        }
        if self.stitch_rows == Some(0) || self.stitch_columns == Some(0) {
            return Err("stitch rows and columns must be greater than 0".to_string());
        }
        if self.dx < 0 || self.dy < 0 || self.spacing < 0 {
            return Err("dx, dy and spacing must not be negative".to_string());
        }
        if let Some(clip) = self.clip_value {
            if !(clip > 0.0) {
                return Err("clip_value must be greater than 0".to_string());
            }
        }
        if self.tile_size == 0 {
            return Err("tile_size must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Declared stitch layout, if both dimensions were given.
    pub fn stitch_layout(&self) -> Option<StitchLayout> {
        let (rows, columns) = (self.stitch_rows?, self.stitch_columns?);
        StitchLayout::new(rows, columns, self.stitch_major_axis, self.stitch_traversal).ok()
    }

    pub fn metaconfig_args(&self) -> MetaconfigArgs {
        MetaconfigArgs {
            format: self.format,
            regex: self.regex.clone(),
            stitch_layout: self.stitch_layout(),
            z_projection: self.z_projection,
        }
    }

    pub fn pyramid_args(&self) -> PyramidArgs {
        PyramidArgs {
            dx: self.dx,
            dy: self.dy,
            spacing: self.spacing,
            clip_value: self.clip_value,
            illumcorr: self.illumcorr,
            align: self.align,
            tile_size: self.tile_size,
        }
    }
}

// =============================================================================
// Run / Collect / Submit
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct RunConfig {
    #[arg(long, value_enum)]
    pub stage: StageName,

    /// One-based id of the run job.
    #[arg(long)]
    pub job: usize,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.job == 0 {
            return Err("run job ids start at 1".to_string());
        }
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
pub struct CollectConfig {
    #[arg(long, value_enum)]
    pub stage: StageName,
}

#[derive(Args, Debug, Clone)]
pub struct SubmitConfig {
    #[arg(long, value_enum)]
    pub stage: StageName,

    /// Maximum number of concurrently running jobs.
    #[arg(long, default_value_t = DEFAULT_MAX_PARALLEL, env = "TM_MAX_PARALLEL")]
    pub max_parallel: usize,
}

impl SubmitConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_parallel == 0 {
            return Err("max_parallel must be greater than 0".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
