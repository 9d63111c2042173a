//! The `pyramid` stage: one tiled layer per (cycle, channel, plane).
//!
//! # Jobs
//!
//! ```text
//! cycle table + global mapper
//!         │
//!         ▼
//! run #n: per well  Mosaic (overlap dx/dy, correction, alignment)
//!         wells  ─► Collage (spacing)
//!                ─► rescale to 8 bit (clip value or layer maximum)
//!                ─► PyramidBuilder ─► layers/layer_LLL/TileGroup*/...
//!                ─► layers/layer_LLL/layer.json
//!         │
//!         ▼
//! collect: layers/pyramid.json
//! ```

mod layer;

pub use layer::{LayerDescription, LayerKey, SiteShift};

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::diagnostics::Diagnostics;
use crate::error::{JobError, StitchError};
use crate::experiment::{
    cycle_image_file, global_mapper_file, illumstats_file, layer_metadata_file,
    pyramid_index_file, shifts_file, Experiment,
};
use crate::jobs::{JobDescription, JobDescriptions, NoParams, Stage, COLLECT_JOB_ID};
use crate::metadata::{read_mapper, read_metadata, FileMapperEntry, MetadataTable};
use crate::mosaic::{StitchKind, StitchOptions};
use crate::pixels::{ChannelImage, ChannelImageMetadata, IllumStats, PixelPlane};
use crate::store::{read_json, write_json, DatasetStore};
use crate::tile::{PyramidBuilder, PyramidTileStore, DEFAULT_TILE_SIZE};

use layer::{channel_metadata, load_plane, shift_lookup};

pub const STAGE_NAME: &str = "pyramid";

fn default_tile_size() -> u32 {
    DEFAULT_TILE_SIZE
}

/// User options of the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PyramidArgs {
    /// Horizontal overlap of neighbouring sites in pixels
    #[serde(default)]
    pub dx: i64,

    /// Vertical overlap of neighbouring sites in pixels
    #[serde(default)]
    pub dy: i64,

    /// Gap between wells in pixels
    #[serde(default)]
    pub spacing: i64,

    /// Intensity mapped to 255; the layer maximum when unset
    #[serde(default)]
    pub clip_value: Option<f64>,

    /// Apply the cycle's illumination statistics
    #[serde(default)]
    pub illumcorr: bool,

    /// Apply the cycle's alignment shifts
    #[serde(default)]
    pub align: bool,

    #[serde(default = "default_tile_size")]
    pub tile_size: u32,
}

impl Default for PyramidArgs {
    fn default() -> Self {
        Self {
            dx: 0,
            dy: 0,
            spacing: 0,
            clip_value: None,
            illumcorr: false,
            align: false,
            tile_size: DEFAULT_TILE_SIZE,
        }
    }
}

/// Parameters of one run job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PyramidJobParams {
    pub layer: u32,

    #[serde(flatten)]
    pub key: LayerKey,

    #[serde(flatten)]
    pub args: PyramidArgs,
}

pub struct PyramidStage<S> {
    tiles: PyramidTileStore<S>,
    args: PyramidArgs,
    diagnostics: Diagnostics,
}

impl<S: DatasetStore + 'static> PyramidStage<S> {
    pub fn new(store: S, args: PyramidArgs, diagnostics: Diagnostics) -> Self {
        Self {
            tiles: PyramidTileStore::new(store, diagnostics.clone()),
            args,
            diagnostics,
        }
    }

    pub fn tiles(&self) -> &PyramidTileStore<S> {
        &self.tiles
    }

    fn store(&self) -> &S {
        self.tiles.store()
    }

    /// Channel images of one layer, grouped by well.
    async fn load_layer(
        &self,
        key: LayerKey,
        table: &MetadataTable,
        mapper: &[FileMapperEntry],
        args: &PyramidArgs,
    ) -> Result<BTreeMap<String, Vec<ChannelImage>>, JobError> {
        let entries: HashMap<&str, &FileMapperEntry> =
            mapper.iter().map(|e| (e.ref_file.as_str(), e)).collect();

        let shifts: Vec<SiteShift> = if args.align {
            read_json(self.store(), &shifts_file(key.cycle)).await?
        } else {
            Vec::new()
        };
        let shifts = shift_lookup(&shifts);

        let mut wells: BTreeMap<String, Vec<ChannelImage>> = BTreeMap::new();
        for record in table.iter() {
            if record.channel != Some(key.channel) || record.zplane != Some(key.zplane) {
                continue;
            }
            let mut metadata = channel_metadata(key.cycle, record).ok_or_else(|| {
                JobError::InvalidDescription(format!(
                    "image {} of cycle {} is not fully reconciled",
                    record.id, key.cycle
                ))
            })?;
            let location = cycle_image_file(key.cycle, &metadata.name);
            let entry = entries.get(location.as_str()).ok_or_else(|| {
                JobError::InvalidDescription(format!("no mapper entry for {location}"))
            })?;
            metadata.shift = shifts
                .get(&(metadata.well.as_str(), metadata.y, metadata.x))
                .copied();

            let plane = load_plane(self.store(), entry).await?;
            wells
                .entry(metadata.well.clone())
                .or_default()
                .push(ChannelImage::new(plane, metadata));
        }
        Ok(wells)
    }

    /// Stitch each well and lay the wells out side by side.
    fn assemble(
        &self,
        key: LayerKey,
        wells: &BTreeMap<String, Vec<ChannelImage>>,
        stats: Option<IllumStats>,
        args: &PyramidArgs,
    ) -> Result<PixelPlane, StitchError> {
        let mut options = StitchOptions::new(args.dx, args.dy)?.with_alignment(args.align);
        if let Some(stats) = stats {
            options = options.with_stats(stats);
        }

        let mut mosaics = Vec::with_capacity(wells.len());
        for (well, images) in wells {
            let mosaic = StitchKind::Mosaic.create(images, &options)?;
            self.diagnostics.in_scope(|| {
                debug!(
                    well = %well,
                    sites = images.len(),
                    dimensions = ?mosaic.dimensions(),
                    "Stitched well"
                )
            });
            let first = &images[0].metadata;
            mosaics.push(ChannelImage::new(
                mosaic.into_plane(),
                ChannelImageMetadata {
                    name: well.clone(),
                    well: well.clone(),
                    y: 0,
                    x: 0,
                    shift: None,
                    cycle: key.cycle,
                    ..first.clone()
                },
            ));
        }

        let collage = StitchKind::Collage.create(&mosaics, &StitchOptions::new(args.spacing, args.spacing)?)?;
        Ok(collage.into_plane())
    }

    /// Layers of the experiment in cycle, channel, plane order.
    async fn layers(&self, experiment: &Experiment) -> Result<Vec<(LayerKey, Vec<String>)>, JobError> {
        let mut layers = Vec::new();
        for cycle in &experiment.cycles {
            let table = read_metadata(self.store(), &cycle.metadata_file()).await?;
            let mut keys: BTreeMap<LayerKey, Vec<String>> = BTreeMap::new();
            for record in table.iter() {
                let (Some(channel), Some(zplane), Some(name)) =
                    (record.channel, record.zplane, record.name.as_deref())
                else {
                    continue;
                };
                keys.entry(LayerKey {
                    cycle: cycle.index,
                    channel,
                    zplane,
                })
                .or_default()
                .push(cycle.image_file(name));
            }
            layers.extend(keys);
        }
        Ok(layers)
    }
}

#[async_trait]
impl<S: DatasetStore + 'static> Stage for PyramidStage<S> {
    type RunParams = PyramidJobParams;
    type CollectParams = NoParams;

    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    async fn create_job_descriptions(
        &self,
    ) -> Result<JobDescriptions<PyramidJobParams, NoParams>, JobError> {
        let experiment = Experiment::load(self.store(), &self.diagnostics).await?;
        if experiment.cycles.is_empty() {
            return Err(JobError::InvalidDescription(
                "experiment has no cycles, run the metaconfig stage first".to_string(),
            ));
        }

        let layers = self.layers(&experiment).await?;
        let mut run = Vec::with_capacity(layers.len());
        for (layer, (key, images)) in layers.into_iter().enumerate() {
            let layer = layer as u32;
            let params = PyramidJobParams {
                layer,
                key,
                args: self.args.clone(),
            };
            run.push(
                JobDescription::new(layer as usize + 1, params)
                    .with_input("image_files", images)
                    .with_output("layer_files", vec![layer_metadata_file(layer)]),
            );
        }

        let collect = JobDescription::new(COLLECT_JOB_ID, NoParams {})
            .with_input(
                "layer_files",
                (0..run.len() as u32).map(layer_metadata_file).collect(),
            )
            .with_output("pyramid_files", vec![pyramid_index_file()]);

        self.diagnostics.in_scope(|| {
            info!(
                experiment = %experiment.name,
                cycles = experiment.cycles.len(),
                layers = run.len(),
                "Created pyramid jobs"
            )
        });
        Ok(JobDescriptions { run, collect })
    }

    async fn run_job(&self, job: &JobDescription<PyramidJobParams>) -> Result<(), JobError> {
        let params = &job.params;
        let key = params.key;
        let store = self.store();

        let experiment = Experiment::load(store, &self.diagnostics).await?;
        let cycle = experiment.cycle(key.cycle).ok_or_else(|| {
            JobError::InvalidDescription(format!(
                "job #{} refers to missing cycle {}",
                job.id, key.cycle
            ))
        })?;
        let table = read_metadata(store, &cycle.metadata_file()).await?;
        let mapper = read_mapper(store, &global_mapper_file()).await?;

        let wells = self.load_layer(key, &table, &mapper, &params.args).await?;
        let Some(channel_name) = wells
            .values()
            .flatten()
            .map(|image| image.metadata.channel_name.clone())
            .next()
        else {
            return Err(JobError::InvalidDescription(format!(
                "layer {} has no images",
                params.layer
            )));
        };

        let stats: Option<IllumStats> = if params.args.illumcorr {
            Some(read_json(store, &illumstats_file(key.cycle, key.channel)).await?)
        } else {
            None
        };

        let plane = self.assemble(key, &wells, stats, &params.args)?;
        let clip_value = match params.args.clip_value {
            Some(value) => value,
            None => {
                let max = plane.max_value();
                if max > 0.0 {
                    max
                } else {
                    1.0
                }
            }
        };
        let image = plane.rescaled_u8(clip_value)?;

        let layout = PyramidBuilder::new(self.diagnostics.clone())
            .with_tile_size(params.args.tile_size)
            .build(&self.tiles, params.layer, &image)
            .await?;

        let description = LayerDescription {
            layer: params.layer,
            cycle: key.cycle,
            channel: key.channel,
            channel_name,
            zplane: key.zplane,
            layout,
        };
        write_json(store, &layer_metadata_file(params.layer), &description).await?;

        self.diagnostics.in_scope(|| {
            info!(
                layer = params.layer,
                cycle = key.cycle,
                channel = key.channel,
                zplane = key.zplane,
                wells = wells.len(),
                clip_value,
                "Built channel layer"
            )
        });
        Ok(())
    }

    async fn collect_job_output(&self, job: &JobDescription<NoParams>) -> Result<(), JobError> {
        let mut layers: Vec<LayerDescription> = Vec::new();
        for file in job.input_files() {
            layers.push(read_json(self.store(), file).await?);
        }
        layers.sort_by_key(|l| l.layer);
        write_json(self.store(), &pyramid_index_file(), &layers).await?;

        self.diagnostics
            .in_scope(|| info!(layers = layers.len(), "Wrote pyramid index"));
        Ok(())
    }
}
