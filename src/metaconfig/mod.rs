//! The `metaconfig` stage: per-upload metadata extraction and reconciliation
//! into cycles.
//!
//! # Jobs
//!
//! ```text
//! run #1 (upload_000) ──► image_metadata.ome.xml + image_mapper.json ─┐
//! run #2 (upload_001) ──► image_metadata.ome.xml + image_mapper.json ─┤
//!                                                                     ▼
//!                               collect: CycleReconciler ──► cycles/cycle_NNN/*
//!                                                         ──► uploads/image_mapper.json
//! ```
//!
//! Run jobs only touch their own upload; the collect job consumes uploads in
//! index order and persists after each one.

pub mod reconcile;

pub use reconcile::{CycleReconciler, CycleTable, UploadMetadata};

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::diagnostics::Diagnostics;
use crate::error::{JobError, MetadataError};
use crate::experiment::{
    cycle_location, cycle_marker_file, global_mapper_file, CycleMarker, Experiment, Upload,
};
use crate::jobs::{JobDescription, JobDescriptions, NoParams, Stage, COLLECT_JOB_ID};
use crate::metadata::{
    build_image_names, check_side_files, create_file_mapper, determine_missing,
    fill_from_pattern, handler_for, normalize_ids, project_z_stacks, read_mapper,
    read_metadata, write_mapper, write_metadata, GridResolver, ImageSource, MetadataFormat,
    MetadataTable, SideFile, StitchLayout,
};
use crate::store::{read_text, remove_prefix, write_json, DatasetStore};

pub const STAGE_NAME: &str = "metaconfig";

/// User options of the stage, fixed when job descriptions are created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaconfigArgs {
    #[serde(default)]
    pub format: MetadataFormat,

    /// Named-capture pattern for file names, overriding the format default
    #[serde(default)]
    pub regex: Option<String>,

    /// Grid layout used when stage positions are unusable
    #[serde(default)]
    pub stitch_layout: Option<StitchLayout>,

    /// Collapse focal planes into one image per site
    #[serde(default)]
    pub z_projection: bool,
}

/// Parameters of one run job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaconfigJobParams {
    pub upload: u32,

    #[serde(flatten)]
    pub args: MetaconfigArgs,
}

pub struct MetaconfigStage<S> {
    store: S,
    args: MetaconfigArgs,
    diagnostics: Diagnostics,
}

impl<S: DatasetStore + 'static> MetaconfigStage<S> {
    pub fn new(store: S, args: MetaconfigArgs, diagnostics: Diagnostics) -> Self {
        Self {
            store,
            args,
            diagnostics,
        }
    }

    pub fn args(&self) -> &MetaconfigArgs {
        &self.args
    }

    async fn load_experiment(&self) -> Result<Experiment, JobError> {
        Ok(Experiment::load(&self.store, &self.diagnostics).await?)
    }

    /// Build the upload's named table.
    async fn configure_upload(
        &self,
        experiment: &Experiment,
        upload: &Upload,
        args: &MetaconfigArgs,
    ) -> Result<MetadataTable, JobError> {
        let handler = handler_for(args.format);
        check_side_files(handler.as_ref(), &upload.additional_files)?;

        let mut sources = Vec::with_capacity(upload.image_files.len());
        for file in &upload.image_files {
            let metadata = read_metadata(&self.store, &upload.ome_xml_file(file)).await?;
            sources.push(ImageSource {
                file: file.clone(),
                metadata,
            });
        }
        let mut side_files = Vec::with_capacity(upload.additional_files.len());
        for name in &upload.additional_files {
            let content = read_text(&self.store, &upload.additional_file(name)).await?;
            side_files.push(SideFile::new(name.clone(), content));
        }

        let mut table = handler.extract(&sources, &side_files)?;

        let missing = determine_missing(&table);
        if !missing.is_empty() {
            let pattern = args.regex.as_deref().or(handler.default_pattern());
            let Some(pattern) = pattern else {
                return Err(MetadataError::Missing(missing).into());
            };
            self.diagnostics.in_scope(|| {
                debug!(
                    upload = upload.index,
                    missing = ?missing,
                    pattern,
                    "Filling metadata from file names"
                )
            });
            table = fill_from_pattern(&table, pattern)?;
            let still_missing = determine_missing(&table);
            if !still_missing.is_empty() {
                return Err(MetadataError::Missing(still_missing).into());
            }
        }

        let mut table = GridResolver::new(self.diagnostics.clone())
            .resolve(&table, args.stitch_layout.as_ref())?;
        if args.z_projection {
            table = project_z_stacks(&table);
        }
        let table = normalize_ids(&table);
        Ok(build_image_names(
            &table,
            &experiment.image_name_template,
            &experiment.name,
        )?)
    }
}

#[async_trait]
impl<S: DatasetStore + 'static> Stage for MetaconfigStage<S> {
    type RunParams = MetaconfigJobParams;
    type CollectParams = NoParams;

    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    async fn create_job_descriptions(
        &self,
    ) -> Result<JobDescriptions<MetaconfigJobParams, NoParams>, JobError> {
        let experiment = self.load_experiment().await?;
        let handler = handler_for(self.args.format);

        let mut run = Vec::with_capacity(experiment.uploads.len());
        for (i, upload) in experiment.uploads.iter().enumerate() {
            check_side_files(handler.as_ref(), &upload.additional_files)?;
            let params = MetaconfigJobParams {
                upload: upload.index,
                args: self.args.clone(),
            };
            run.push(
                JobDescription::new(i + 1, params)
                    .with_input(
                        "image_files",
                        upload
                            .image_files
                            .iter()
                            .map(|f| upload.image_file(f))
                            .collect(),
                    )
                    .with_input(
                        "additional_files",
                        upload
                            .additional_files
                            .iter()
                            .map(|f| upload.additional_file(f))
                            .collect(),
                    )
                    .with_input(
                        "ome_xml_files",
                        upload
                            .image_files
                            .iter()
                            .map(|f| upload.ome_xml_file(f))
                            .collect(),
                    )
                    .with_output("metadata_files", vec![upload.metadata_file()])
                    .with_output("mapper_files", vec![upload.mapper_file()]),
            );
        }

        let collect = JobDescription::new(COLLECT_JOB_ID, NoParams {})
            .with_input(
                "metadata_files",
                experiment.uploads.iter().map(Upload::metadata_file).collect(),
            )
            .with_input(
                "mapper_files",
                experiment.uploads.iter().map(Upload::mapper_file).collect(),
            )
            .with_output("mapper_files", vec![global_mapper_file()]);

        self.diagnostics.in_scope(|| {
            info!(
                experiment = %experiment.name,
                format = %self.args.format,
                jobs = run.len(),
                "Created metaconfig jobs"
            )
        });
        Ok(JobDescriptions { run, collect })
    }

    async fn run_job(&self, job: &JobDescription<MetaconfigJobParams>) -> Result<(), JobError> {
        let experiment = self.load_experiment().await?;
        let upload = experiment.upload(job.params.upload).ok_or_else(|| {
            JobError::InvalidDescription(format!(
                "job #{} refers to missing upload {}",
                job.id, job.params.upload
            ))
        })?;

        let table = self
            .configure_upload(&experiment, upload, &job.params.args)
            .await?;
        let mapper = create_file_mapper(&table);

        write_metadata(&self.store, &upload.metadata_file(), &table).await?;
        write_mapper(&self.store, &upload.mapper_file(), &mapper).await?;

        self.diagnostics.in_scope(|| {
            info!(
                upload = upload.index,
                images = table.len(),
                wells = table.wells().len(),
                "Configured upload metadata"
            )
        });
        Ok(())
    }

    async fn collect_job_output(&self, job: &JobDescription<NoParams>) -> Result<(), JobError> {
        let experiment = self.load_experiment().await?;
        if !experiment.cycles.is_empty() {
            self.diagnostics.in_scope(|| {
                warn!(
                    cycles = experiment.cycles.len(),
                    "Rebuilding existing cycles from upload metadata"
                )
            });
        }

        let inputs: BTreeSet<&str> = job.input_files();
        let mut reconciler = CycleReconciler::new(
            experiment.name.clone(),
            experiment.image_name_template.clone(),
            self.diagnostics.clone(),
        );

        for upload in &experiment.uploads {
            let metadata_file = upload.metadata_file();
            if !inputs.contains(metadata_file.as_str()) {
                continue;
            }
            let table = read_metadata(&self.store, &metadata_file).await?;
            let mapper = read_mapper(&self.store, &upload.mapper_file()).await?;
            let touched = reconciler.add_upload(&UploadMetadata {
                upload: upload.index,
                table,
                mapper,
            })?;

            for index in touched {
                let Some(cycle) = reconciler.cycle(index) else {
                    continue;
                };
                let marker = CycleMarker {
                    index: cycle.cycle.index,
                    tpoint: cycle.cycle.tpoint,
                };
                write_json(&self.store, &cycle_marker_file(index), &marker).await?;
                write_metadata(&self.store, &cycle.cycle.metadata_file(), &cycle.table).await?;
            }
            write_mapper(&self.store, &global_mapper_file(), reconciler.mapper()).await?;
        }

        // Cycles of an earlier collect that the current uploads no longer produce
        let kept = reconciler.cycles().len() as u32;
        for cycle in experiment.cycles.iter().filter(|c| c.index >= kept) {
            let removed = remove_prefix(&self.store, &cycle_location(cycle.index)).await?;
            self.diagnostics.in_scope(|| {
                warn!(cycle = cycle.index, datasets = removed, "Removed stale cycle")
            });
        }

        self.diagnostics.in_scope(|| {
            info!(
                cycles = reconciler.cycles().len(),
                images = reconciler.mapper().len(),
                "Reconciled cycles"
            )
        });
        Ok(())
    }
}
