//! End-to-end pipeline tests on a filesystem store.
//!
//! Tests verify:
//! - Uploads are reconciled into one cycle per timepoint
//! - The global mapper joins raw files to cycle images
//! - The pyramid stage tiles one layer per cycle and channel
//! - Persisted job descriptions can be executed one job at a time

use std::sync::Arc;

use tm_pipeline::experiment::{
    cycle_marker_file, cycle_metadata_file, global_mapper_file, layer_metadata_file,
    pyramid_index_file, upload_metadata_file, Experiment,
};
use tm_pipeline::error::JobError;
use tm_pipeline::jobs::{
    collect_persisted_jobs, read_job_descriptions, run_persisted_job, write_job_descriptions,
    JobRunner, NoParams, Stage,
};
use tm_pipeline::metaconfig::{MetaconfigArgs, MetaconfigJobParams, MetaconfigStage};
use tm_pipeline::metadata::{read_mapper, read_metadata};
use tm_pipeline::pyramid::{LayerDescription, PyramidArgs, PyramidStage};
use tm_pipeline::store::{read_json, remove_prefix, write_text, DatasetStore, FsStore};
use tm_pipeline::tile::{tile_location, TileKey};

use super::test_utils::{uint16_plane, EmbeddedImage, TestExperiment};

/// Two uploads: t=0 with wells A01 (two sites) and B02, t=1 with A01 only.
async fn two_timepoints() -> TestExperiment {
    let experiment = TestExperiment::new("screen").await;
    for (upload, tpoint) in [(0, 0), (1, 1)] {
        for (site, x, value) in [(0, 0.0, 100), (1, 10.0, 200)] {
            let embedded = EmbeddedImage::complete(4, 4, "A01", "DAPI", tpoint)
                .site(site)
                .stage(x, 0.0);
            experiment
                .add_image(
                    upload,
                    &format!("A01_s{site}_t{tpoint}.png"),
                    &uint16_plane(4, 4, value),
                    &embedded,
                )
                .await;
        }
    }
    let embedded = EmbeddedImage::complete(4, 4, "B02", "DAPI", 0)
        .site(0)
        .stage(0.0, 0.0);
    experiment
        .add_image(0, "B02_s0_t0.png", &uint16_plane(4, 4, 300), &embedded)
        .await;
    experiment
}

async fn run_metaconfig(experiment: &TestExperiment, args: MetaconfigArgs) {
    let stage = Arc::new(MetaconfigStage::new(
        experiment.store.clone(),
        args,
        experiment.diagnostics(),
    ));
    let jobs = stage.create_job_descriptions().await.unwrap();
    JobRunner::new(experiment.diagnostics())
        .run_stage(stage, &jobs)
        .await
        .unwrap();
}

// =============================================================================
// Metaconfig
// =============================================================================

fn metaconfig_stage(experiment: &TestExperiment) -> MetaconfigStage<Arc<FsStore>> {
    MetaconfigStage::new(
        experiment.store.clone(),
        MetaconfigArgs::default(),
        experiment.diagnostics(),
    )
}

/// Bytes of every dataset below `prefix`, keyed by name.
async fn snapshot(experiment: &TestExperiment, prefix: &str) -> Vec<(String, Vec<u8>)> {
    let store = experiment.store.as_ref();
    let pattern = regex::Regex::new(".+").unwrap();
    let mut datasets = Vec::new();
    for name in store.list(prefix, &pattern).await.unwrap() {
        let full = format!("{prefix}/{name}");
        let data = store.read(&full).await.unwrap().to_vec();
        datasets.push((full, data));
    }
    datasets
}

#[tokio::test]
async fn test_failed_run_keeps_previous_collect() {
    let experiment = two_timepoints().await;
    run_metaconfig(&experiment, MetaconfigArgs::default()).await;
    let cycles = snapshot(&experiment, "cycles").await;
    let mapper = experiment
        .store
        .read(&global_mapper_file())
        .await
        .unwrap();

    // a plane without well or channel cannot be configured
    experiment
        .add_image(1, "broken.png", &uint16_plane(4, 4, 1), &EmbeddedImage::new(4, 4))
        .await;
    let stage = Arc::new(metaconfig_stage(&experiment));
    let jobs = stage.create_job_descriptions().await.unwrap();
    let result = JobRunner::new(experiment.diagnostics())
        .run_stage(stage, &jobs)
        .await;
    assert!(matches!(result, Err(JobError::StageFailed { .. })));

    assert_eq!(snapshot(&experiment, "cycles").await, cycles);
    assert_eq!(
        experiment.store.read(&global_mapper_file()).await.unwrap(),
        mapper
    );
}

#[tokio::test]
async fn test_collect_persists_each_upload() {
    let experiment = two_timepoints().await;
    let store = experiment.store.as_ref();
    let stage = metaconfig_stage(&experiment);
    let descriptions = stage.create_job_descriptions().await.unwrap();
    write_job_descriptions(store, stage.name(), &descriptions)
        .await
        .unwrap();
    for id in [1, 2] {
        run_persisted_job(&stage, store, id).await.unwrap();
    }

    // the second upload's table is unreadable when collect reaches it
    write_text(store, &upload_metadata_file(1), "<not-ome".to_string())
        .await
        .unwrap();
    assert!(collect_persisted_jobs(&stage, store).await.is_err());

    let mapper = read_mapper(store, &global_mapper_file()).await.unwrap();
    assert_eq!(mapper.len(), 3);
    assert!(mapper
        .iter()
        .all(|entry| entry.files.iter().all(|f| f.starts_with("uploads/upload_000/"))));
    assert!(mapper
        .iter()
        .all(|entry| entry.ref_file.starts_with("cycles/cycle_000/")));
    assert!(store.exists(&cycle_metadata_file(0)).await.unwrap());
    assert!(!store.exists(&cycle_metadata_file(1)).await.unwrap());
}

#[tokio::test]
async fn test_collect_again_drops_vanished_cycles() {
    let experiment = two_timepoints().await;
    run_metaconfig(&experiment, MetaconfigArgs::default()).await;
    assert!(experiment.store.exists(&cycle_marker_file(1)).await.unwrap());

    remove_prefix(experiment.store.as_ref(), "uploads/upload_001")
        .await
        .unwrap();
    run_metaconfig(&experiment, MetaconfigArgs::default()).await;

    let loaded = Experiment::load(experiment.store.as_ref(), &experiment.diagnostics())
        .await
        .unwrap();
    assert_eq!(loaded.uploads.len(), 1);
    assert_eq!(loaded.cycles.len(), 1);
    assert!(!experiment.store.exists(&cycle_marker_file(1)).await.unwrap());
    assert!(!experiment.store.exists(&cycle_metadata_file(1)).await.unwrap());
    assert_eq!(
        read_mapper(experiment.store.as_ref(), &global_mapper_file())
            .await
            .unwrap()
            .len(),
        3
    );
}

#[tokio::test]
async fn test_uploads_reconciled_into_cycles() {
    let experiment = two_timepoints().await;
    run_metaconfig(&experiment, MetaconfigArgs::default()).await;

    let loaded = Experiment::load(experiment.store.as_ref(), &experiment.diagnostics())
        .await
        .unwrap();
    assert_eq!(loaded.uploads.len(), 2);
    assert_eq!(loaded.cycles.len(), 2);

    let cycle0 = read_metadata(experiment.store.as_ref(), &cycle_metadata_file(0))
        .await
        .unwrap();
    assert_eq!(cycle0.len(), 3);
    assert_eq!(cycle0.wells(), vec!["A01".to_string(), "B02".to_string()]);
    let names: Vec<_> = cycle0.iter().filter_map(|r| r.name.clone()).collect();
    assert_eq!(
        names,
        vec![
            "screen_t000_A01_y000_x000_c000_z000.png",
            "screen_t000_A01_y000_x001_c000_z000.png",
            "screen_t000_B02_y000_x000_c000_z000.png",
        ]
    );

    let cycle1 = read_metadata(experiment.store.as_ref(), &cycle_metadata_file(1))
        .await
        .unwrap();
    assert_eq!(cycle1.len(), 2);
    assert!(cycle1.iter().all(|r| r.tpoint == Some(1)));

    let mapper = read_mapper(experiment.store.as_ref(), &global_mapper_file())
        .await
        .unwrap();
    assert_eq!(mapper.len(), 5);
    for entry in &mapper {
        assert_eq!(entry.files.len(), 1);
        assert!(experiment.store.exists(&entry.files[0]).await.unwrap());
        assert!(entry.ref_file.starts_with("cycles/cycle_00"));
    }
}

#[tokio::test]
async fn test_collect_is_repeatable() {
    let experiment = two_timepoints().await;
    run_metaconfig(&experiment, MetaconfigArgs::default()).await;
    let first = read_mapper(experiment.store.as_ref(), &global_mapper_file())
        .await
        .unwrap();

    run_metaconfig(&experiment, MetaconfigArgs::default()).await;
    let second = read_mapper(experiment.store.as_ref(), &global_mapper_file())
        .await
        .unwrap();
    assert_eq!(first, second);
}

// =============================================================================
// Pyramid
// =============================================================================

#[tokio::test]
async fn test_pyramid_layers_per_cycle() {
    let experiment = two_timepoints().await;
    run_metaconfig(&experiment, MetaconfigArgs::default()).await;

    let stage = Arc::new(PyramidStage::new(
        experiment.store.clone(),
        PyramidArgs {
            spacing: 2,
            ..PyramidArgs::default()
        },
        experiment.diagnostics(),
    ));
    let jobs = stage.create_job_descriptions().await.unwrap();
    assert_eq!(jobs.run.len(), 2);
    JobRunner::new(experiment.diagnostics())
        .run_stage(stage.clone(), &jobs)
        .await
        .unwrap();

    let index: Vec<LayerDescription> =
        read_json(experiment.store.as_ref(), &pyramid_index_file())
            .await
            .unwrap();
    assert_eq!(index.len(), 2);
    assert_eq!((index[0].cycle, index[1].cycle), (0, 1));
    assert_eq!(index[0].channel_name, "DAPI");

    // cycle 0: A01 (8x4) and B02 in a 2x2 collage with 2 pixel spacers
    let layout = &index[0].layout;
    assert_eq!((layout.width, layout.height), (18, 10));
    assert_eq!(layout.n_levels(), 1);
    // cycle 1: A01 alone
    assert_eq!((index[1].layout.width, index[1].layout.height), (8, 4));

    let key = TileKey::new(0, 0, 0, 0);
    let on_disk = experiment.dir.path().join(tile_location(&key, 0));
    assert!(on_disk.exists(), "missing {}", on_disk.display());

    let tile = stage.tiles().get_plane(&key).await.unwrap();
    assert_eq!(tile.dimensions(), (18, 10));
    assert_eq!(tile.get_pixel(0, 0)[0], 85);
    assert_eq!(tile.get_pixel(4, 0)[0], 170);
    // spacer column
    assert_eq!(tile.get_pixel(8, 0)[0], 0);
    // B02, centered in its cell
    assert_eq!(tile.get_pixel(12, 0)[0], 255);
}

#[tokio::test]
async fn test_z_projection_end_to_end() {
    let experiment = TestExperiment::new("stack").await;
    for (z, value) in [(0, 100), (1, 250)] {
        let embedded = EmbeddedImage::complete(4, 4, "C03", "GFP", 0)
            .zplane(z)
            .site(0)
            .stage(0.0, 0.0);
        experiment
            .add_image(0, &format!("z{z}.png"), &uint16_plane(4, 4, value), &embedded)
            .await;
    }
    run_metaconfig(
        &experiment,
        MetaconfigArgs {
            z_projection: true,
            ..MetaconfigArgs::default()
        },
    )
    .await;

    let cycle = read_metadata(experiment.store.as_ref(), &cycle_metadata_file(0))
        .await
        .unwrap();
    assert_eq!(cycle.len(), 1);
    let mapper = read_mapper(experiment.store.as_ref(), &global_mapper_file())
        .await
        .unwrap();
    assert_eq!(mapper[0].files.len(), 2);

    let stage = Arc::new(PyramidStage::new(
        experiment.store.clone(),
        PyramidArgs {
            clip_value: Some(250.0),
            ..PyramidArgs::default()
        },
        experiment.diagnostics(),
    ));
    let jobs = stage.create_job_descriptions().await.unwrap();
    JobRunner::new(experiment.diagnostics())
        .run_stage(stage.clone(), &jobs)
        .await
        .unwrap();

    // maximum intensity projection of both planes
    let tile = stage.tiles().get_plane(&TileKey::new(0, 0, 0, 0)).await.unwrap();
    assert_eq!(tile.get_pixel(1, 1)[0], 255);
}

// =============================================================================
// Persisted Jobs
// =============================================================================

#[tokio::test]
async fn test_persisted_jobs_run_individually() {
    let experiment = two_timepoints().await;
    let store = experiment.store.as_ref();
    let stage = MetaconfigStage::new(
        experiment.store.clone(),
        MetaconfigArgs::default(),
        experiment.diagnostics(),
    );

    let descriptions = stage.create_job_descriptions().await.unwrap();
    write_job_descriptions(store, stage.name(), &descriptions)
        .await
        .unwrap();
    assert!(store.exists("jobs/metaconfig/run_000001.json").await.unwrap());
    assert!(store.exists("jobs/metaconfig/collect.json").await.unwrap());

    let reread = read_job_descriptions::<MetaconfigJobParams, NoParams, _>(store, stage.name())
        .await
        .unwrap();
    assert_eq!(reread.run.len(), 2);
    reread.validate().unwrap();

    // jobs run out of order, as independent processes would
    for id in [2, 1] {
        run_persisted_job(&stage, store, id).await.unwrap();
    }
    collect_persisted_jobs(&stage, store).await.unwrap();

    assert!(store.exists(&cycle_metadata_file(1)).await.unwrap());
    assert!(!store.exists(&layer_metadata_file(0)).await.unwrap());
}
