//! Metaconfig stage tests with vendor side files.
//!
//! Tests verify:
//! - CellVoyager measurement files override embedded metadata
//! - VisiView uploads need a stitch layout when stage positions are absent
//! - Side files of the wrong format are rejected before any job runs

use std::sync::Arc;

use tm_pipeline::error::{JobError, MetadataError};
use tm_pipeline::experiment::{
    cycle_metadata_file, global_mapper_file, upload_image_file, Experiment,
};
use tm_pipeline::jobs::{JobRunner, Stage};
use tm_pipeline::metaconfig::{MetaconfigArgs, MetaconfigStage};
use tm_pipeline::metadata::{
    read_mapper, read_metadata, GridPosition, MajorAxis, MetadataFormat, StitchLayout, Traversal,
};
use tm_pipeline::store::FsStore;

use super::test_utils::{gradient_plane, uint16_plane, EmbeddedImage, TestExperiment};

const MLF: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<bts:MeasurementData xmlns:bts="http://www.yokogawa.co.jp/BTS/BTSSchema/1.0">
  <bts:MeasurementRecord bts:Type="IMG" bts:Row="2" bts:Column="3" bts:FieldIndex="1"
      bts:TimePoint="1" bts:ZIndex="1" bts:Ch="1" bts:X="0" bts:Y="0">W0001F0001T0001Z001C1.png</bts:MeasurementRecord>
  <bts:MeasurementRecord bts:Type="IMG" bts:Row="2" bts:Column="3" bts:FieldIndex="2"
      bts:TimePoint="1" bts:ZIndex="1" bts:Ch="1" bts:X="100" bts:Y="0">W0001F0002T0001Z001C1.png</bts:MeasurementRecord>
  <bts:MeasurementRecord bts:Type="IMG" bts:Row="2" bts:Column="3" bts:FieldIndex="1"
      bts:TimePoint="2" bts:ZIndex="1" bts:Ch="1" bts:X="0" bts:Y="0">W0001F0001T0002Z001C1.png</bts:MeasurementRecord>
</bts:MeasurementData>"#;

const ND: &str = "\"NDInfoFile\", Version 1.0\n\
                  \"DoTimelapse\", FALSE\n\
                  \"DoZSeries\", FALSE\n\
                  \"NWavelengths\", 1\n\
                  \"WaveName1\", \"GFP\"\n\
                  \"EndFile\"\n";

fn stage(experiment: &TestExperiment, args: MetaconfigArgs) -> Arc<MetaconfigStage<Arc<FsStore>>> {
    Arc::new(MetaconfigStage::new(
        experiment.store.clone(),
        args,
        experiment.diagnostics(),
    ))
}

// =============================================================================
// CellVoyager
// =============================================================================

#[tokio::test]
async fn test_cellvoyager_upload() {
    let experiment = TestExperiment::new("yokogawa").await;
    for file in [
        "W0001F0001T0001Z001C1.png",
        "W0001F0002T0001Z001C1.png",
        "W0001F0001T0002Z001C1.png",
    ] {
        // embedded metadata carries pixel dimensions only
        experiment
            .add_image(0, file, &gradient_plane(6, 4), &EmbeddedImage::new(6, 4))
            .await;
    }
    experiment.add_side_file(0, "MeasurementData.mlf", MLF).await;

    let stage = stage(
        &experiment,
        MetaconfigArgs {
            format: MetadataFormat::CellVoyager,
            ..MetaconfigArgs::default()
        },
    );
    let jobs = stage.create_job_descriptions().await.unwrap();
    assert_eq!(jobs.run.len(), 1);
    assert_eq!(jobs.run[0].inputs["additional_files"].len(), 1);
    JobRunner::new(experiment.diagnostics())
        .run_stage(stage, &jobs)
        .await
        .unwrap();

    let loaded = Experiment::load(experiment.store.as_ref(), &experiment.diagnostics())
        .await
        .unwrap();
    assert_eq!(loaded.cycles.len(), 2);

    let cycle0 = read_metadata(experiment.store.as_ref(), &cycle_metadata_file(0))
        .await
        .unwrap();
    assert_eq!(cycle0.len(), 2);
    assert!(cycle0.iter().all(|r| r.well.as_deref() == Some("B03")));
    assert!(cycle0.iter().all(|r| r.channel_name.as_deref() == Some("1")));
    let grid: Vec<_> = cycle0.iter().filter_map(|r| r.grid).collect();
    assert_eq!(grid, vec![GridPosition::new(0, 0), GridPosition::new(0, 1)]);

    let cycle1 = read_metadata(experiment.store.as_ref(), &cycle_metadata_file(1))
        .await
        .unwrap();
    assert_eq!(cycle1.len(), 1);
    assert_eq!(
        cycle1.images[0].name.as_deref(),
        Some("yokogawa_t001_B03_y000_x000_c000_z000.png")
    );

    let mapper = read_mapper(experiment.store.as_ref(), &global_mapper_file())
        .await
        .unwrap();
    let entry = mapper
        .iter()
        .find(|e| e.ref_file.starts_with("cycles/cycle_001"))
        .unwrap();
    assert_eq!(
        entry.files,
        vec![upload_image_file(0, "W0001F0001T0002Z001C1.png")]
    );
}

#[tokio::test]
async fn test_side_file_of_other_format_rejected() {
    let experiment = TestExperiment::new("mixed").await;
    experiment
        .add_image(
            0,
            "a.png",
            &uint16_plane(4, 4, 1),
            &EmbeddedImage::complete(4, 4, "A01", "DAPI", 0).stage(0.0, 0.0),
        )
        .await;
    experiment.add_side_file(0, "scan.nd", ND).await;

    let stage = stage(
        &experiment,
        MetaconfigArgs {
            format: MetadataFormat::CellVoyager,
            ..MetaconfigArgs::default()
        },
    );
    assert!(matches!(
        stage.create_job_descriptions().await,
        Err(JobError::NotSupported(_))
    ));
}

// =============================================================================
// VisiView
// =============================================================================

async fn visiview_experiment() -> TestExperiment {
    let experiment = TestExperiment::new("visitron").await;
    for (site, value) in [(1, 10), (2, 20)] {
        experiment
            .add_image(
                0,
                &format!("scan_w1GFP_s{site}.png"),
                &uint16_plane(4, 4, value),
                &EmbeddedImage::new(4, 4),
            )
            .await;
    }
    experiment.add_side_file(0, "scan.nd", ND).await;
    experiment
}

#[tokio::test]
async fn test_visiview_requires_layout() {
    let experiment = visiview_experiment().await;
    let stage = stage(
        &experiment,
        MetaconfigArgs {
            format: MetadataFormat::VisiView,
            ..MetaconfigArgs::default()
        },
    );
    let jobs = stage.create_job_descriptions().await.unwrap();
    let result = stage.run_job(&jobs.run[0]).await;
    assert!(matches!(
        result,
        Err(JobError::Metadata(MetadataError::StagePositions(_)))
    ));
}

#[tokio::test]
async fn test_visiview_with_layout() {
    let experiment = visiview_experiment().await;
    let layout = StitchLayout::new(1, 2, MajorAxis::Row, Traversal::Raster).unwrap();
    let stage = stage(
        &experiment,
        MetaconfigArgs {
            format: MetadataFormat::VisiView,
            stitch_layout: Some(layout),
            ..MetaconfigArgs::default()
        },
    );
    let jobs = stage.create_job_descriptions().await.unwrap();
    JobRunner::new(experiment.diagnostics())
        .run_stage(stage, &jobs)
        .await
        .unwrap();

    let cycle = read_metadata(experiment.store.as_ref(), &cycle_metadata_file(0))
        .await
        .unwrap();
    assert_eq!(cycle.len(), 2);
    assert!(cycle.iter().all(|r| r.well.as_deref() == Some("A01")));
    assert!(cycle.iter().all(|r| r.channel_name.as_deref() == Some("GFP")));
    let grid: Vec<_> = cycle.iter().filter_map(|r| r.grid).collect();
    assert_eq!(grid, vec![GridPosition::new(0, 0), GridPosition::new(0, 1)]);
}

#[tokio::test]
async fn test_custom_pattern_fills_missing_fields() {
    let experiment = TestExperiment::new("named").await;
    for (well, channel) in [("A01", "DAPI"), ("A02", "GFP")] {
        experiment
            .add_image(
                0,
                &format!("plate_{well}_{channel}_t0_z0.png"),
                &uint16_plane(4, 4, 5),
                &EmbeddedImage::new(4, 4).stage(0.0, 0.0),
            )
            .await;
    }

    let without = stage(&experiment, MetaconfigArgs::default());
    let jobs = without.create_job_descriptions().await.unwrap();
    assert!(matches!(
        without.run_job(&jobs.run[0]).await,
        Err(JobError::Metadata(MetadataError::Missing(_)))
    ));

    let with = stage(
        &experiment,
        MetaconfigArgs {
            regex: Some(r"_(?P<w>[A-Z]\d{2})_(?P<c>[A-Za-z]+)_t(?P<t>\d+)_z(?P<z>\d+)\.".to_string()),
            ..MetaconfigArgs::default()
        },
    );
    let jobs = with.create_job_descriptions().await.unwrap();
    JobRunner::new(experiment.diagnostics())
        .run_stage(with, &jobs)
        .await
        .unwrap();

    let cycle = read_metadata(experiment.store.as_ref(), &cycle_metadata_file(0))
        .await
        .unwrap();
    assert_eq!(cycle.wells(), vec!["A01".to_string(), "A02".to_string()]);
    let channels: Vec<_> = cycle.iter().filter_map(|r| r.channel).collect();
    assert_eq!(channels, vec![0, 1]);
}
