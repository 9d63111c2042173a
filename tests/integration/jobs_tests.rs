//! Run/collect execution of a store-backed stage.
//!
//! The stage under test squares numbers: each run job writes one result
//! dataset, the collect job sums them.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use tm_pipeline::diagnostics::Diagnostics;
use tm_pipeline::error::{JobError, StoreError};
use tm_pipeline::jobs::{
    collect_persisted_jobs, done_marker_file, read_job_descriptions, run_persisted_job,
    write_job_descriptions, JobDescription, JobDescriptions, JobRunner, NoParams, Stage,
};
use tm_pipeline::store::{read_text, write_text, DatasetStore, MemoryStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SquareParams {
    value: u64,
}

struct SquareStage {
    store: MemoryStore,
    values: Vec<u64>,
}

fn result_file(id: usize) -> String {
    format!("results/square_{id:03}.txt")
}

#[async_trait]
impl Stage for SquareStage {
    type RunParams = SquareParams;
    type CollectParams = NoParams;

    fn name(&self) -> &'static str {
        "square"
    }

    async fn create_job_descriptions(
        &self,
    ) -> Result<JobDescriptions<SquareParams, NoParams>, JobError> {
        let run: Vec<_> = self
            .values
            .iter()
            .enumerate()
            .map(|(i, &value)| {
                JobDescription::new(i + 1, SquareParams { value })
                    .with_output("results", vec![result_file(i + 1)])
            })
            .collect();
        let collect = JobDescription::new(0, NoParams {})
            .with_input("results", run.iter().map(|job| result_file(job.id)).collect())
            .with_output("sum", vec!["results/sum.txt".to_string()]);
        Ok(JobDescriptions { run, collect })
    }

    async fn run_job(&self, job: &JobDescription<SquareParams>) -> Result<(), JobError> {
        if job.params.value == 13 {
            return Err(JobError::InvalidDescription("unlucky value".to_string()));
        }
        let square = job.params.value * job.params.value;
        write_text(&self.store, &result_file(job.id), square.to_string()).await?;
        Ok(())
    }

    async fn collect_job_output(&self, job: &JobDescription<NoParams>) -> Result<(), JobError> {
        let mut sum = 0u64;
        for file in job.input_files() {
            let text = read_text(&self.store, file).await?;
            sum += text
                .parse::<u64>()
                .map_err(|e| StoreError::InvalidName(e.to_string()))?;
        }
        self.store
            .write("results/sum.txt", Bytes::from(sum.to_string()))
            .await?;
        Ok(())
    }
}

fn stage(values: &[u64]) -> (MemoryStore, Arc<SquareStage>) {
    let store = MemoryStore::new();
    let stage = Arc::new(SquareStage {
        store: store.clone(),
        values: values.to_vec(),
    });
    (store, stage)
}

#[tokio::test]
async fn test_persisted_descriptions_submit() {
    let (store, stage) = stage(&[1, 2, 3, 4, 5, 6, 7]);
    let descriptions = stage.create_job_descriptions().await.unwrap();
    write_job_descriptions(&store, stage.name(), &descriptions)
        .await
        .unwrap();

    let reread = read_job_descriptions::<SquareParams, NoParams, _>(&store, stage.name())
        .await
        .unwrap();
    assert_eq!(reread, descriptions);

    JobRunner::new(Diagnostics::silent())
        .with_max_parallel(3)
        .run_stage(stage, &reread)
        .await
        .unwrap();
    assert_eq!(read_text(&store, "results/sum.txt").await.unwrap(), "140");
}

#[tokio::test]
async fn test_failed_run_skips_collect() {
    let (store, stage) = stage(&[2, 13, 3]);
    let descriptions = stage.create_job_descriptions().await.unwrap();

    let result = JobRunner::new(Diagnostics::silent())
        .with_max_parallel(1)
        .run_stage(stage, &descriptions)
        .await;
    match result {
        Err(JobError::StageFailed { stage, failures }) => {
            assert_eq!(stage, "square");
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].0, 2);
        }
        other => panic!("expected stage failure, got {other:?}"),
    }
    assert!(!store.exists("results/sum.txt").await.unwrap());
}

#[tokio::test]
async fn test_shrinking_partition_removes_stale_descriptions() {
    let (store, large) = stage(&[1, 2, 3]);
    let descriptions = large.create_job_descriptions().await.unwrap();
    write_job_descriptions(&store, large.name(), &descriptions)
        .await
        .unwrap();

    let small = SquareStage {
        store: store.clone(),
        values: vec![9],
    };
    let descriptions = small.create_job_descriptions().await.unwrap();
    write_job_descriptions(&store, small.name(), &descriptions)
        .await
        .unwrap();

    let reread = read_job_descriptions::<SquareParams, NoParams, _>(&store, small.name())
        .await
        .unwrap();
    assert_eq!(reread.run.len(), 1);
    assert_eq!(reread.run[0].params.value, 9);
    reread.validate().unwrap();
}

#[tokio::test]
async fn test_invalid_partition_runs_nothing() {
    let (store, stage) = stage(&[1, 2]);
    let mut descriptions = stage.create_job_descriptions().await.unwrap();
    descriptions.collect.inputs.clear();

    let result = JobRunner::new(Diagnostics::silent())
        .run_stage(stage, &descriptions)
        .await;
    assert!(matches!(result, Err(JobError::InvalidDescription(_))));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_collect_waits_for_every_run_job() {
    let (store, stage) = stage(&[1, 2, 3]);
    let descriptions = stage.create_job_descriptions().await.unwrap();
    write_job_descriptions(&store, stage.name(), &descriptions)
        .await
        .unwrap();

    for id in [1, 2] {
        run_persisted_job(stage.as_ref(), &store, id).await.unwrap();
    }
    assert!(store.exists(&done_marker_file("square", 2)).await.unwrap());

    let result = collect_persisted_jobs(stage.as_ref(), &store).await;
    match result {
        Err(JobError::Incomplete { stage, jobs }) => {
            assert_eq!(stage, "square");
            assert_eq!(jobs, vec![3]);
        }
        other => panic!("expected incomplete stage, got {other:?}"),
    }
    assert!(!store.exists("results/sum.txt").await.unwrap());

    run_persisted_job(stage.as_ref(), &store, 3).await.unwrap();
    collect_persisted_jobs(stage.as_ref(), &store).await.unwrap();
    assert_eq!(read_text(&store, "results/sum.txt").await.unwrap(), "14");
}

#[tokio::test]
async fn test_failed_rerun_blocks_collect() {
    let (store, stage) = stage(&[4, 13]);
    let descriptions = stage.create_job_descriptions().await.unwrap();
    write_job_descriptions(&store, stage.name(), &descriptions)
        .await
        .unwrap();

    run_persisted_job(stage.as_ref(), &store, 1).await.unwrap();
    assert!(run_persisted_job(stage.as_ref(), &store, 2).await.is_err());
    assert!(!store.exists(&done_marker_file("square", 2)).await.unwrap());

    let result = collect_persisted_jobs(stage.as_ref(), &store).await;
    assert!(matches!(result, Err(JobError::Incomplete { ref jobs, .. }) if jobs == &vec![2]));
    assert!(!store.exists("results/sum.txt").await.unwrap());
}

#[tokio::test]
async fn test_outputs_of_earlier_partition_are_not_collected() {
    let (store, stage) = stage(&[1, 2]);
    let descriptions = stage.create_job_descriptions().await.unwrap();
    write_job_descriptions(&store, stage.name(), &descriptions)
        .await
        .unwrap();
    for id in [1, 2] {
        run_persisted_job(stage.as_ref(), &store, id).await.unwrap();
    }

    // a new init leaves the old result datasets in place but no markers
    write_job_descriptions(&store, stage.name(), &descriptions)
        .await
        .unwrap();
    assert!(store.exists("results/square_001.txt").await.unwrap());

    let result = collect_persisted_jobs(stage.as_ref(), &store).await;
    assert!(matches!(result, Err(JobError::Incomplete { ref jobs, .. }) if jobs == &vec![1, 2]));
    assert!(!store.exists("results/sum.txt").await.unwrap());
}
