//! Run/collect job partitioning.
//!
//! Every pipeline stage splits its work into independent *run* jobs plus one
//! *collect* job that merges their outputs:
//!
//! ```text
//!            create_job_descriptions
//!                     │
//!       ┌─────────────┼─────────────┐
//!       ▼             ▼             ▼
//!   run #1        run #2   ...  run #n        parallel, disjoint outputs
//!       │             │             │
//!       └─────────────┼─────────────┘
//!                     ▼
//!               collect (#0)                  barrier: only after every
//!                                             run job succeeded
//! ```
//!
//! Descriptions are plain JSON documents, so a job can be executed in a
//! separate process from its description alone:
//!
//! ```text
//! jobs/<stage>/run_000001.json
//! jobs/<stage>/run_000002.json
//! jobs/<stage>/collect.json
//! jobs/<stage>/done_000001.json              written when run #1 succeeded
//! ```
//!
//! Jobs executed one at a time ([`run_persisted_job`]) leave a completion
//! marker. [`collect_persisted_jobs`] refuses to collect until every run job
//! has its marker and its declared outputs, so nothing is merged from a
//! partial run.

mod executor;

pub use executor::{JobRunner, DEFAULT_MAX_PARALLEL};

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{JobError, StoreError};
use crate::store::{join_name, read_json, write_json, DatasetStore};

/// Dataset prefix of all job descriptions.
pub const JOBS_PREFIX: &str = "jobs";

/// Id of the collect job; run jobs are numbered from one.
pub const COLLECT_JOB_ID: usize = 0;

/// Named lists of dataset names.
pub type JobFiles = BTreeMap<String, Vec<String>>;

/// Parameters of a job that needs nothing beyond its inputs and outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoParams {}

// =============================================================================
// Descriptions
// =============================================================================

/// One unit of work.
///
/// Stage-specific parameters are flattened into the same JSON object as
/// the id and the input/output lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription<P> {
    pub id: usize,

    #[serde(default)]
    pub inputs: JobFiles,

    #[serde(default)]
    pub outputs: JobFiles,

    #[serde(flatten)]
    pub params: P,
}

impl<P> JobDescription<P> {
    pub fn new(id: usize, params: P) -> Self {
        Self {
            id,
            inputs: JobFiles::new(),
            outputs: JobFiles::new(),
            params,
        }
    }

    pub fn with_input(mut self, name: &str, files: Vec<String>) -> Self {
        self.inputs.insert(name.to_string(), files);
        self
    }

    pub fn with_output(mut self, name: &str, files: Vec<String>) -> Self {
        self.outputs.insert(name.to_string(), files);
        self
    }

    /// All input dataset names, deduplicated.
    pub fn input_files(&self) -> BTreeSet<&str> {
        self.inputs.values().flatten().map(String::as_str).collect()
    }

    /// All output dataset names, deduplicated.
    pub fn output_files(&self) -> BTreeSet<&str> {
        self.outputs.values().flatten().map(String::as_str).collect()
    }
}

/// The full partition of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptions<R, C> {
    pub run: Vec<JobDescription<R>>,
    pub collect: JobDescription<C>,
}

impl<R, C> JobDescriptions<R, C> {
    /// Check the run/collect contract.
    ///
    /// Run ids are unique and non-zero, the collect id is zero, no two run
    /// jobs write the same dataset, and the collect inputs are exactly the
    /// union of the run outputs.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.collect.id != COLLECT_JOB_ID {
            return Err(JobError::InvalidDescription(format!(
                "collect job must have id {COLLECT_JOB_ID}, got {}",
                self.collect.id
            )));
        }

        let mut ids = BTreeSet::new();
        let mut produced: BTreeMap<&str, usize> = BTreeMap::new();
        for job in &self.run {
            if job.id == COLLECT_JOB_ID {
                return Err(JobError::InvalidDescription(format!(
                    "run job ids start at 1, got {COLLECT_JOB_ID}"
                )));
            }
            if !ids.insert(job.id) {
                return Err(JobError::InvalidDescription(format!(
                    "duplicate run job id {}",
                    job.id
                )));
            }
            for output in job.output_files() {
                if let Some(other) = produced.insert(output, job.id) {
                    return Err(JobError::InvalidDescription(format!(
                        "run jobs #{other} and #{} both write '{output}'",
                        job.id
                    )));
                }
            }
        }

        let produced: BTreeSet<&str> = produced.into_keys().collect();
        let consumed = self.collect.input_files();
        if produced != consumed {
            let missing: Vec<_> = produced.difference(&consumed).collect();
            let unknown: Vec<_> = consumed.difference(&produced).collect();
            return Err(JobError::InvalidDescription(format!(
                "collect inputs do not match run outputs (not collected: {missing:?}, not produced: {unknown:?})"
            )));
        }
        Ok(())
    }

    pub fn run_job(&self, id: usize) -> Option<&JobDescription<R>> {
        self.run.iter().find(|job| job.id == id)
    }
}

// =============================================================================
// Stage
// =============================================================================

/// A pipeline step expressed as run jobs plus one collect job.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type RunParams: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type CollectParams: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Name used for logging and as the job description directory.
    fn name(&self) -> &'static str;

    /// Partition the stage's work.
    async fn create_job_descriptions(
        &self,
    ) -> Result<JobDescriptions<Self::RunParams, Self::CollectParams>, JobError>;

    /// Execute one run job. Must write only the job's declared outputs.
    async fn run_job(&self, job: &JobDescription<Self::RunParams>) -> Result<(), JobError>;

    /// Merge the outputs of all run jobs.
    async fn collect_job_output(
        &self,
        job: &JobDescription<Self::CollectParams>,
    ) -> Result<(), JobError>;
}

// =============================================================================
// Persistence
// =============================================================================

pub fn jobs_location(stage: &str) -> String {
    join_name(&[JOBS_PREFIX, stage])
}

pub fn run_description_file(stage: &str, id: usize) -> String {
    join_name(&[&jobs_location(stage), &format!("run_{id:06}.json")])
}

pub fn collect_description_file(stage: &str) -> String {
    join_name(&[&jobs_location(stage), "collect.json"])
}

/// Completion marker of a run job.
pub fn done_marker_file(stage: &str, id: usize) -> String {
    join_name(&[&jobs_location(stage), &format!("done_{id:06}.json")])
}

/// Remove every run description and completion marker of `stage` that is
/// not in `keep`.
async fn remove_job_files<S: DatasetStore + ?Sized>(
    store: &S,
    stage: &str,
    keep: &BTreeSet<String>,
) -> Result<(), JobError> {
    let pattern = Regex::new(r"(run|done)_\d{6}\.json")
        .map_err(|e| StoreError::InvalidName(e.to_string()))?;
    for stale in store.list(&jobs_location(stage), &pattern).await? {
        if !keep.contains(&stale) {
            store
                .remove(&join_name(&[&jobs_location(stage), &stale]))
                .await?;
        }
    }
    Ok(())
}

/// Persist all descriptions of a stage, removing run descriptions left over
/// from an earlier, larger partition.
///
/// Completion markers of the previous partition are discarded.
pub async fn write_job_descriptions<R, C, S>(
    store: &S,
    stage: &str,
    descriptions: &JobDescriptions<R, C>,
) -> Result<(), JobError>
where
    R: Serialize + Sync,
    C: Serialize + Sync,
    S: DatasetStore + ?Sized,
{
    let current: BTreeSet<String> = descriptions
        .run
        .iter()
        .map(|job| format!("run_{:06}.json", job.id))
        .collect();
    remove_job_files(store, stage, &current).await?;

    for job in &descriptions.run {
        write_json(store, &run_description_file(stage, job.id), job).await?;
    }
    write_json(store, &collect_description_file(stage), &descriptions.collect).await?;
    Ok(())
}

pub async fn read_run_description<P, S>(
    store: &S,
    stage: &str,
    id: usize,
) -> Result<JobDescription<P>, JobError>
where
    P: DeserializeOwned,
    S: DatasetStore + ?Sized,
{
    Ok(read_json(store, &run_description_file(stage, id)).await?)
}

pub async fn read_collect_description<P, S>(
    store: &S,
    stage: &str,
) -> Result<JobDescription<P>, JobError>
where
    P: DeserializeOwned,
    S: DatasetStore + ?Sized,
{
    Ok(read_json(store, &collect_description_file(stage)).await?)
}

/// Read back every persisted description of a stage.
pub async fn read_job_descriptions<R, C, S>(
    store: &S,
    stage: &str,
) -> Result<JobDescriptions<R, C>, JobError>
where
    R: DeserializeOwned,
    C: DeserializeOwned,
    S: DatasetStore + ?Sized,
{
    let pattern = Regex::new(r"run_\d{6}\.json")
        .map_err(|e| StoreError::InvalidName(e.to_string()))?;
    let mut run = Vec::new();
    for name in store.list(&jobs_location(stage), &pattern).await? {
        run.push(read_json(store, &join_name(&[&jobs_location(stage), &name])).await?);
    }
    let collect = read_collect_description(store, stage).await?;
    Ok(JobDescriptions { run, collect })
}

// =============================================================================
// Persisted Execution
// =============================================================================

/// Execute one persisted run job and mark it complete.
///
/// The marker is removed before the job starts, so a failed rerun leaves the
/// job incomplete.
pub async fn run_persisted_job<St, S>(stage: &St, store: &S, id: usize) -> Result<(), JobError>
where
    St: Stage,
    S: DatasetStore + ?Sized,
{
    let job = read_run_description::<St::RunParams, S>(store, stage.name(), id).await?;
    let marker = done_marker_file(stage.name(), id);
    store.remove(&marker).await?;
    stage.run_job(&job).await?;
    write_json(store, &marker, &job.id).await?;
    Ok(())
}

/// Run the persisted collect job once every persisted run job is complete.
///
/// A run job is complete when its marker and all of its declared outputs
/// exist. Otherwise [`JobError::Incomplete`] is returned before the collect
/// job touches the store.
pub async fn collect_persisted_jobs<St, S>(stage: &St, store: &S) -> Result<(), JobError>
where
    St: Stage,
    S: DatasetStore + ?Sized,
{
    let descriptions =
        read_job_descriptions::<St::RunParams, St::CollectParams, S>(store, stage.name()).await?;
    descriptions.validate()?;

    let mut incomplete = Vec::new();
    for job in &descriptions.run {
        if !job_complete(store, stage.name(), job).await? {
            incomplete.push(job.id);
        }
    }
    if !incomplete.is_empty() {
        return Err(JobError::Incomplete {
            stage: stage.name().to_string(),
            jobs: incomplete,
        });
    }

    stage.collect_job_output(&descriptions.collect).await
}

async fn job_complete<P, S>(store: &S, stage: &str, job: &JobDescription<P>) -> Result<bool, JobError>
where
    S: DatasetStore + ?Sized,
{
    if !store.exists(&done_marker_file(stage, job.id)).await? {
        return Ok(false);
    }
    for output in job.output_files() {
        if !store.exists(output).await? {
            return Ok(false);
        }
    }
    Ok(true)
}
