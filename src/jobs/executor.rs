//! In-process execution of a stage's job partition.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info};

use super::{JobDescription, JobDescriptions, Stage};
use crate::diagnostics::Diagnostics;
use crate::error::JobError;

/// Default number of run jobs executing at once.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Runs the jobs of a stage as tokio tasks.
///
/// Run jobs execute in parallel up to `max_parallel`. Once any run job
/// fails no further run jobs are started, and the collect job is never
/// scheduled unless every run job succeeded.
#[derive(Debug, Clone)]
pub struct JobRunner {
    max_parallel: usize,
    diagnostics: Diagnostics,
}

impl JobRunner {
    pub fn new(diagnostics: Diagnostics) -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            diagnostics,
        }
    }

    /// Limit the number of concurrently running jobs (at least one).
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Validate the partition, run every run job, then the collect job.
    pub async fn run_stage<St: Stage>(
        &self,
        stage: Arc<St>,
        descriptions: &JobDescriptions<St::RunParams, St::CollectParams>,
    ) -> Result<(), JobError> {
        descriptions.validate()?;
        let started = Instant::now();

        self.run_jobs(stage.clone(), descriptions.run.clone()).await?;

        self.diagnostics
            .in_scope(|| info!(stage = stage.name(), "Collecting job outputs"));
        stage.collect_job_output(&descriptions.collect).await?;

        self.diagnostics.in_scope(|| {
            info!(
                stage = stage.name(),
                jobs = descriptions.run.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Stage complete"
            )
        });
        Ok(())
    }

    /// Run the given run jobs, failing fast.
    ///
    /// Returns [`JobError::StageFailed`] listing every job that failed.
    pub async fn run_jobs<St: Stage>(
        &self,
        stage: Arc<St>,
        jobs: Vec<JobDescription<St::RunParams>>,
    ) -> Result<(), JobError> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let failed = Arc::new(AtomicBool::new(false));
        let mut pending = JoinSet::new();

        self.diagnostics.in_scope(|| {
            info!(
                stage = stage.name(),
                jobs = jobs.len(),
                max_parallel = self.max_parallel,
                "Running jobs"
            )
        });

        let mut failures: Vec<(usize, String)> = Vec::new();
        // Job ids by task, for tasks that panicked or were aborted
        let mut task_jobs: HashMap<Id, usize> = HashMap::new();
        for job in jobs {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if failed.load(Ordering::SeqCst) || !failures.is_empty() {
                break;
            }

            let id = job.id;
            let task_stage = stage.clone();
            let failed = failed.clone();
            let diagnostics = self.diagnostics.clone();
            let handle = pending.spawn(async move {
                diagnostics.in_scope(|| debug!(stage = task_stage.name(), job = id, "Starting job"));
                let result = task_stage.run_job(&job).await;
                if result.is_err() {
                    failed.store(true, Ordering::SeqCst);
                }
                drop(permit);
                (id, result)
            });
            task_jobs.insert(handle.id(), id);

            // Reap finished jobs so failures are seen before the next launch
            while let Some(joined) = pending.try_join_next() {
                self.record(stage.name(), joined, &task_jobs, &mut failures);
            }
        }

        while let Some(joined) = pending.join_next().await {
            self.record(stage.name(), joined, &task_jobs, &mut failures);
        }

        if failures.is_empty() {
            return Ok(());
        }
        failures.sort_by_key(|(id, _)| *id);
        Err(JobError::StageFailed {
            stage: stage.name().to_string(),
            failures,
        })
    }

    fn record(
        &self,
        stage: &str,
        joined: Result<(usize, Result<(), JobError>), JoinError>,
        task_jobs: &HashMap<Id, usize>,
        failures: &mut Vec<(usize, String)>,
    ) {
        match joined {
            Ok((id, Ok(()))) => {
                self.diagnostics
                    .in_scope(|| debug!(stage, job = id, "Job finished"));
            }
            Ok((id, Err(e))) => {
                self.diagnostics
                    .in_scope(|| error!(stage, job = id, error = %e, "Job failed"));
                failures.push((id, e.to_string()));
            }
            Err(e) => {
                let Some(&id) = task_jobs.get(&e.id()) else {
                    self.diagnostics
                        .in_scope(|| error!(stage, error = %e, "Unknown job task aborted"));
                    return;
                };
                self.diagnostics
                    .in_scope(|| error!(stage, job = id, error = %e, "Job task aborted"));
                failures.push((id, e.to_string()));
            }
        }
    }
}
