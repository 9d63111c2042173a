//! TM Pipeline - run/collect execution of the pipeline stages.
//!
//! This binary wires the CLI to the stages, storing everything in the
//! experiment directory.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tm_pipeline::{
    config::{Cli, Command, StageName},
    diagnostics::Diagnostics,
    error::JobError,
    jobs::{
        collect_persisted_jobs, read_job_descriptions, run_persisted_job, write_job_descriptions,
        JobRunner, Stage,
    },
    metaconfig::{MetaconfigArgs, MetaconfigStage},
    pyramid::{PyramidArgs, PyramidStage},
    store::{DatasetStore, FsStore},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = validate(&cli.command) {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let store = Arc::new(FsStore::new(&cli.experiment_dir));
    let diagnostics = Diagnostics::current();
    info!(
        experiment = store.identifier(),
        stage = cli.command.stage().name(),
        "Starting"
    );

    let result = match cli.command.stage() {
        StageName::Metaconfig => {
            let args = match &cli.command {
                Command::Init(config) => config.metaconfig_args(),
                _ => MetaconfigArgs::default(),
            };
            let stage = MetaconfigStage::new(store.clone(), args, diagnostics.clone());
            execute(Arc::new(stage), store.as_ref(), &cli.command, diagnostics).await
        }
        StageName::Pyramid => {
            let args = match &cli.command {
                Command::Init(config) => config.pyramid_args(),
                _ => PyramidArgs::default(),
            };
            let stage = PyramidStage::new(store.clone(), args, diagnostics.clone());
            execute(Arc::new(stage), store.as_ref(), &cli.command, diagnostics).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn validate(command: &Command) -> Result<(), String> {
    match command {
        Command::Init(config) => config.validate(),
        Command::Run(config) => config.validate(),
        Command::Collect(_) => Ok(()),
        Command::Submit(config) => config.validate(),
    }
}

/// Execute `command` against `stage`, reading and writing job descriptions
/// in `store`.
async fn execute<St: Stage>(
    stage: Arc<St>,
    store: &FsStore,
    command: &Command,
    diagnostics: Diagnostics,
) -> Result<(), JobError> {
    match command {
        Command::Init(_) => {
            let descriptions = stage.create_job_descriptions().await?;
            descriptions.validate()?;
            write_job_descriptions(store, stage.name(), &descriptions).await?;
            info!(
                stage = stage.name(),
                jobs = descriptions.run.len(),
                "Wrote job descriptions"
            );
        }
        Command::Run(config) => {
            run_persisted_job(stage.as_ref(), store, config.job).await?;
            info!(stage = stage.name(), job = config.job, "Run job finished");
        }
        Command::Collect(_) => {
            collect_persisted_jobs(stage.as_ref(), store).await?;
            info!(stage = stage.name(), "Collect job finished");
        }
        Command::Submit(config) => {
            let descriptions = read_job_descriptions(store, stage.name()).await?;
            JobRunner::new(diagnostics)
                .with_max_parallel(config.max_parallel)
                .run_stage(stage, &descriptions)
                .await?;
        }
    }
    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "tm_pipeline=debug"
    } else {
        "tm_pipeline=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
