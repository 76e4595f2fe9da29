//! Top-level driver: validates the setup, indexes metadata and runs the
//! requested datasets.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use snafu::prelude::*;
use tracing::info;

use crate::config::{Cli, Config, ConfigError};
use crate::metadata::{build_metadata, MetadataError};
use crate::object::decoder_for;
use crate::orchestrator::{OrchestratorError, ParallelOrchestrator, RunReport, CANCEL_GRACE};
use crate::pipeline::{ImageTransformPipeline, RegistryError, RoiOptions, StageRegistry};

mod summary;

pub use summary::setup_summary;

/// Dataset name given to the validation subset
pub const VALID_DATASET: &str = "val";

/// Log file written inside `logDir`
pub const LOG_FILE: &str = "preprocessing.log";

/// Blocking workers still running at exit are abandoned after this long
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Snafu)]
pub enum AppError {
    /// Invalid configuration
    Config { source: ConfigError },

    /// Invalid pipeline
    Pipeline { source: RegistryError },

    /// Could not index metadata
    Metadata { source: MetadataError },

    /// Metadata indexing task failed
    IndexTask { source: tokio::task::JoinError },

    /// Dataset run failed
    Run { source: OrchestratorError },

    /// Could not start async runtime
    Runtime { source: std::io::Error },

    /// Could not create log directory {path}
    CreateLogDir {
        path: String,
        source: std::io::Error,
    },

    /// Could not create log file {path}
    CreateLogFile {
        path: String,
        source: std::io::Error,
    },
}

pub struct App {
    cli: Cli,
    config: Arc<Config>,
    pipeline: Arc<ImageTransformPipeline>,
}

impl App {
    /// Fails on any configuration problem before the filesystem is touched.
    pub fn new(cli: Cli, config: Config, registry: &StageRegistry) -> Result<Self, AppError> {
        config
            .validate(&cli.corpus, &cli.dataset)
            .context(ConfigSnafu)?;
        let pipeline = ImageTransformPipeline::build(
            &config,
            registry,
            RoiOptions { gpu: cli.gpu() },
        )
        .context(PipelineSnafu)?;
        Ok(Self {
            cli,
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
        })
    }

    pub fn verbose(&self) -> bool {
        self.cli.verbose
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.config.log_dir.as_ref().map(|dir| dir.join(LOG_FILE))
    }

    /// Creates `<logDir>/preprocessing.log`. Only reachable once the setup
    /// has been validated.
    pub fn open_log_file(&self) -> Result<Option<File>, AppError> {
        let Some(path) = self.log_path() else {
            return Ok(None);
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).context(CreateLogDirSnafu {
                path: dir.display().to_string(),
            })?;
        }
        let file = File::create(&path).context(CreateLogFileSnafu {
            path: path.display().to_string(),
        })?;
        Ok(Some(file))
    }

    /// Runs [`App::preprocessing`] on a fresh multi-thread runtime. Workers
    /// that outlive their timeout do not hold up the exit.
    pub fn run(&self) -> Result<Vec<RunReport>, AppError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context(RuntimeSnafu)?;
        let result = runtime.block_on(self.preprocessing());
        runtime.shutdown_timeout(SHUTDOWN_GRACE);
        result
    }

    pub fn display_setups(&self) {
        for line in setup_summary(&self.cli, &self.config).lines() {
            info!("{}", line);
        }
    }

    /// Builds the indexes, then writes either the whole dataset or its
    /// train and validation subsets.
    pub async fn preprocessing(&self) -> Result<Vec<RunReport>, AppError> {
        let start = Instant::now();
        let corpus = self.cli.corpus.as_str();
        let crosswalk = self.config.crosswalk_path(corpus).context(ConfigSnafu)?;
        let exams_path = self.config.exams_path(corpus).context(ConfigSnafu)?;
        let source_dir = self
            .config
            .source_dir(corpus, &self.cli.dataset)
            .context(ConfigSnafu)?
            .to_path_buf();
        info!("load file list in {}", source_dir.display());

        let (index, exams) = tokio::task::spawn_blocking(move || {
            build_metadata(&crosswalk, exams_path.as_deref())
        })
        .await
        .context(IndexTaskSnafu)?
        .context(MetadataSnafu)?;
        info!("The size of data: {}", index.len());
        if exams.is_none() {
            info!("No exam metadata, using crosswalk labels");
        }

        let orchestrator = ParallelOrchestrator {
            workers: self.cli.workers(),
            form: self.cli.form,
            policy: self.config.partition,
            pipeline: self.pipeline.clone(),
            decoder: decoder_for(self.config.decode),
            exams: exams.map(Arc::new),
            source_dir,
            output_root: self.config.result_dir.join(corpus),
            tmp_dir: self.config.tmp_dir(),
            worker_timeout: self.config.worker_timeout_secs.map(Duration::from_secs),
            cancel_grace: CANCEL_GRACE,
            show_progress: !self.cli.verbose,
        };

        let runs = if self.cli.valid() {
            let (train, valid) = self.config.partition.split(&index);
            vec![(self.cli.dataset.clone(), train), (VALID_DATASET.to_string(), valid)]
        } else {
            vec![(self.cli.dataset.clone(), index)]
        };

        let mut reports = Vec::with_capacity(runs.len());
        for (name, subset) in runs {
            info!("preprocessing start : {}", name);
            let report = orchestrator
                .run_dataset(&name, subset)
                .await
                .context(RunSnafu)?;
            reports.push(report);
        }
        info!("Total time: {:.2?}", start.elapsed());
        Ok(reports)
    }
}
