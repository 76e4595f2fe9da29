//! Fan-out/join execution of one dataset over N workers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use snafu::prelude::*;
use snafu::Report;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::metadata::{ExamIndex, ImageIndex};
use crate::object::ImageDecoder;
use crate::partition::{shard, PartitionPolicy};
use crate::pipeline::ImageTransformPipeline;
use crate::worker::{
    OutputForm, OutputWriter, ShardSummary, WorkerContext, WorkerError, WorkerExecutor,
};

pub mod merge;

pub use merge::{merge_metadata, purge_worker_files, MergeError, MergeSummary};

/// How long a timed-out worker gets to notice its cancel flag
pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Snafu)]
pub enum OrchestratorError {
    /// Could not clear target directory {path}
    ClearTarget {
        path: String,
        source: std::io::Error,
    },

    /// Could not create directory {path}
    CreateDir {
        path: String,
        source: std::io::Error,
    },

    /// Could not prepare worker metadata directory
    PurgeStale { source: MergeError },

    /// Could not merge worker metadata
    Merge { source: MergeError },
}

/// A worker that did not deliver a shard summary
#[derive(Debug)]
pub enum WorkerFailure {
    Errored { worker: usize, error: WorkerError },
    Panicked { worker: usize, message: String },
    /// `stopped` is false when the worker did not return within the
    /// cancel grace period
    TimedOut {
        worker: usize,
        after: Duration,
        stopped: bool,
    },
}

impl WorkerFailure {
    pub fn worker(&self) -> usize {
        match self {
            WorkerFailure::Errored { worker, .. }
            | WorkerFailure::Panicked { worker, .. }
            | WorkerFailure::TimedOut { worker, .. } => *worker,
        }
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerFailure::Errored { worker, error } => {
                write!(f, "Proc{} failed: {}", worker, Report::from_error(error))
            }
            WorkerFailure::Panicked { worker, message } => {
                write!(f, "Proc{} panicked: {}", worker, message)
            }
            WorkerFailure::TimedOut {
                worker,
                after,
                stopped: true,
            } => write!(f, "Proc{} timed out after {:?} and was cancelled", worker, after),
            WorkerFailure::TimedOut {
                worker,
                after,
                stopped: false,
            } => write!(
                f,
                "Proc{} timed out after {:?} and is still finishing its current record",
                worker, after
            ),
        }
    }
}

/// Outcome of one dataset run
#[derive(Debug)]
pub struct RunReport {
    pub dataset: String,
    pub target_dir: PathBuf,
    pub shards: Vec<ShardSummary>,
    pub failures: Vec<WorkerFailure>,
    pub merged: MergeSummary,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn written(&self) -> usize {
        self.shards.iter().map(|s| s.written).sum()
    }

    pub fn skipped(&self) -> usize {
        self.shards.iter().map(|s| s.skipped).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Inputs shared by every dataset run of one invocation
pub struct ParallelOrchestrator {
    pub workers: usize,
    pub form: OutputForm,
    pub policy: PartitionPolicy,
    pub pipeline: Arc<ImageTransformPipeline>,
    pub decoder: Arc<dyn ImageDecoder>,
    pub exams: Option<Arc<ExamIndex>>,
    pub source_dir: PathBuf,
    /// `resultDir/<corpus>`
    pub output_root: PathBuf,
    pub tmp_dir: PathBuf,
    pub worker_timeout: Option<Duration>,
    pub cancel_grace: Duration,
    pub show_progress: bool,
}

enum TaskOutcome {
    Finished(Result<ShardSummary, WorkerError>),
    Crashed(JoinError),
    TimedOut { after: Duration, stopped: bool },
}

fn finished(joined: Result<Result<ShardSummary, WorkerError>, JoinError>) -> TaskOutcome {
    match joined {
        Ok(result) => TaskOutcome::Finished(result),
        Err(e) => TaskOutcome::Crashed(e),
    }
}

fn create_dir(path: &Path) -> Result<(), OrchestratorError> {
    std::fs::create_dir_all(path).context(CreateDirSnafu {
        path: path.display().to_string(),
    })
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string()),
        Err(err) => err.to_string(),
    }
}

impl ParallelOrchestrator {
    pub fn target_dir(&self, dataset: &str) -> PathBuf {
        self.output_root.join(dataset)
    }

    fn progress_bar(&self, total: usize) -> Option<ProgressBar> {
        if !self.show_progress {
            return None;
        }
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.enable_steady_tick(Duration::new(0, 480_000_000));
        Some(bar)
    }

    /// Rebuilds `<output_root>/<dataset>` from `index`: clears the target,
    /// runs one worker per shard, waits for all of them, then merges their
    /// metadata files.
    pub async fn run_dataset(
        &self,
        dataset: &str,
        index: ImageIndex,
    ) -> Result<RunReport, OrchestratorError> {
        let start = Instant::now();
        let target_dir = self.target_dir(dataset);
        if target_dir.exists() {
            std::fs::remove_dir_all(&target_dir).context(ClearTargetSnafu {
                path: target_dir.display().to_string(),
            })?;
        }
        create_dir(&target_dir)?;
        create_dir(&self.tmp_dir)?;
        purge_worker_files(&self.tmp_dir).context(PurgeStaleSnafu)?;

        let shards = shard(self.policy.ordered_keys(&index), self.workers);
        info!(
            "{}: {} exams ({} images) over {} workers",
            dataset,
            index.len(),
            index.image_count(),
            shards.len()
        );

        let progress = self.progress_bar(index.image_count());
        let context = Arc::new(WorkerContext {
            index: Arc::new(index),
            exams: self.exams.clone(),
            pipeline: self.pipeline.clone(),
            decoder: self.decoder.clone(),
            writer: OutputWriter::new(self.form, &target_dir),
            source_dir: self.source_dir.clone(),
            tmp_dir: self.tmp_dir.clone(),
            progress: progress.clone(),
        });

        let mut tasks = JoinSet::new();
        for work in shards {
            let worker = work.worker;
            let cancel = Arc::new(AtomicBool::new(false));
            let executor = WorkerExecutor::new(context.clone(), work).with_cancel(cancel.clone());
            let timeout = self.worker_timeout;
            let grace = self.cancel_grace;
            tasks.spawn(async move {
                let mut handle = tokio::task::spawn_blocking(move || executor.run());
                let outcome = match timeout {
                    Some(after) => match tokio::time::timeout(after, &mut handle).await {
                        Ok(joined) => finished(joined),
                        Err(_) => {
                            cancel.store(true, Ordering::Relaxed);
                            let stopped = tokio::time::timeout(grace, handle).await.is_ok();
                            TaskOutcome::TimedOut { after, stopped }
                        }
                    },
                    None => finished(handle.await),
                };
                (worker, outcome)
            });
        }

        let mut summaries = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (worker, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("{}", Report::from_error(e));
                    continue;
                }
            };
            match outcome {
                TaskOutcome::Finished(Ok(summary)) => summaries.push(summary),
                TaskOutcome::Finished(Err(error)) => {
                    failures.push(WorkerFailure::Errored { worker, error })
                }
                TaskOutcome::Crashed(e) => failures.push(WorkerFailure::Panicked {
                    worker,
                    message: panic_message(e),
                }),
                TaskOutcome::TimedOut { after, stopped } => {
                    failures.push(WorkerFailure::TimedOut {
                        worker,
                        after,
                        stopped,
                    })
                }
            }
        }
        summaries.sort_by_key(|s| s.worker);
        failures.sort_by_key(WorkerFailure::worker);

        if let Some(bar) = progress {
            bar.finish_with_message("done");
        }

        // a worker that ignored its cancel flag may still be writing its file
        let still_running: Vec<usize> = failures
            .iter()
            .filter(|f| matches!(f, WorkerFailure::TimedOut { stopped: false, .. }))
            .map(WorkerFailure::worker)
            .collect();
        let merged =
            merge_metadata(&self.tmp_dir, &target_dir, &still_running).context(MergeSnafu)?;

        let report = RunReport {
            dataset: dataset.to_string(),
            target_dir,
            shards: summaries,
            failures,
            merged,
            elapsed: start.elapsed(),
        };
        if report.is_complete() {
            info!(
                "{}: {} images written, {} skipped in {:.2?}",
                dataset,
                report.written(),
                report.skipped(),
                report.elapsed
            );
        } else {
            warn!(
                "{}: partial result, {} of {} workers failed",
                dataset,
                report.failures.len(),
                report.failures.len() + report.shards.len()
            );
            for failure in &report.failures {
                warn!("{}", failure);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{DecodeError, DecodedImage};
    use crate::worker::tests::{gray_pipeline, sample_index, StubDecoder};
    use std::fs;

    fn orchestrator(root: &Path, workers: usize, decoder: Arc<dyn ImageDecoder>) -> ParallelOrchestrator {
        ParallelOrchestrator {
            workers,
            form: OutputForm::Robust,
            policy: PartitionPolicy::default(),
            pipeline: gray_pipeline(),
            decoder,
            exams: None,
            source_dir: root.join("src"),
            output_root: root.join("results").join("dream"),
            tmp_dir: root.join("results").join("tmp"),
            worker_timeout: None,
            cancel_grace: CANCEL_GRACE,
            show_progress: false,
        }
    }

    #[tokio::test]
    async fn test_every_record_processed_once() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), 3, Arc::new(StubDecoder));

        // leftovers from an earlier run
        let stale_target = orch.target_dir("training");
        fs::create_dir_all(&stale_target).unwrap();
        fs::write(stale_target.join("old.png"), b"junk").unwrap();
        fs::create_dir_all(&orch.tmp_dir).unwrap();
        fs::write(orch.tmp_dir.join("metadata_7.tsv"), "old\t1\tCC\tL\t0\n").unwrap();

        let report = orch.run_dataset("training", sample_index(5)).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.shards.len(), 3);
        assert_eq!(report.written(), 20);
        assert_eq!(report.merged.files, 3);
        assert_eq!(report.merged.lines, 20);
        assert_eq!(report.shards.iter().map(|s| s.exams).sum::<usize>(), 5);

        assert!(!stale_target.join("old.png").exists());
        let merged = fs::read_to_string(stale_target.join("metadata.tsv")).unwrap();
        assert_eq!(merged.lines().count(), 20);
        assert!(!merged.contains("old"));
    }

    #[tokio::test]
    async fn test_more_workers_than_exams() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), 8, Arc::new(StubDecoder));
        let report = orch.run_dataset("training", sample_index(2)).await.unwrap();
        assert_eq!(report.shards.len(), 8);
        assert_eq!(report.merged.lines, 8);
    }

    struct PanickingDecoder;

    impl ImageDecoder for PanickingDecoder {
        fn decode(&self, path: &Path) -> Result<DecodedImage, DecodeError> {
            if path.to_string_lossy().contains("s0_") {
                panic!("decoder crashed");
            }
            StubDecoder.decode(path)
        }
    }

    #[tokio::test]
    async fn test_crashed_worker_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), 2, Arc::new(PanickingDecoder));
        // shards: [s0, s1] and [s2]
        let report = orch.run_dataset("training", sample_index(3)).await.unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0],
            WorkerFailure::Panicked { worker: 0, ref message } if message == "decoder crashed"
        ));
        // the surviving worker still gets merged
        assert_eq!(report.shards.len(), 1);
        assert_eq!(report.merged.lines, 4);
    }

    struct SlowDecoder;

    impl ImageDecoder for SlowDecoder {
        fn decode(&self, path: &Path) -> Result<DecodedImage, DecodeError> {
            std::thread::sleep(Duration::from_millis(300));
            StubDecoder.decode(path)
        }
    }

    fn png_count(dir: &Path) -> usize {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "png"))
            .count()
    }

    #[tokio::test]
    async fn test_timed_out_worker_is_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), 1, Arc::new(SlowDecoder));
        orch.worker_timeout = Some(Duration::from_millis(50));
        let report = orch.run_dataset("training", sample_index(1)).await.unwrap();
        assert!(matches!(
            report.failures[..],
            [WorkerFailure::TimedOut {
                worker: 0,
                stopped: true,
                ..
            }]
        ));
        // the worker stopped before writing, so its empty file is merged
        assert_eq!(report.merged.files, 1);
        assert_eq!(report.merged.lines, 0);
        assert_eq!(png_count(&report.target_dir), 0);
    }

    struct HungDecoder;

    impl ImageDecoder for HungDecoder {
        fn decode(&self, path: &Path) -> Result<DecodedImage, DecodeError> {
            std::thread::sleep(Duration::from_millis(800));
            StubDecoder.decode(path)
        }
    }

    #[test]
    fn test_hung_worker_does_not_block_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), 1, Arc::new(HungDecoder));
        orch.worker_timeout = Some(Duration::from_millis(50));
        orch.cancel_grace = Duration::from_millis(50);

        let start = Instant::now();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let report = runtime
            .block_on(orch.run_dataset("training", sample_index(1)))
            .unwrap();
        runtime.shutdown_timeout(Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_millis(600));

        assert!(matches!(
            report.failures[..],
            [WorkerFailure::TimedOut {
                worker: 0,
                stopped: false,
                ..
            }]
        ));
        assert_eq!(report.merged.files, 0);

        // once its current decode returns, the worker sees the flag and writes nothing
        std::thread::sleep(Duration::from_millis(1500));
        assert_eq!(png_count(&report.target_dir), 0);
    }
}
