//! One worker: runs a shard of exams through the pipeline, writes images and
//! a private metadata file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::ProgressBar;
use snafu::prelude::*;
use snafu::Report;
use tracing::{debug, info, warn};

use crate::metadata::{ExamIndex, ExamKey, ImageIndex, ImageRecord};
use crate::object::{DecodeError, ImageDecoder};
use crate::partition::WorkShard;
use crate::pipeline::{ImageTransformPipeline, PipelineError};

mod output;

pub use output::{ImageMeta, OutputError, OutputForm, OutputWriter};

/// File name of a worker's private metadata table
pub fn worker_metadata_name(worker: usize) -> String {
    format!("metadata_{}.tsv", worker)
}

#[derive(Debug, Snafu)]
pub enum WorkerError {
    /// Could not create worker metadata file {path}
    OpenMetadata {
        path: String,
        #[snafu(source(from(csv::Error, Box::new)))]
        source: Box<csv::Error>,
    },

    /// Could not write worker metadata file {path}
    WriteMetadata {
        path: String,
        #[snafu(source(from(csv::Error, Box::new)))]
        source: Box<csv::Error>,
    },

    /// Could not flush worker metadata file {path}
    FlushMetadata {
        path: String,
        source: std::io::Error,
    },
}

/// Why a single record was skipped
#[derive(Debug, Snafu)]
pub enum RecordError {
    /// No cancer label in exam metadata or crosswalk
    MissingLabel,

    /// Could not decode source image
    Decode { source: DecodeError },

    /// Transform pipeline failed
    Pipeline { source: PipelineError },

    /// Could not write output image
    Write { source: OutputError },

    /// Worker was cancelled before the image was written
    Cancelled,
}

#[derive(Debug)]
pub enum RecordOutcome {
    Written { path: PathBuf, label: String },
    Skipped { reason: RecordError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSummary {
    pub worker: usize,
    pub exams: usize,
    pub written: usize,
    pub skipped: usize,
    /// Stopped early on request; records after the stop were not touched
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Everything a worker reads. Shared read-only across all workers of a run.
pub struct WorkerContext {
    pub index: Arc<ImageIndex>,
    pub exams: Option<Arc<ExamIndex>>,
    pub pipeline: Arc<ImageTransformPipeline>,
    pub decoder: Arc<dyn ImageDecoder>,
    pub writer: OutputWriter,
    pub source_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub progress: Option<ProgressBar>,
}

impl WorkerContext {
    /// Exam metadata wins when present; otherwise the crosswalk's own label.
    pub fn resolve_label(&self, key: &ExamKey, laterality: &str, record: &ImageRecord) -> Option<String> {
        self.exams
            .as_ref()
            .and_then(|exams| exams.cancer_label(key, laterality))
            .map(str::to_string)
            .or_else(|| record.cancer.clone())
    }
}

pub struct WorkerExecutor {
    context: Arc<WorkerContext>,
    shard: WorkShard,
    cancel: Arc<AtomicBool>,
}

impl WorkerExecutor {
    pub fn new(context: Arc<WorkerContext>, shard: WorkShard) -> Self {
        Self {
            context,
            shard,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between records and before each image write. Once set,
    /// the worker flushes what it has and returns.
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.context
            .tmp_dir
            .join(worker_metadata_name(self.shard.worker))
    }

    /// Processes the whole shard. Record failures are logged and skipped;
    /// only metadata file errors abort.
    pub fn run(self) -> Result<ShardSummary, WorkerError> {
        let start = Instant::now();
        let worker = self.shard.worker;
        let metadata_path = self.metadata_path();
        let display = metadata_path.display().to_string();
        info!("Proc{} start: {} exams", worker, self.shard.keys.len());

        let mut metadata = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_path(&metadata_path)
            .context(OpenMetadataSnafu { path: &display })?;

        let mut summary = ShardSummary {
            worker,
            exams: self.shard.keys.len(),
            written: 0,
            skipped: 0,
            cancelled: false,
            elapsed: Duration::ZERO,
        };

        'shard: for key in &self.shard.keys {
            let Some(views) = self.context.index.get(key) else {
                warn!("Proc{}: exam {} not in index", worker, key);
                continue;
            };
            for (view, lateralities) in views {
                for (laterality, record) in lateralities {
                    if self.cancelled() {
                        summary.cancelled = true;
                        break 'shard;
                    }
                    match self.process(key, view, laterality, record) {
                        RecordOutcome::Written { path, label } => {
                            debug!("Proc{}: wrote {}", worker, path.display());
                            metadata
                                .write_record([
                                    key.subject_id.as_str(),
                                    key.exam_index.as_str(),
                                    view.as_str(),
                                    laterality.as_str(),
                                    label.as_str(),
                                ])
                                .context(WriteMetadataSnafu { path: &display })?;
                            summary.written += 1;
                        }
                        RecordOutcome::Skipped {
                            reason: RecordError::Cancelled,
                        } => {
                            summary.cancelled = true;
                            break 'shard;
                        }
                        RecordOutcome::Skipped { reason } => {
                            warn!(
                                "Proc{}: skipping {} {} {}: {}",
                                worker,
                                key,
                                view,
                                laterality,
                                Report::from_error(reason)
                            );
                            summary.skipped += 1;
                        }
                    }
                    if let Some(progress) = &self.context.progress {
                        progress.inc(1);
                    }
                }
            }
        }

        metadata
            .flush()
            .context(FlushMetadataSnafu { path: &display })?;
        summary.elapsed = start.elapsed();
        if summary.cancelled {
            warn!(
                "Proc{} cancelled after {} records ({} written)",
                worker,
                summary.written + summary.skipped,
                summary.written
            );
            return Ok(summary);
        }
        info!(
            "Proc{} finished: size {} ({} written, {} skipped) in {:.2?}",
            worker,
            summary.written + summary.skipped,
            summary.written,
            summary.skipped,
            summary.elapsed
        );
        Ok(summary)
    }

    fn process(&self, key: &ExamKey, view: &str, laterality: &str, record: &ImageRecord) -> RecordOutcome {
        match self.try_process(key, view, laterality, record) {
            Ok((path, label)) => RecordOutcome::Written { path, label },
            Err(reason) => RecordOutcome::Skipped { reason },
        }
    }

    fn try_process(
        &self,
        key: &ExamKey,
        view: &str,
        laterality: &str,
        record: &ImageRecord,
    ) -> Result<(PathBuf, String), RecordError> {
        let ctx = &self.context;
        let label = ctx
            .resolve_label(key, laterality, record)
            .context(MissingLabelSnafu)?;

        let source = source_path(&ctx.source_dir, &record.filename);
        let decoded = ctx.decoder.decode(&source).context(DecodeSnafu)?;
        if let Some(found) = decoded.orientation.image_laterality.as_deref() {
            if found != laterality {
                warn!(
                    "{} {}: file says laterality {}, crosswalk says {}",
                    key, view, found, laterality
                );
            }
        }
        let image = ctx.pipeline.run(decoded.gray).context(PipelineSnafu)?;

        let meta = ImageMeta {
            subject_id: &key.subject_id,
            exam_index: &key.exam_index,
            view,
            laterality,
            label: &label,
        };
        ensure!(!self.cancelled(), CancelledSnafu);
        let path = ctx.writer.write(&meta, &image).context(WriteSnafu)?;
        Ok((path, label))
    }
}

fn source_path(source_dir: &Path, filename: &str) -> PathBuf {
    source_dir.join(filename)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metadata::{ExamIndex, ImageIndex};
    use crate::object::{DecodedImage, Orientation, RasterDecoder};
    use crate::pipeline::{RoiOptions, StageRegistry};
    use crate::utils::ImageTensor;

    /// Decodes every file to the same gray image without touching disk;
    /// names containing "corrupt" fail.
    pub(crate) struct StubDecoder;

    impl ImageDecoder for StubDecoder {
        fn decode(&self, path: &Path) -> Result<DecodedImage, DecodeError> {
            if path.to_string_lossy().contains("corrupt") {
                return Err(DecodeError::PixelData {
                    message: "truncated".to_string(),
                });
            }
            Ok(DecodedImage {
                gray: ImageTensor::filled(6, 4, 1, 90),
                orientation: Orientation::default(),
            })
        }
    }

    pub(crate) fn gray_pipeline() -> Arc<ImageTransformPipeline> {
        let config = crate::config::Config::from_yaml(
            r#"
data: {}
channel: [gray]
resultDir: /unused
"#,
        )
        .unwrap();
        Arc::new(
            ImageTransformPipeline::build(&config, &StageRegistry::with_builtins(), RoiOptions::default())
                .unwrap(),
        )
    }

    pub(crate) fn sample_index(subjects: usize) -> ImageIndex {
        let mut index = ImageIndex::new();
        for s in 0..subjects {
            for view in ["CC", "MLO"] {
                for laterality in ["L", "R"] {
                    index.insert(
                        ExamKey::new(format!("s{}", s), "1"),
                        view.to_string(),
                        laterality.to_string(),
                        ImageRecord {
                            image_index: "0".into(),
                            filename: format!("s{}_{}_{}.dcm", s, view, laterality),
                            cancer: Some(if laterality == "L" { "0" } else { "1" }.into()),
                        },
                    );
                }
            }
        }
        index
    }

    fn context(
        index: ImageIndex,
        exams: Option<ExamIndex>,
        decoder: Arc<dyn ImageDecoder>,
        form: OutputForm,
        root: &Path,
    ) -> Arc<WorkerContext> {
        let tmp_dir = root.join("tmp");
        std::fs::create_dir_all(&tmp_dir).unwrap();
        Arc::new(WorkerContext {
            index: Arc::new(index),
            exams: exams.map(Arc::new),
            pipeline: gray_pipeline(),
            decoder,
            writer: OutputWriter::new(form, root.join("out")),
            source_dir: root.join("src"),
            tmp_dir,
            progress: None,
        })
    }

    #[test]
    fn test_shard_writes_images_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let index = sample_index(2);
        let keys = index.keys().to_vec();
        let ctx = context(index, None, Arc::new(StubDecoder), OutputForm::Class, dir.path());

        let executor = WorkerExecutor::new(ctx, WorkShard { worker: 3, keys });
        let metadata_path = executor.metadata_path();
        let summary = executor.run().unwrap();
        assert_eq!(summary.worker, 3);
        assert_eq!(summary.exams, 2);
        assert_eq!(summary.written, 8);
        assert_eq!(summary.skipped, 0);

        assert!(dir.path().join("out/0/s0_1_CC_L.png").exists());
        assert!(dir.path().join("out/1/s1_1_MLO_R.png").exists());
        let lines = std::fs::read_to_string(metadata_path).unwrap();
        assert_eq!(lines.lines().count(), 8);
        assert!(lines.lines().any(|l| l == "s0\t1\tCC\tL\t0"));
    }

    #[test]
    fn test_bad_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = sample_index(1);
        let key = ExamKey::new("s0", "1");
        index.insert(
            key.clone(),
            "CC".into(),
            "L".into(),
            ImageRecord {
                image_index: "0".into(),
                filename: "corrupt.dcm".into(),
                cancer: Some("0".into()),
            },
        );
        index.insert(
            key.clone(),
            "MLO".into(),
            "L".into(),
            ImageRecord {
                image_index: "1".into(),
                filename: "unlabeled.dcm".into(),
                cancer: None,
            },
        );
        let ctx = context(index, None, Arc::new(StubDecoder), OutputForm::Robust, dir.path());
        let summary = WorkerExecutor::new(ctx, WorkShard { worker: 0, keys: vec![key] })
            .run()
            .unwrap();
        assert_eq!(summary.written, 2);
        assert_eq!(summary.skipped, 2);
        assert!(dir.path().join("out/s0/1/R/CC.png").exists());
        assert!(!dir.path().join("out/s0/1/L/CC.png").exists());
    }

    #[test]
    fn test_exam_labels_take_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let exams_path = dir.path().join("exams.tsv");
        std::fs::write(&exams_path, "subjectId\texamIndex\tcancerL\tcancerR\ns0\t1\t1\t1\n").unwrap();
        let exams = crate::metadata::build_exam_index(&exams_path).unwrap();

        let index = sample_index(1);
        let keys = index.keys().to_vec();
        let ctx = context(index, Some(exams), Arc::new(StubDecoder), OutputForm::Class, dir.path());
        let summary = WorkerExecutor::new(ctx, WorkShard { worker: 0, keys }).run().unwrap();
        assert_eq!(summary.written, 4);
        assert!(dir.path().join("out/1/s0_1_CC_L.png").exists());
        assert!(!dir.path().join("out/0").exists());
    }

    #[test]
    fn test_raster_sources_are_transformed() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        let index = sample_index(1);
        for (_, views) in index.iter() {
            for lateralities in views.values() {
                for record in lateralities.values() {
                    image::GrayImage::from_pixel(3, 3, image::Luma([42]))
                        .save_with_format(src.join(&record.filename), image::ImageFormat::Png)
                        .unwrap();
                }
            }
        }
        let keys = index.keys().to_vec();
        let ctx = context(index, None, Arc::new(RasterDecoder), OutputForm::Robust, dir.path());
        let summary = WorkerExecutor::new(ctx, WorkShard { worker: 1, keys }).run().unwrap();
        assert_eq!(summary.written, 4);

        let written = image::open(dir.path().join("out/s0/1/L/MLO.png")).unwrap();
        assert_eq!(ImageTensor::from_dynamic(written), ImageTensor::filled(3, 3, 1, 42));
    }

    #[test]
    fn test_cancelled_worker_writes_nothing_more() {
        let dir = tempfile::tempdir().unwrap();
        let index = sample_index(2);
        let keys = index.keys().to_vec();
        let ctx = context(index, None, Arc::new(StubDecoder), OutputForm::Robust, dir.path());
        let cancel = Arc::new(AtomicBool::new(true));
        let executor = WorkerExecutor::new(ctx, WorkShard { worker: 0, keys }).with_cancel(cancel);
        let metadata_path = executor.metadata_path();
        let summary = executor.run().unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.written, 0);
        assert_eq!(summary.skipped, 0);
        assert!(!dir.path().join("out").exists());
        assert_eq!(std::fs::read_to_string(metadata_path).unwrap(), "");
    }

    #[test]
    fn test_missing_tmp_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(sample_index(1), None, Arc::new(StubDecoder), OutputForm::Class, dir.path());
        std::fs::remove_dir_all(dir.path().join("tmp")).unwrap();
        let err = WorkerExecutor::new(ctx, WorkShard { worker: 0, keys: vec![] })
            .run()
            .unwrap_err();
        assert!(matches!(err, WorkerError::OpenMetadata { .. }));
    }
}
