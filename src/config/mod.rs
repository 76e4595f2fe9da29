//! Run configuration, loaded once from YAML and shared read-only.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::prelude::*;

use crate::object::DecodeOptions;
use crate::partition::PartitionPolicy;

pub mod cli;

pub use cli::Cli;

/// Directory holding per-worker metadata files, relative to `resultDir`
pub const TMP_DIR: &str = "tmp";

/// Reserved key under a corpus entry
pub const METADATA_KEY: &str = "metadata";

/// Channel fed by the decoded grayscale image
pub const GRAY_CHANNEL: &str = "gray";

/// Channel fed by the gray image replicated to three channels
pub const RGB_CHANNEL: &str = "rgb";

/// Highest output depth the PNG encoder handles
pub const MAX_CHANNELS: usize = 4;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Could not read configuration file {}", path.display()))]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Could not parse configuration
    ParseConfig { source: serde_yaml::Error },

    /// Corpus '{corpus}' is not configured
    UnknownCorpus { corpus: String },

    /// Dataset '{dataset}' is not configured under corpus '{corpus}'
    UnknownDataset { corpus: String, dataset: String },

    #[snafu(display("Channel list must name 1 to {MAX_CHANNELS} images, got {count}"))]
    ChannelCount { count: usize },

    #[snafu(display("Channel '{channel}' does not name gray, rgb or an enabled ROI target"))]
    UnknownChannel { channel: String },

    /// Train ratio {ratio} must lie strictly between 0 and 1
    InvalidRatio { ratio: f64 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    pub dir: PathBuf,
    pub images_crosswalk: PathBuf,
    #[serde(default)]
    pub exams_metadata: Option<PathBuf>,
}

/// One corpus: its metadata tables plus named dataset source directories.
#[derive(Debug, Clone, Deserialize)]
pub struct CorpusConfig {
    pub metadata: MetadataConfig,
    #[serde(flatten)]
    pub datasets: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineSpec {
    #[serde(default)]
    pub prev_roi: Vec<String>,
    #[serde(default)]
    pub roi: bool,
    #[serde(default)]
    pub post_roi: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub data: BTreeMap<String, CorpusConfig>,
    #[serde(default)]
    pub pipeline: PipelineSpec,
    #[serde(default)]
    pub modules: BTreeMap<String, serde_yaml::Value>,
    pub channel: Vec<String>,
    #[serde(default)]
    pub sampling: Option<String>,
    #[serde(rename = "resultDir")]
    pub result_dir: PathBuf,
    #[serde(rename = "logDir", default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub partition: PartitionPolicy,
    #[serde(default)]
    pub decode: DecodeOptions,
    #[serde(default)]
    pub worker_timeout_secs: Option<u64>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).context(ReadConfigSnafu { path })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).context(ParseConfigSnafu)
    }

    /// Checks everything a run needs before touching the filesystem.
    pub fn validate(&self, corpus: &str, dataset: &str) -> Result<(), ConfigError> {
        self.source_dir(corpus, dataset)?;

        let count = self.channel.len();
        ensure!(
            (1..=MAX_CHANNELS).contains(&count),
            ChannelCountSnafu { count }
        );

        let known = self.channel_sources();
        if let Some(channel) = self.channel.iter().find(|c| !known.contains(c.as_str())) {
            return UnknownChannelSnafu {
                channel: channel.clone(),
            }
            .fail();
        }

        let ratio = self.partition.train_ratio;
        ensure!(ratio > 0.0 && ratio < 1.0, InvalidRatioSnafu { ratio });
        Ok(())
    }

    /// Intermediate image names a channel may refer to
    pub fn channel_sources(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::from([GRAY_CHANNEL]);
        if self.pipeline.roi {
            names.insert(RGB_CHANNEL);
            names.extend(self.roi_targets());
        }
        names
    }

    pub fn corpus(&self, corpus: &str) -> Result<&CorpusConfig, ConfigError> {
        self.data
            .get(corpus)
            .context(UnknownCorpusSnafu { corpus })
    }

    pub fn source_dir(&self, corpus: &str, dataset: &str) -> Result<&Path, ConfigError> {
        let entry = self.corpus(corpus)?;
        ensure!(
            dataset != METADATA_KEY,
            UnknownDatasetSnafu { corpus, dataset }
        );
        entry
            .datasets
            .get(dataset)
            .map(PathBuf::as_path)
            .context(UnknownDatasetSnafu { corpus, dataset })
    }

    pub fn crosswalk_path(&self, corpus: &str) -> Result<PathBuf, ConfigError> {
        let meta = &self.corpus(corpus)?.metadata;
        Ok(meta.dir.join(&meta.images_crosswalk))
    }

    pub fn exams_path(&self, corpus: &str) -> Result<Option<PathBuf>, ConfigError> {
        let meta = &self.corpus(corpus)?.metadata;
        Ok(meta.exams_metadata.as_ref().map(|p| meta.dir.join(p)))
    }

    /// `resultDir/<corpus>/<dataset>`
    pub fn target_dir(&self, corpus: &str, dataset: &str) -> PathBuf {
        self.result_dir.join(corpus).join(dataset)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.result_dir.join(TMP_DIR)
    }

    /// Target names listed under `modules.roi.targets`
    pub fn roi_targets(&self) -> Vec<&str> {
        self.modules
            .get("roi")
            .and_then(|roi| roi.get("targets"))
            .and_then(serde_yaml::Value::as_sequence)
            .map(|seq| seq.iter().filter_map(serde_yaml::Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Parameter block for a stage; absent or null blocks read as empty.
    pub fn module_params(&self, name: &str) -> serde_yaml::Value {
        match self.modules.get(name) {
            Some(serde_yaml::Value::Null) | None => {
                serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
            }
            Some(value) => value.clone(),
        }
    }

    /// Parameter block for a ROI target, nested under `modules.roi`
    pub fn roi_params(&self, target: &str) -> serde_yaml::Value {
        match self.modules.get("roi").and_then(|roi| roi.get(target)) {
            Some(serde_yaml::Value::Null) | None => {
                serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
            }
            Some(value) => value.clone(),
        }
    }
}
