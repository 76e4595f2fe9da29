//! Per-image transform pipeline: pre-ROI stages, ROI masks, channel
//! composition, post-ROI stages.

use std::collections::HashMap;

use snafu::prelude::*;
use tracing::debug;

use crate::config::{Config, GRAY_CHANNEL, RGB_CHANNEL};
use crate::utils::{ImageTensor, TensorError};

pub mod registry;
pub mod roi;
pub mod stages;

pub use registry::{
    RegistryError, RoiExtractor, RoiOptions, Stage, StageError, StageRegistry,
};

#[derive(Debug, Snafu)]
pub enum PipelineError {
    #[snafu(display("Stage '{stage}' failed"))]
    StageFailed { stage: String, source: StageError },

    #[snafu(display("ROI target '{target}' failed"))]
    ExtractFailed { target: String, source: StageError },

    /// No intermediate image named '{channel}'
    MissingChannel { channel: String },

    /// Could not compose output channels
    Compose { source: TensorError },
}

/// The configured transform sequence, resolved against a registry.
///
/// Built once before any work starts, then shared read-only by every
/// worker.
pub struct ImageTransformPipeline {
    pre: Vec<Box<dyn Stage>>,
    roi: bool,
    extractors: Vec<(String, Box<dyn RoiExtractor>)>,
    channels: Vec<String>,
    post: Vec<Box<dyn Stage>>,
}

impl std::fmt::Debug for ImageTransformPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageTransformPipeline")
            .field("pre", &self.pre.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("roi", &self.roi)
            .field(
                "extractors",
                &self
                    .extractors
                    .iter()
                    .map(|(t, e)| format!("{}:{}", t, e.name()))
                    .collect::<Vec<_>>(),
            )
            .field("channels", &self.channels)
            .field("post", &self.post.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl ImageTransformPipeline {
    /// Resolves every configured name eagerly so configuration mistakes
    /// surface before any image is read.
    pub fn build(
        config: &Config,
        registry: &StageRegistry,
        options: RoiOptions,
    ) -> Result<Self, RegistryError> {
        let build_all = |names: &[String]| {
            names
                .iter()
                .map(|name| registry.build_stage(name, &config.module_params(name)))
                .collect::<Result<Vec<_>, _>>()
        };
        let pre = build_all(&config.pipeline.prev_roi)?;
        let post = build_all(&config.pipeline.post_roi)?;

        let mut extractors = Vec::new();
        if config.pipeline.roi {
            for target in config.roi_targets() {
                ensure!(
                    target != GRAY_CHANNEL && target != RGB_CHANNEL,
                    registry::ChannelCollisionSnafu { target }
                );
                let extractor =
                    registry.build_extractor(target, &config.roi_params(target), options)?;
                extractors.push((target.to_string(), extractor));
            }
        }

        let pipeline = Self {
            pre,
            roi: config.pipeline.roi,
            extractors,
            channels: config.channel.clone(),
            post,
        };
        for channel in &pipeline.channels {
            ensure!(
                pipeline.provides(channel),
                registry::UnknownChannelSnafu { channel }
            );
        }
        debug!("Pipeline ready: {:?}", pipeline);
        Ok(pipeline)
    }

    fn provides(&self, channel: &str) -> bool {
        channel == GRAY_CHANNEL
            || (self.roi
                && (channel == RGB_CHANNEL || self.extractors.iter().any(|(t, _)| t == channel)))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn pre_stage_names(&self) -> Vec<&str> {
        self.pre.iter().map(|s| s.name()).collect()
    }

    pub fn post_stage_names(&self) -> Vec<&str> {
        self.post.iter().map(|s| s.name()).collect()
    }

    /// Runs one decoded grayscale image through the whole sequence. The
    /// result has exactly one plane per configured channel before the
    /// post-ROI stages run.
    pub fn run(&self, gray: ImageTensor) -> Result<ImageTensor, PipelineError> {
        let mut gray = gray;
        for stage in &self.pre {
            gray = stage
                .apply(gray)
                .context(StageFailedSnafu { stage: stage.name() })?;
        }

        let mut intermediates: HashMap<&str, ImageTensor> = HashMap::new();
        if self.roi {
            let rgb = gray.replicate_to_rgb();
            for (target, extractor) in &self.extractors {
                let mask = extractor
                    .mask(&rgb)
                    .context(ExtractFailedSnafu { target: target.as_str() })?;
                intermediates.insert(target.as_str(), mask);
            }
            intermediates.insert(RGB_CHANNEL, rgb);
        }
        intermediates.insert(GRAY_CHANNEL, gray);

        let planes = self
            .channels
            .iter()
            .map(|channel| {
                intermediates
                    .get(channel.as_str())
                    .map(ImageTensor::collapse_to_gray)
                    .context(MissingChannelSnafu { channel: channel.as_str() })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut composed = ImageTensor::from_planes(&planes).context(ComposeSnafu)?;

        for stage in &self.post {
            composed = stage
                .apply(composed)
                .context(StageFailedSnafu { stage: stage.name() })?;
        }
        Ok(composed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use image::{GrayImage, ImageBuffer, Luma};

    fn mammogram() -> ImageTensor {
        // bright tissue on the right, dark border all around
        let gray: GrayImage = ImageBuffer::from_fn(10, 8, |x, y| {
            if (1..7).contains(&y) && (5..9).contains(&x) {
                Luma([120 + x as u8])
            } else {
                Luma([0])
            }
        });
        ImageTensor::from_gray(gray)
    }

    fn sample_config() -> Config {
        Config::from_yaml(SAMPLE).unwrap()
    }

    #[test]
    fn test_channel_count_matches_config() {
        let config = sample_config();
        let pipeline =
            ImageTransformPipeline::build(&config, &StageRegistry::with_builtins(), RoiOptions::default())
                .unwrap();
        assert_eq!(pipeline.pre_stage_names(), vec!["trim", "align"]);
        assert_eq!(pipeline.post_stage_names(), vec!["resize"]);

        let out = pipeline.run(mammogram()).unwrap();
        assert_eq!(out.channels(), 3);
        assert_eq!(out.dimensions(), (64, 64));
    }

    #[test]
    fn test_compose_without_roi() {
        let mut config = sample_config();
        config.pipeline = crate::config::PipelineSpec {
            prev_roi: vec!["trim".into()],
            roi: false,
            post_roi: vec![],
        };
        config.channel = vec!["gray".into(), "gray".into()];
        let pipeline =
            ImageTransformPipeline::build(&config, &StageRegistry::with_builtins(), RoiOptions::default())
                .unwrap();
        let out = pipeline.run(mammogram()).unwrap();
        assert_eq!(out.channels(), 2);
        assert_eq!(out.dimensions(), (4, 6));
        assert_eq!(out.plane(0), out.plane(1));
    }

    #[test]
    fn test_mask_channel_follows_gray() {
        let mut config = sample_config();
        config.pipeline.post_roi.clear();
        config.pipeline.prev_roi.clear();
        config.channel = vec!["breast".into(), "gray".into()];
        let pipeline =
            ImageTransformPipeline::build(&config, &StageRegistry::with_builtins(), RoiOptions::default())
                .unwrap();
        let out = pipeline.run(mammogram()).unwrap();
        assert_eq!(out.channels(), 2);
        // mask is on wherever the tissue is
        assert_eq!(out.get(6, 3, 0), 255);
        assert_eq!(out.get(0, 0, 0), 0);
        assert_eq!(out.get(6, 3, 1), 126);
    }

    #[test]
    fn test_unknown_names_fail_at_build() {
        let registry = StageRegistry::with_builtins();
        let mut config = sample_config();
        config.pipeline.post_roi.push("sharpen".into());
        assert!(matches!(
            ImageTransformPipeline::build(&config, &registry, RoiOptions::default()).err(),
            Some(RegistryError::UnknownStage { .. })
        ));

        let mut config = sample_config();
        config.channel.push("vessels".into());
        assert!(matches!(
            ImageTransformPipeline::build(&config, &registry, RoiOptions::default()).err(),
            Some(RegistryError::UnknownChannel { .. })
        ));
    }

    #[test]
    fn test_stage_failure_names_stage() {
        let mut config = sample_config();
        config.pipeline = crate::config::PipelineSpec {
            prev_roi: vec![],
            roi: false,
            post_roi: vec!["resize".into()],
        };
        config.channel = vec!["gray".into()];
        let pipeline =
            ImageTransformPipeline::build(&config, &StageRegistry::with_builtins(), RoiOptions::default())
                .unwrap();
        let empty = ImageTensor::new(0, 0, 1, vec![]).unwrap();
        let err = pipeline.run(empty).unwrap_err();
        assert!(matches!(err, PipelineError::StageFailed { ref stage, .. } if stage == "resize"));
    }
}
