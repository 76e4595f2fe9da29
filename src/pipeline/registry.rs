use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use snafu::prelude::*;
use tracing::debug;

use super::{roi, stages};
use crate::utils::{ImageTensor, TensorError};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StageError {
    /// Stage produced an inconsistent image
    Tensor { source: TensorError },

    /// Image has no pixels left
    EmptyImage,
}

/// An image-to-image transform with its parameters already bound.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, image: ImageTensor) -> Result<ImageTensor, StageError>;
}

/// Produces a mask from the RGB intermediate.
pub trait RoiExtractor: Send + Sync {
    fn name(&self) -> &str;

    fn mask(&self, rgb: &ImageTensor) -> Result<ImageTensor, StageError>;
}

/// Options forwarded to every ROI extractor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoiOptions {
    pub gpu: bool,
}

pub type StageFactory = fn(&serde_yaml::Value) -> Result<Box<dyn Stage>, serde_yaml::Error>;

pub type ExtractorFactory =
    fn(&serde_yaml::Value, RoiOptions) -> Result<Box<dyn RoiExtractor>, serde_yaml::Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RegistryError {
    /// No stage registered under '{name}'
    UnknownStage { name: String },

    /// No ROI extractor registered under '{name}' (target '{target}')
    UnknownExtractor { target: String, name: String },

    /// Invalid parameters for '{name}'
    InvalidParameters {
        name: String,
        source: serde_yaml::Error,
    },

    /// Channel '{channel}' does not name an intermediate image
    UnknownChannel { channel: String },

    /// ROI target '{target}' shadows a built-in intermediate image
    ChannelCollision { target: String },
}

/// Deserializes a stage parameter block.
pub(crate) fn params<T: DeserializeOwned>(value: &serde_yaml::Value) -> Result<T, serde_yaml::Error> {
    serde_yaml::from_value(value.clone())
}

/// Name to implementation lookup for stages and ROI extractors.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: BTreeMap<String, StageFactory>,
    extractors: BTreeMap<String, ExtractorFactory>,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.stages.keys().collect::<Vec<_>>())
            .field("extractors", &self.extractors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in stage and extractor
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_stage("trim", stages::Trim::build);
        registry.register_stage("align", stages::Align::build);
        registry.register_stage("flip", stages::Flip::build);
        registry.register_stage("normalize", stages::Normalize::build);
        registry.register_stage("padding", stages::Padding::build);
        registry.register_stage("resize", stages::Resize::build);
        registry.register_stage("crop", stages::Crop::build);
        registry.register_extractor("threshold", roi::Threshold::build);
        registry.register_extractor("otsu", roi::Otsu::build);
        registry
    }

    pub fn register_stage(&mut self, name: impl Into<String>, factory: StageFactory) {
        self.stages.insert(name.into(), factory);
    }

    pub fn register_extractor(&mut self, name: impl Into<String>, factory: ExtractorFactory) {
        self.extractors.insert(name.into(), factory);
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(String::as_str)
    }

    pub fn build_stage(
        &self,
        name: &str,
        params: &serde_yaml::Value,
    ) -> Result<Box<dyn Stage>, RegistryError> {
        let factory = self.stages.get(name).context(UnknownStageSnafu { name })?;
        debug!("Building stage {} with {:?}", name, params);
        factory(params).context(InvalidParametersSnafu { name })
    }

    /// Builds the extractor for `target`; its parameter block picks the
    /// implementation through `extractor:` (default `threshold`).
    pub fn build_extractor(
        &self,
        target: &str,
        params: &serde_yaml::Value,
        options: RoiOptions,
    ) -> Result<Box<dyn RoiExtractor>, RegistryError> {
        let name = params
            .get("extractor")
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or(roi::DEFAULT_EXTRACTOR);
        let factory = self
            .extractors
            .get(name)
            .context(UnknownExtractorSnafu { target, name })?;
        debug!(
            "Building ROI extractor {} for {} (gpu: {})",
            name, target, options.gpu
        );
        factory(params, options).context(InvalidParametersSnafu { name: target })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty() -> serde_yaml::Value {
        serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
    }

    #[test]
    fn test_builtins_resolve() {
        let registry = StageRegistry::with_builtins();
        for name in ["trim", "align", "flip", "normalize", "padding", "resize", "crop"] {
            let stage = registry.build_stage(name, &empty()).unwrap();
            assert_eq!(stage.name(), name);
        }
        let extractor = registry
            .build_extractor("breast", &empty(), RoiOptions::default())
            .unwrap();
        assert_eq!(extractor.name(), "threshold");
    }

    #[test]
    fn test_unknown_stage_fails() {
        let registry = StageRegistry::with_builtins();
        assert!(matches!(
            registry.build_stage("sharpen", &empty()).err(),
            Some(RegistryError::UnknownStage { .. })
        ));
        let params: serde_yaml::Value = serde_yaml::from_str("extractor: unet").unwrap();
        assert!(matches!(
            registry
                .build_extractor("breast", &params, RoiOptions { gpu: true })
                .err(),
            Some(RegistryError::UnknownExtractor { .. })
        ));
    }

    #[test]
    fn test_malformed_parameters_fail() {
        let registry = StageRegistry::with_builtins();
        let params: serde_yaml::Value = serde_yaml::from_str("threshold: bright").unwrap();
        assert!(matches!(
            registry.build_stage("trim", &params).err(),
            Some(RegistryError::InvalidParameters { .. })
        ));
    }

    struct Invert;

    impl Stage for Invert {
        fn name(&self) -> &str {
            "invert"
        }

        fn apply(&self, image: ImageTensor) -> Result<ImageTensor, StageError> {
            image
                .map_planes(|p| {
                    let mut p = p.clone();
                    crate::utils::image_processing::invert(&mut p);
                    p
                })
                .context(TensorSnafu)
        }
    }

    #[test]
    fn test_register_custom_stage() {
        let mut registry = StageRegistry::new();
        registry.register_stage("invert", |_| Ok(Box::new(Invert) as Box<dyn Stage>));
        let stage = registry.build_stage("invert", &empty()).unwrap();
        let out = stage.apply(ImageTensor::filled(2, 2, 1, 10)).unwrap();
        assert!(out.data().iter().all(|&v| v == 245));
        assert_eq!(registry.stage_names().collect::<Vec<_>>(), vec!["invert"]);
    }
}
