//! Region-of-interest extractors. Both produce a three channel binary mask
//! the size of the input.

use image::{GrayImage, Luma};
use serde::Deserialize;
use snafu::prelude::*;
use tracing::trace;

use super::registry::{params, EmptyImageSnafu, RoiExtractor, RoiOptions, StageError};
use crate::utils::ImageTensor;

pub const DEFAULT_EXTRACTOR: &str = "threshold";

const MASK_ON: u8 = 255;

fn binary_mask(gray: &GrayImage, level: u8) -> ImageTensor {
    let mut mask = gray.clone();
    for Luma([v]) in mask.pixels_mut() {
        *v = if *v > level { MASK_ON } else { 0 };
    }
    ImageTensor::from_gray(mask).replicate_to_rgb()
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ThresholdParams {
    #[serde(default)]
    level: u8,
}

/// Marks every pixel brighter than a fixed level.
#[derive(Debug, Clone, Copy)]
pub struct Threshold {
    pub level: u8,
    pub gpu: bool,
}

impl Threshold {
    pub fn build(
        value: &serde_yaml::Value,
        options: RoiOptions,
    ) -> Result<Box<dyn RoiExtractor>, serde_yaml::Error> {
        Ok(Box::new(Self::from_params(value, options)?))
    }

    pub fn from_params(value: &serde_yaml::Value, options: RoiOptions) -> Result<Self, serde_yaml::Error> {
        let p: ThresholdParams = params(&strip_extractor_key(value))?;
        Ok(Threshold {
            level: p.level,
            gpu: options.gpu,
        })
    }
}

impl RoiExtractor for Threshold {
    fn name(&self) -> &str {
        "threshold"
    }

    fn mask(&self, rgb: &ImageTensor) -> Result<ImageTensor, StageError> {
        ensure!(rgb.width() > 0 && rgb.height() > 0, EmptyImageSnafu);
        trace!("threshold mask at level {} (gpu: {})", self.level, self.gpu);
        Ok(binary_mask(&rgb.collapse_to_gray(), self.level))
    }
}

/// Otsu's method: picks the level maximizing between-class variance.
#[derive(Debug, Clone, Copy)]
pub struct Otsu {
    pub gpu: bool,
}

impl Otsu {
    pub fn build(
        value: &serde_yaml::Value,
        options: RoiOptions,
    ) -> Result<Box<dyn RoiExtractor>, serde_yaml::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct OtsuParams {}
        let _: OtsuParams = params(&strip_extractor_key(value))?;
        Ok(Box::new(Otsu { gpu: options.gpu }))
    }
}

/// The `extractor:` selector lives in the same block as the parameters.
fn strip_extractor_key(value: &serde_yaml::Value) -> serde_yaml::Value {
    let mut value = value.clone();
    if let Some(map) = value.as_mapping_mut() {
        map.remove("extractor");
    }
    value
}

pub fn otsu_level(gray: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for Luma([v]) in gray.pixels() {
        histogram[*v as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 0;
    }
    let sum_all: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &n)| i as f64 * n as f64)
        .sum();

    let (mut weight_bg, mut sum_bg) = (0u64, 0f64);
    let (mut best_level, mut best_variance) = (0u8, -1f64);
    for (level, &count) in histogram.iter().enumerate() {
        weight_bg += count;
        if weight_bg == 0 {
            continue;
        }
        let weight_fg = total - weight_bg;
        if weight_fg == 0 {
            break;
        }
        sum_bg += level as f64 * count as f64;
        let mean_bg = sum_bg / weight_bg as f64;
        let mean_fg = (sum_all - sum_bg) / weight_fg as f64;
        let variance = weight_bg as f64 * weight_fg as f64 * (mean_bg - mean_fg).powi(2);
        if variance > best_variance {
            best_variance = variance;
            best_level = level as u8;
        }
    }
    best_level
}

impl RoiExtractor for Otsu {
    fn name(&self) -> &str {
        "otsu"
    }

    fn mask(&self, rgb: &ImageTensor) -> Result<ImageTensor, StageError> {
        ensure!(rgb.width() > 0 && rgb.height() > 0, EmptyImageSnafu);
        let gray = rgb.collapse_to_gray();
        let level = otsu_level(&gray);
        trace!("otsu mask at level {} (gpu: {})", level, self.gpu);
        Ok(binary_mask(&gray, level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageBuffer;

    fn two_tone() -> ImageTensor {
        let gray: GrayImage =
            ImageBuffer::from_fn(4, 2, |x, _| if x < 2 { Luma([20]) } else { Luma([180]) });
        ImageTensor::from_gray(gray).replicate_to_rgb()
    }

    #[test]
    fn test_threshold_mask() {
        let value: serde_yaml::Value = serde_yaml::from_str("{extractor: threshold, level: 100}").unwrap();
        let extractor = Threshold::build(&value, RoiOptions { gpu: true }).unwrap();
        let mask = extractor.mask(&two_tone()).unwrap();
        assert_eq!(mask.channels(), 3);
        assert_eq!(mask.dimensions(), (4, 2));
        assert_eq!(mask.plane(0).as_raw(), &vec![0, 0, 255, 255, 0, 0, 255, 255]);
    }

    #[test]
    fn test_gpu_flag_is_forwarded() {
        let value: serde_yaml::Value = serde_yaml::from_str("{level: 7}").unwrap();
        let on = Threshold::from_params(&value, RoiOptions { gpu: true }).unwrap();
        let off = Threshold::from_params(&value, RoiOptions { gpu: false }).unwrap();
        assert!(on.gpu);
        assert!(!off.gpu);
        assert_eq!(on.level, 7);
        // the flag is opaque to the CPU masks
        assert_eq!(on.mask(&two_tone()).unwrap(), off.mask(&two_tone()).unwrap());
    }

    #[test]
    fn test_otsu_splits_two_tones() {
        let gray = two_tone().collapse_to_gray();
        let level = otsu_level(&gray);
        assert!((20..180).contains(&level));

        let value = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        let extractor = Otsu::build(&value, RoiOptions::default()).unwrap();
        let mask = extractor.mask(&two_tone()).unwrap();
        assert_eq!(mask.plane(2).as_raw(), &vec![0, 0, 255, 255, 0, 0, 255, 255]);
    }

    #[test]
    fn test_otsu_rejects_unknown_parameters() {
        let value: serde_yaml::Value = serde_yaml::from_str("{extractor: otsu, level: 3}").unwrap();
        assert!(Otsu::build(&value, RoiOptions::default()).is_err());
    }
}
