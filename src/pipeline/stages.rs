//! Built-in image stages. Each works plane by plane so it accepts any depth.

use image::imageops;
use image::{GrayImage, ImageBuffer, Luma};
use serde::Deserialize;
use snafu::prelude::*;

use super::registry::{params, EmptyImageSnafu, Stage, StageError, TensorSnafu};
use crate::utils::image_processing::{apply_window, resize_plane, stretch};
use crate::utils::{parse_size, parse_window, ImageTensor, ResizeFilter, Window};

fn invalid(message: String) -> serde_yaml::Error {
    <serde_yaml::Error as serde::de::Error>::custom(message)
}

/// Crops away border rows and columns no brighter than `threshold`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Trim {
    #[serde(default)]
    pub threshold: u8,
}

impl Trim {
    pub fn build(value: &serde_yaml::Value) -> Result<Box<dyn Stage>, serde_yaml::Error> {
        Ok(Box::new(params::<Trim>(value)?))
    }

    /// Bounding box (x, y, width, height) of pixels above the threshold
    fn bounds(&self, image: &ImageTensor) -> Option<(u32, u32, u32, u32)> {
        let (width, height) = image.dimensions();
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for y in 0..height {
            for x in 0..width {
                let bright = (0..image.channels()).any(|c| image.get(x, y, c) > self.threshold);
                if bright {
                    bounds = Some(match bounds {
                        None => (x, y, x, y),
                        Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
                    });
                }
            }
        }
        bounds.map(|(x0, y0, x1, y1)| (x0, y0, x1 - x0 + 1, y1 - y0 + 1))
    }
}

impl Stage for Trim {
    fn name(&self) -> &str {
        "trim"
    }

    fn apply(&self, image: ImageTensor) -> Result<ImageTensor, StageError> {
        match self.bounds(&image) {
            // nothing above threshold, leave the image as-is
            None => Ok(image),
            Some((x, y, w, h)) if (x, y, w, h) == (0, 0, image.width(), image.height()) => {
                Ok(image)
            }
            Some((x, y, w, h)) => image
                .map_planes(|p| imageops::crop_imm(p, x, y, w, h).to_image())
                .context(TensorSnafu),
        }
    }
}

/// Mirrors the image so the side holding more intensity sits on the left.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Align {}

impl Align {
    pub fn build(value: &serde_yaml::Value) -> Result<Box<dyn Stage>, serde_yaml::Error> {
        Ok(Box::new(params::<Align>(value)?))
    }

    fn needs_flip(image: &ImageTensor) -> bool {
        let gray = image.collapse_to_gray();
        let half = gray.width() / 2;
        let (mut left, mut right) = (0u64, 0u64);
        for (x, _, Luma([v])) in gray.enumerate_pixels() {
            if x < half {
                left += *v as u64;
            } else if x >= gray.width() - half {
                right += *v as u64;
            }
        }
        right > left
    }
}

impl Stage for Align {
    fn name(&self) -> &str {
        "align"
    }

    fn apply(&self, image: ImageTensor) -> Result<ImageTensor, StageError> {
        if Self::needs_flip(&image) {
            image
                .map_planes(imageops::flip_horizontal)
                .context(TensorSnafu)
        } else {
            Ok(image)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    #[default]
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Flip {
    #[serde(default)]
    pub axis: Axis,
}

impl Flip {
    pub fn build(value: &serde_yaml::Value) -> Result<Box<dyn Stage>, serde_yaml::Error> {
        Ok(Box::new(params::<Flip>(value)?))
    }
}

impl Stage for Flip {
    fn name(&self) -> &str {
        "flip"
    }

    fn apply(&self, image: ImageTensor) -> Result<ImageTensor, StageError> {
        let f = match self.axis {
            Axis::Horizontal => imageops::flip_horizontal::<GrayImage>,
            Axis::Vertical => imageops::flip_vertical::<GrayImage>,
        };
        image.map_planes(f).context(TensorSnafu)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NormalizeParams {
    #[serde(default)]
    window: Option<String>,
}

/// Contrast normalization: a fixed window when configured, otherwise a
/// per-plane min-max stretch.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalize {
    pub window: Option<Window>,
}

impl Normalize {
    pub fn build(value: &serde_yaml::Value) -> Result<Box<dyn Stage>, serde_yaml::Error> {
        let raw: NormalizeParams = params(value)?;
        let window = raw
            .window
            .as_deref()
            .map(parse_window)
            .transpose()
            .map_err(invalid)?;
        Ok(Box::new(Normalize { window }))
    }
}

impl Stage for Normalize {
    fn name(&self) -> &str {
        "normalize"
    }

    fn apply(&self, image: ImageTensor) -> Result<ImageTensor, StageError> {
        match self.window {
            Some(window) => image.map_planes(|p| apply_window(p, window)),
            None => image.map_planes(stretch),
        }
        .context(TensorSnafu)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anchor {
    #[default]
    Start,
    Center,
}

/// Pads to a square canvas of side max(width, height).
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Padding {
    #[serde(default)]
    pub fill: u8,
    #[serde(default)]
    pub anchor: Anchor,
}

impl Padding {
    pub fn build(value: &serde_yaml::Value) -> Result<Box<dyn Stage>, serde_yaml::Error> {
        Ok(Box::new(params::<Padding>(value)?))
    }
}

impl Stage for Padding {
    fn name(&self) -> &str {
        "padding"
    }

    fn apply(&self, image: ImageTensor) -> Result<ImageTensor, StageError> {
        let (width, height) = image.dimensions();
        if width == height {
            return Ok(image);
        }
        let side = width.max(height);
        let (x, y) = match self.anchor {
            Anchor::Start => (0, 0),
            Anchor::Center => ((side - width) / 2, (side - height) / 2),
        };
        image
            .map_planes(|p| {
                let mut canvas: GrayImage = ImageBuffer::from_pixel(side, side, Luma([self.fill]));
                imageops::replace(&mut canvas, p, x as i64, y as i64);
                canvas
            })
            .context(TensorSnafu)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResizeParams {
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    /// "W,H" or "WxH", overrides width/height
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    filter: ResizeFilter,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Resize {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub filter: ResizeFilter,
}

impl Resize {
    pub fn build(value: &serde_yaml::Value) -> Result<Box<dyn Stage>, serde_yaml::Error> {
        let raw: ResizeParams = params(value)?;
        let (width, height) = match raw.size.as_deref() {
            Some(size) => {
                let (w, h) = parse_size(size).map_err(invalid)?;
                (Some(w), Some(h))
            }
            None => (raw.width, raw.height),
        };
        if width == Some(0) || height == Some(0) {
            return Err(invalid("resize dimensions must be positive".to_string()));
        }
        Ok(Box::new(Resize {
            width,
            height,
            filter: raw.filter,
        }))
    }
}

impl Stage for Resize {
    fn name(&self) -> &str {
        "resize"
    }

    fn apply(&self, image: ImageTensor) -> Result<ImageTensor, StageError> {
        ensure!(image.width() > 0 && image.height() > 0, EmptyImageSnafu);
        image
            .map_planes(|p| resize_plane(p, self.width, self.height, self.filter))
            .context(TensorSnafu)
    }
}

/// Center crop, clamped to the image size.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Crop {
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl Crop {
    pub fn build(value: &serde_yaml::Value) -> Result<Box<dyn Stage>, serde_yaml::Error> {
        Ok(Box::new(params::<Crop>(value)?))
    }
}

impl Stage for Crop {
    fn name(&self) -> &str {
        "crop"
    }

    fn apply(&self, image: ImageTensor) -> Result<ImageTensor, StageError> {
        let (width, height) = image.dimensions();
        let w = self.width.unwrap_or(width).min(width);
        let h = self.height.unwrap_or(height).min(height);
        if (w, h) == (width, height) {
            return Ok(image);
        }
        let (x, y) = ((width - w) / 2, (height - h) / 2);
        image
            .map_planes(|p| imageops::crop_imm(p, x, y, w, h).to_image())
            .context(TensorSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(width: u32, height: u32, pixels: &[u8]) -> ImageTensor {
        ImageTensor::new(width, height, 1, pixels.to_vec()).unwrap()
    }

    fn yaml(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_trim_removes_dark_border() {
        #[rustfmt::skip]
        let image = tensor(4, 3, &[
            0, 0, 0, 0,
            0, 9, 7, 0,
            0, 0, 0, 0,
        ]);
        let out = Trim::default().apply(image).unwrap();
        assert_eq!(out.dimensions(), (2, 1));
        assert_eq!(out.data(), &[9, 7]);

        let blank = tensor(2, 2, &[0; 4]);
        assert_eq!(Trim::default().apply(blank.clone()).unwrap(), blank);
    }

    #[test]
    fn test_align_moves_mass_left() {
        let right_heavy = tensor(4, 1, &[0, 0, 10, 200]);
        let out = Align::default().apply(right_heavy).unwrap();
        assert_eq!(out.data(), &[200, 10, 0, 0]);

        let left_heavy = tensor(4, 1, &[200, 10, 0, 0]);
        assert_eq!(Align::default().apply(left_heavy.clone()).unwrap(), left_heavy);
    }

    #[test]
    fn test_flip_vertical() {
        let stage = Flip::build(&yaml("axis: vertical")).unwrap();
        let out = stage.apply(tensor(1, 3, &[1, 2, 3])).unwrap();
        assert_eq!(out.data(), &[3, 2, 1]);
    }

    #[test]
    fn test_normalize_stretch_and_window() {
        let out = Normalize::default().apply(tensor(3, 1, &[10, 20, 30])).unwrap();
        assert_eq!(out.data(), &[0, 127, 255]);

        let stage = Normalize::build(&yaml("window: \"100,100\"")).unwrap();
        let out = stage.apply(tensor(3, 1, &[40, 100, 160])).unwrap();
        assert_eq!(out.data(), &[0, 127, 255]);

        assert!(Normalize::build(&yaml("window: wide")).is_err());
    }

    #[test]
    fn test_padding_to_square() {
        let stage = Padding::build(&yaml("{fill: 5, anchor: center}")).unwrap();
        let out = stage.apply(tensor(1, 3, &[1, 2, 3])).unwrap();
        assert_eq!(out.dimensions(), (3, 3));
        assert_eq!(out.data(), &[5, 1, 5, 5, 2, 5, 5, 3, 5]);

        let out = Padding::default().apply(tensor(2, 1, &[7, 8])).unwrap();
        assert_eq!(out.data(), &[7, 8, 0, 0]);
    }

    #[test]
    fn test_resize_and_crop() {
        let stage = Resize::build(&yaml("{size: 4x2, filter: nearest}")).unwrap();
        let out = stage.apply(ImageTensor::filled(8, 8, 2, 50)).unwrap();
        assert_eq!(out.dimensions(), (4, 2));
        assert_eq!(out.channels(), 2);
        assert!(Resize::build(&yaml("width: 0")).is_err());

        let stage = Crop::build(&yaml("{width: 2, height: 10}")).unwrap();
        let out = stage.apply(tensor(4, 2, &[1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        assert_eq!(out.dimensions(), (2, 2));
        assert_eq!(out.data(), &[2, 3, 6, 7]);
    }
}
