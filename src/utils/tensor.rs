use image::{DynamicImage, GrayImage, ImageBuffer, Luma, LumaA, Rgb, Rgba};
use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum TensorError {
    /// Buffer of {actual} bytes does not match {width}x{height}x{channels}
    SizeMismatch {
        width: u32,
        height: u32,
        channels: usize,
        actual: usize,
    },
    /// A tensor needs at least one channel
    NoChannels,
    /// Plane of {actual_width}x{actual_height} cannot be stacked onto {width}x{height}
    DimensionMismatch {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },
    /// Cannot encode a {channels}-channel image
    UnsupportedDepth { channels: usize },
}

/// Interleaved 8-bit H×W×C pixel grid.
///
/// Every intermediate the pipeline produces (the decoded grayscale image,
/// its RGB replication, ROI masks, the composed output) is an `ImageTensor`,
/// so stages only ever deal with one pixel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTensor {
    width: u32,
    height: u32,
    channels: usize,
    data: Vec<u8>,
}

impl ImageTensor {
    pub fn new(width: u32, height: u32, channels: usize, data: Vec<u8>) -> Result<Self, TensorError> {
        ensure!(channels > 0, NoChannelsSnafu);
        let expected = width as usize * height as usize * channels;
        ensure!(
            data.len() == expected,
            SizeMismatchSnafu {
                width,
                height,
                channels,
                actual: data.len(),
            }
        );
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    pub fn filled(width: u32, height: u32, channels: usize, value: u8) -> Self {
        Self {
            width,
            height,
            channels: channels.max(1),
            data: vec![value; width as usize * height as usize * channels.max(1)],
        }
    }

    pub fn from_gray(img: GrayImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            channels: 1,
            data: img.into_raw(),
        }
    }

    /// Converts any decoded image into a tensor, keeping 1-4 channel 8-bit
    /// layouts as-is and folding everything else to RGB.
    pub fn from_dynamic(img: DynamicImage) -> Self {
        let (width, height) = (img.width(), img.height());
        let (channels, data) = match img {
            DynamicImage::ImageLuma8(buf) => (1, buf.into_raw()),
            DynamicImage::ImageLumaA8(buf) => (2, buf.into_raw()),
            DynamicImage::ImageRgba8(buf) => (4, buf.into_raw()),
            other => (3, other.into_rgb8().into_raw()),
        };
        Self {
            width,
            height,
            channels,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn get(&self, x: u32, y: u32, channel: usize) -> u8 {
        self.data[self.offset(x, y) + channel]
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * self.channels
    }

    /// Copies one channel out as a grayscale plane.
    pub fn plane(&self, channel: usize) -> GrayImage {
        let raw: Vec<u8> = self
            .data
            .iter()
            .skip(channel)
            .step_by(self.channels)
            .copied()
            .collect();
        ImageBuffer::from_raw(self.width, self.height, raw)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    pub fn planes(&self) -> Vec<GrayImage> {
        (0..self.channels).map(|c| self.plane(c)).collect()
    }

    /// Stacks single-intensity planes into one tensor, in order.
    pub fn from_planes(planes: &[GrayImage]) -> Result<Self, TensorError> {
        let first = planes.first().context(NoChannelsSnafu)?;
        let (width, height) = first.dimensions();
        for plane in planes {
            let (actual_width, actual_height) = plane.dimensions();
            ensure!(
                actual_width == width && actual_height == height,
                DimensionMismatchSnafu {
                    width,
                    height,
                    actual_width,
                    actual_height,
                }
            );
        }

        let channels = planes.len();
        let mut data = Vec::with_capacity(width as usize * height as usize * channels);
        for i in 0..(width as usize * height as usize) {
            for plane in planes {
                data.push(plane.as_raw()[i]);
            }
        }
        Self::new(width, height, channels, data)
    }

    /// Applies `f` to every channel plane and restacks the results.
    pub fn map_planes<F>(&self, mut f: F) -> Result<Self, TensorError>
    where
        F: FnMut(&GrayImage) -> GrayImage,
    {
        let planes: Vec<GrayImage> = self.planes().iter().map(|p| f(p)).collect();
        Self::from_planes(&planes)
    }

    /// Collapses the tensor to a single intensity plane.
    ///
    /// Three and four channel images use the luminosity weights; a
    /// luma+alpha pair keeps its luma.
    pub fn collapse_to_gray(&self) -> GrayImage {
        match self.channels {
            3 | 4 => {
                let raw: Vec<u8> = self
                    .data
                    .chunks_exact(self.channels)
                    .map(|px| super::image_processing::luminosity(px[0], px[1], px[2]))
                    .collect();
                ImageBuffer::from_raw(self.width, self.height, raw)
                    .unwrap_or_else(|| GrayImage::new(self.width, self.height))
            }
            _ => self.plane(0),
        }
    }

    /// Replicates a gray tensor into three identical channels.
    pub fn replicate_to_rgb(&self) -> Self {
        if self.channels == 3 {
            return self.clone();
        }
        let gray = self.collapse_to_gray();
        let data = gray.as_raw().iter().flat_map(|&v| [v, v, v]).collect();
        Self {
            width: self.width,
            height: self.height,
            channels: 3,
            data,
        }
    }

    pub fn to_dynamic(&self) -> Result<DynamicImage, TensorError> {
        let (w, h) = (self.width, self.height);
        let data = self.data.clone();
        let image = match self.channels {
            1 => ImageBuffer::<Luma<u8>, _>::from_raw(w, h, data).map(DynamicImage::ImageLuma8),
            2 => ImageBuffer::<LumaA<u8>, _>::from_raw(w, h, data).map(DynamicImage::ImageLumaA8),
            3 => ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, data).map(DynamicImage::ImageRgb8),
            4 => ImageBuffer::<Rgba<u8>, _>::from_raw(w, h, data).map(DynamicImage::ImageRgba8),
            channels => return UnsupportedDepthSnafu { channels }.fail(),
        };
        image.context(SizeMismatchSnafu {
            width: w,
            height: h,
            channels: self.channels,
            actual: self.data.len(),
        })
    }
}
