//! DICOM decoding: vendor imaging files to an 8-bit grayscale pixel grid.
//!
//! The rest of the crate only sees the [`ImageDecoder`] trait. Tests plug in
//! decoders that read plain images; production runs use [`DicomDecoder`].

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

use dicom_core::header::Tag;
use dicom_dictionary_std::tags;
use dicom_object::{open_file, DefaultDicomObject};
use serde::Deserialize;
use snafu::prelude::*;
use tracing::debug;

#[cfg(feature = "transcode")]
use dicom_pixeldata::PixelDecoder;

use crate::utils::image_processing::{
    convert_grayscale_pixels, convert_rgb_to_grayscale, invert, Rescale, Window,
};
use crate::utils::{ImageTensor, TensorError};

#[derive(Debug, Snafu)]
pub enum DecodeError {
    /// DICOMDIR files carry no image
    FileNotSupported,

    /// Error reading a file
    ReadFilePath {
        path: String,
        source: Box<dicom_object::ReadError>,
    },

    MissingAttribute {
        tag: Tag,
        source: dicom_object::AccessError,
    },

    ConvertField {
        tag: Tag,
        source: dicom_core::value::ConvertValueError,
    },

    #[snafu(display("Could not decode pixel data: {message}"))]
    PixelData { message: String },

    #[snafu(display("Unsupported pixel format: {message}"))]
    UnsupportedPixelFormat { message: String },

    /// Decoded pixels do not form a valid image
    Tensor { source: TensorError },

    /// Could not read image file
    ReadImage {
        path: String,
        #[snafu(source(from(image::ImageError, Box::new)))]
        source: Box<image::ImageError>,
    },
}

/// Orientation metadata carried along with the pixels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Orientation {
    pub image_laterality: Option<String>,
    pub patient_orientation: Option<String>,
    pub view_position: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub gray: ImageTensor,
    pub orientation: Orientation,
}

/// Opaque decode step: one raw study file in, one grayscale grid out.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<DecodedImage, DecodeError>;
}

/// Kind of source files a dataset holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    #[default]
    Dicom,
    Raster,
}

/// Decoder options, read from the `decode` block of the configuration
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DecodeOptions {
    #[serde(default)]
    pub format: SourceFormat,
    /// Use the window center/width stored in the file for 16-bit data
    #[serde(default = "default_apply_voi_lut")]
    pub apply_voi_lut: bool,
}

fn default_apply_voi_lut() -> bool {
    true
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            format: SourceFormat::default(),
            apply_voi_lut: default_apply_voi_lut(),
        }
    }
}

/// Decoder matching the configured source format
pub fn decoder_for(options: DecodeOptions) -> Arc<dyn ImageDecoder> {
    match options.format {
        SourceFormat::Dicom => Arc::new(DicomDecoder::new(options)),
        SourceFormat::Raster => Arc::new(RasterDecoder),
    }
}

#[derive(Debug, Clone, Default)]
pub struct DicomDecoder {
    options: DecodeOptions,
}

impl DicomDecoder {
    pub fn new(options: DecodeOptions) -> Self {
        Self { options }
    }
}

impl ImageDecoder for DicomDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedImage, DecodeError> {
        // Ignore DICOMDIR files, they index other files
        let _ = (path.file_name() != Some(OsStr::new("DICOMDIR")))
            .then_some(false)
            .context(FileNotSupportedSnafu)?;

        let obj = open_file(path)
            .map_err(Box::from)
            .context(ReadFilePathSnafu {
                path: path.display().to_string(),
            })?;
        debug!("Decoding {}", path.display());

        decode_object(&obj, &self.options)
    }
}

fn required_u32(obj: &DefaultDicomObject, tag: Tag) -> Result<u32, DecodeError> {
    obj.element(tag)
        .context(MissingAttributeSnafu { tag })?
        .to_int::<u32>()
        .context(ConvertFieldSnafu { tag })
}

fn optional_u16(obj: &DefaultDicomObject, tag: Tag) -> Option<u16> {
    obj.element(tag).ok().and_then(|e| e.to_int::<u16>().ok())
}

fn optional_f64(obj: &DefaultDicomObject, tag: Tag) -> Option<f64> {
    obj.element(tag).ok().and_then(|e| e.to_float64().ok())
}

fn optional_str(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn read_orientation(obj: &DefaultDicomObject) -> Orientation {
    Orientation {
        image_laterality: optional_str(obj, tags::IMAGE_LATERALITY)
            .or_else(|| optional_str(obj, tags::LATERALITY)),
        patient_orientation: optional_str(obj, tags::PATIENT_ORIENTATION),
        view_position: optional_str(obj, tags::VIEW_POSITION),
    }
}

/// Native little endian pixel bytes, decompressing when needed
#[cfg(feature = "transcode")]
fn pixel_bytes(obj: &DefaultDicomObject) -> Result<Vec<u8>, DecodeError> {
    let decoded = obj.decode_pixel_data().map_err(|e| DecodeError::PixelData {
        message: e.to_string(),
    })?;
    Ok(decoded.data().to_vec())
}

#[cfg(not(feature = "transcode"))]
fn pixel_bytes(obj: &DefaultDicomObject) -> Result<Vec<u8>, DecodeError> {
    use dicom_encoding::TransferSyntaxIndex;
    use dicom_transfer_syntax_registry::TransferSyntaxRegistry;

    let ts_uid = obj.meta().transfer_syntax();
    let codec_free = TransferSyntaxRegistry
        .get(ts_uid)
        .map(|ts| ts.is_codec_free())
        .unwrap_or(false);
    if !codec_free {
        return UnsupportedPixelFormatSnafu {
            message: format!(
                "transfer syntax {} needs the 'transcode' feature",
                ts_uid
            ),
        }
        .fail();
    }

    let pixel_data = obj
        .element(tags::PIXEL_DATA)
        .context(MissingAttributeSnafu {
            tag: tags::PIXEL_DATA,
        })?;
    let bytes = pixel_data.to_bytes().map_err(|e| DecodeError::PixelData {
        message: e.to_string(),
    })?;
    Ok(bytes.to_vec())
}

/// Decode the first frame of a DICOM object to an 8-bit gray tensor.
pub fn decode_object(
    obj: &DefaultDicomObject,
    options: &DecodeOptions,
) -> Result<DecodedImage, DecodeError> {
    let rows = required_u32(obj, tags::ROWS)?;
    let cols = required_u32(obj, tags::COLUMNS)?;
    let bits_allocated = optional_u16(obj, tags::BITS_ALLOCATED).unwrap_or(16);
    let samples_per_pixel = optional_u16(obj, tags::SAMPLES_PER_PIXEL).unwrap_or(1);
    let pixel_representation = optional_u16(obj, tags::PIXEL_REPRESENTATION).unwrap_or(0);
    let photometric = optional_str(obj, tags::PHOTOMETRIC_INTERPRETATION)
        .unwrap_or_else(|| "MONOCHROME2".to_string());

    let rescale = match (
        optional_f64(obj, tags::RESCALE_SLOPE),
        optional_f64(obj, tags::RESCALE_INTERCEPT),
    ) {
        (Some(slope), Some(intercept)) => Some(Rescale { slope, intercept }),
        _ => None,
    };
    let window = if options.apply_voi_lut {
        match (
            optional_f64(obj, tags::WINDOW_CENTER),
            optional_f64(obj, tags::WINDOW_WIDTH),
        ) {
            (Some(center), Some(width)) => Some(Window { center, width }),
            _ => None,
        }
    } else {
        None
    };

    let raw = pixel_bytes(obj)?;

    let mut gray = match samples_per_pixel {
        1 => convert_grayscale_pixels(
            &raw,
            cols,
            rows,
            bits_allocated,
            pixel_representation,
            window,
            rescale,
        ),
        3 => convert_rgb_to_grayscale(&raw, cols, rows, bits_allocated),
        other => Err(format!("samples per pixel {}", other)),
    }
    .map_err(|message| DecodeError::UnsupportedPixelFormat { message })?;

    if photometric == "MONOCHROME1" {
        invert(&mut gray);
    }

    Ok(DecodedImage {
        gray: ImageTensor::from_gray(gray),
        orientation: read_orientation(obj),
    })
}

/// Decoder for already-rendered images (PNG, TIFF, ...), read through the
/// `image` crate and collapsed to gray. Selected with `decode.format: raster`.
#[derive(Debug, Clone, Default)]
pub struct RasterDecoder;

impl ImageDecoder for RasterDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedImage, DecodeError> {
        // crosswalk file names need not carry an image extension
        let img = image::ImageReader::open(path)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(image::ImageError::IoError)
            .and_then(|reader| reader.decode())
            .context(ReadImageSnafu {
                path: path.display().to_string(),
            })?;
        let gray = ImageTensor::from_dynamic(img).collapse_to_gray();
        Ok(DecodedImage {
            gray: ImageTensor::from_gray(gray),
            orientation: Orientation::default(),
        })
    }
}
