use image::imageops::FilterType;
use image::{GrayImage, ImageBuffer, Luma};
use serde::Deserialize;

/// Rescale (modality LUT) parameters read from the file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rescale {
    pub slope: f64,
    pub intercept: f64,
}

/// Grayscale window (VOI) as center/width
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub center: f64,
    pub width: f64,
}

/// Luminosity method, integer rounded so equal channels map to themselves
pub fn luminosity(r: u8, g: u8, b: u8) -> u8 {
    ((299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000) as u8
}

/// Convert monochrome pixel data to an 8-bit grayscale plane.
///
/// 8-bit data is copied as-is. 16-bit data is rescaled when slope and
/// intercept are known, then windowed to 0-255 using `window` or, when no
/// window applies, the min/max of the frame.
pub fn convert_grayscale_pixels(
    raw_pixels: &[u8],
    cols: u32,
    rows: u32,
    bits_allocated: u16,
    pixel_representation: u16,
    window: Option<Window>,
    rescale: Option<Rescale>,
) -> Result<GrayImage, String> {
    let pixel_count = rows as usize * cols as usize;

    match bits_allocated {
        8 => {
            if raw_pixels.len() < pixel_count {
                return Err(format!(
                    "Pixel data too short: {} bytes for {}x{}",
                    raw_pixels.len(),
                    cols,
                    rows
                ));
            }
            ImageBuffer::from_raw(cols, rows, raw_pixels[..pixel_count].to_vec())
                .ok_or_else(|| "Failed to build 8-bit image buffer".to_string())
        }
        16 => {
            if raw_pixels.len() < pixel_count * 2 {
                return Err(format!(
                    "Pixel data too short: {} bytes for {}x{} at 16 bits",
                    raw_pixels.len(),
                    cols,
                    rows
                ));
            }
            let samples: Vec<f64> = raw_pixels
                .chunks_exact(2)
                .take(pixel_count)
                .map(|chunk| {
                    if pixel_representation == 0 {
                        u16::from_le_bytes([chunk[0], chunk[1]]) as f64
                    } else {
                        i16::from_le_bytes([chunk[0], chunk[1]]) as f64
                    }
                })
                .map(|p| match rescale {
                    Some(r) => p * r.slope + r.intercept,
                    None => p,
                })
                .collect();

            let (min_val, max_val) = match window {
                Some(w) => (w.center - w.width / 2.0, w.center + w.width / 2.0),
                None => (
                    samples.iter().cloned().fold(f64::INFINITY, f64::min),
                    samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                ),
            };
            let out = window_to_u8(&samples, min_val, max_val);
            ImageBuffer::from_raw(cols, rows, out)
                .ok_or_else(|| "Failed to build 16-bit image buffer".to_string())
        }
        other => Err(format!("Unsupported bits allocated: {}", other)),
    }
}

fn window_to_u8(samples: &[f64], min_val: f64, max_val: f64) -> Vec<u8> {
    // Avoid division by zero
    let range = if (max_val - min_val).abs() < 1e-6 {
        1.0
    } else {
        max_val - min_val
    };

    samples
        .iter()
        .map(|&v| {
            if v <= min_val {
                0u8
            } else if v >= max_val {
                255u8
            } else {
                (((v - min_val) / range) * 255.0) as u8
            }
        })
        .collect()
}

/// Convert interleaved 8-bit RGB pixel data to grayscale
pub fn convert_rgb_to_grayscale(
    raw_pixels: &[u8],
    cols: u32,
    rows: u32,
    bits_allocated: u16,
) -> Result<GrayImage, String> {
    if bits_allocated != 8 {
        return Err(format!("Unsupported bits allocated for RGB: {}", bits_allocated));
    }
    let pixel_count = rows as usize * cols as usize;
    if raw_pixels.len() < pixel_count * 3 {
        return Err(format!(
            "Pixel data too short: {} bytes for {}x{} RGB",
            raw_pixels.len(),
            cols,
            rows
        ));
    }
    let out: Vec<u8> = raw_pixels
        .chunks_exact(3)
        .take(pixel_count)
        .map(|px| luminosity(px[0], px[1], px[2]))
        .collect();
    ImageBuffer::from_raw(cols, rows, out).ok_or_else(|| "Failed to build RGB image buffer".to_string())
}

/// Invert a plane in place (MONOCHROME1 to MONOCHROME2)
pub fn invert(img: &mut GrayImage) {
    for Luma([v]) in img.pixels_mut() {
        *v = 255 - *v;
    }
}

/// Stretch a plane linearly so its darkest pixel is 0 and brightest 255
pub fn stretch(img: &GrayImage) -> GrayImage {
    let (lo, hi) = img
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), Luma([v])| (lo.min(*v), hi.max(*v)));
    if hi <= lo {
        return img.clone();
    }
    let samples: Vec<f64> = img.as_raw().iter().map(|&v| v as f64).collect();
    let out = window_to_u8(&samples, lo as f64, hi as f64);
    ImageBuffer::from_raw(img.width(), img.height(), out).unwrap_or_else(|| img.clone())
}

/// Apply a center/width window to an 8-bit plane
pub fn apply_window(img: &GrayImage, window: Window) -> GrayImage {
    let samples: Vec<f64> = img.as_raw().iter().map(|&v| v as f64).collect();
    let out = window_to_u8(
        &samples,
        window.center - window.width / 2.0,
        window.center + window.width / 2.0,
    );
    ImageBuffer::from_raw(img.width(), img.height(), out).unwrap_or_else(|| img.clone())
}

/// Resampling filter accepted by the resize stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeFilter {
    Nearest,
    Triangle,
    #[default]
    Lanczos3,
}

impl From<ResizeFilter> for FilterType {
    fn from(filter: ResizeFilter) -> Self {
        match filter {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Triangle => FilterType::Triangle,
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// Resize one plane, keeping aspect ratio when only one side is given
pub fn resize_plane(
    img: &GrayImage,
    target_width: Option<u32>,
    target_height: Option<u32>,
    filter: ResizeFilter,
) -> GrayImage {
    let (orig_width, orig_height) = img.dimensions();

    let (new_width, new_height) = match (target_width, target_height) {
        (Some(w), Some(h)) => (w, h),
        (Some(w), None) => {
            let aspect = orig_height as f32 / orig_width.max(1) as f32;
            (w, ((w as f32 * aspect) as u32).max(1))
        }
        (None, Some(h)) => {
            let aspect = orig_width as f32 / orig_height.max(1) as f32;
            (((h as f32 * aspect) as u32).max(1), h)
        }
        (None, None) => return img.clone(),
    };

    image::imageops::resize(img, new_width, new_height, filter.into())
}

/// Parse a size string (e.g., "512,512" or "512x512") into (width, height)
pub fn parse_size(size: &str) -> Result<(u32, u32), String> {
    let parts: Vec<&str> = if size.contains(',') {
        size.split(',').collect()
    } else if size.contains('x') {
        size.split('x').collect()
    } else {
        return Err(format!("Invalid size format: {}", size));
    };

    if parts.len() != 2 {
        return Err(format!("Invalid size format: {}", size));
    }

    let width = parts[0]
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("Invalid width: {}", parts[0]))?;
    let height = parts[1]
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("Invalid height: {}", parts[1]))?;

    Ok((width, height))
}

/// Parse a window string (e.g., "40,400") into center and width
pub fn parse_window(window: &str) -> Result<Window, String> {
    let parts: Vec<&str> = window.split(',').collect();

    if parts.len() != 2 {
        return Err(format!("Invalid window format: {}", window));
    }

    let center = parts[0]
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("Invalid window center: {}", parts[0]))?;
    let width = parts[1]
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("Invalid window width: {}", parts[1]))?;

    Ok(Window { center, width })
}
