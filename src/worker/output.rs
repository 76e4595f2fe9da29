use std::path::{Path, PathBuf};

use clap::ValueEnum;
use image::ImageFormat;
use snafu::prelude::*;

use crate::utils::{ImageTensor, TensorError};

/// Directory layout of written images
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputForm {
    /// `<label>/<subject>_<exam>_<view>_<laterality>.png`
    Class,
    /// `<subject>/<exam>/<laterality>/<view>.png`
    Robust,
}

impl std::fmt::Display for OutputForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputForm::Class => write!(f, "class"),
            OutputForm::Robust => write!(f, "robust"),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum OutputError {
    /// Could not create directory {path}
    CreateDir {
        path: String,
        source: std::io::Error,
    },

    /// Could not encode image for {path}
    Encode { path: String, source: TensorError },

    /// Could not write image {path}
    WriteImage {
        path: String,
        #[snafu(source(from(image::ImageError, Box::new)))]
        source: Box<image::ImageError>,
    },
}

/// Identity of one written image
#[derive(Debug, Clone, Copy)]
pub struct ImageMeta<'a> {
    pub subject_id: &'a str,
    pub exam_index: &'a str,
    pub view: &'a str,
    pub laterality: &'a str,
    pub label: &'a str,
}

/// Writes composed tensors as lossless PNG under one target directory.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    form: OutputForm,
    target_dir: PathBuf,
}

impl OutputWriter {
    pub fn new(form: OutputForm, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            form,
            target_dir: target_dir.into(),
        }
    }

    pub fn form(&self) -> OutputForm {
        self.form
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    pub fn image_path(&self, meta: &ImageMeta<'_>) -> PathBuf {
        match self.form {
            OutputForm::Class => self.target_dir.join(meta.label).join(format!(
                "{}_{}_{}_{}.png",
                meta.subject_id, meta.exam_index, meta.view, meta.laterality
            )),
            OutputForm::Robust => self
                .target_dir
                .join(meta.subject_id)
                .join(meta.exam_index)
                .join(meta.laterality)
                .join(format!("{}.png", meta.view)),
        }
    }

    pub fn write(&self, meta: &ImageMeta<'_>, image: &ImageTensor) -> Result<PathBuf, OutputError> {
        let path = self.image_path(meta);
        let display = path.display().to_string();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                path: parent.display().to_string(),
            })?;
        }
        let encoded = image.to_dynamic().context(EncodeSnafu { path: &display })?;
        encoded
            .save_with_format(&path, ImageFormat::Png)
            .context(WriteImageSnafu { path: display })?;
        Ok(path)
    }
}
