//! Crosswalk and exam metadata indexes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use snafu::prelude::*;
use tracing::{debug, info};

#[derive(Debug, Snafu)]
pub enum MetadataError {
    #[snafu(display("Could not read metadata table {}", path.display()))]
    ReadTable {
        path: PathBuf,
        #[snafu(source(from(csv::Error, Box::new)))]
        source: Box<csv::Error>,
    },

    #[snafu(display("Column {column} missing from header of {}", path.display()))]
    MissingColumn { path: PathBuf, column: String },

    #[snafu(display("Row {line} of {} has no {field}", path.display()))]
    MissingField {
        path: PathBuf,
        line: u64,
        field: String,
    },
}

/// One clinical study: subject plus exam number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExamKey {
    pub subject_id: String,
    pub exam_index: String,
}

impl ExamKey {
    pub fn new(subject_id: impl Into<String>, exam_index: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            exam_index: exam_index.into(),
        }
    }
}

impl fmt::Display for ExamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject_id, self.exam_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub image_index: String,
    pub filename: String,
    pub cancer: Option<String>,
}

/// view -> laterality -> record
pub type ExamImages = BTreeMap<String, BTreeMap<String, ImageRecord>>;

/// Per-image crosswalk index, grouped by exam.
///
/// Keys keep the order in which they first appear in the crosswalk.
#[derive(Debug, Clone, Default)]
pub struct ImageIndex {
    order: Vec<ExamKey>,
    exams: HashMap<ExamKey, ExamImages>,
}

impl ImageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record; a later (view, laterality) duplicate replaces the
    /// earlier one.
    pub fn insert(&mut self, key: ExamKey, view: String, laterality: String, record: ImageRecord) {
        if !self.exams.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.exams
            .entry(key)
            .or_default()
            .entry(view)
            .or_default()
            .insert(laterality, record);
    }

    /// Number of exams
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn keys(&self) -> &[ExamKey] {
        &self.order
    }

    pub fn get(&self, key: &ExamKey) -> Option<&ExamImages> {
        self.exams.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ExamKey, &ExamImages)> {
        self.order
            .iter()
            .filter_map(move |k| self.exams.get(k).map(|images| (k, images)))
    }

    pub fn image_count(&self) -> usize {
        self.exams
            .values()
            .map(|views| views.values().map(BTreeMap::len).sum::<usize>())
            .sum()
    }

    /// Copy of the index restricted to `keys`, in the order given.
    pub fn subset<'a>(&self, keys: impl IntoIterator<Item = &'a ExamKey>) -> ImageIndex {
        let mut out = ImageIndex::new();
        for key in keys {
            if let Some(images) = self.exams.get(key) {
                if !out.exams.contains_key(key) {
                    out.order.push(key.clone());
                    out.exams.insert(key.clone(), images.clone());
                }
            }
        }
        out
    }
}

/// Exam-level clinical rows, keyed by exam.
#[derive(Debug, Clone, Default)]
pub struct ExamIndex {
    rows: HashMap<ExamKey, HashMap<String, String>>,
}

impl ExamIndex {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, key: &ExamKey) -> Option<&HashMap<String, String>> {
        self.rows.get(key)
    }

    /// Value of the `cancer<laterality>` column for this exam
    pub fn cancer_label(&self, key: &ExamKey, laterality: &str) -> Option<&str> {
        self.rows
            .get(key)?
            .get(&format!("cancer{}", laterality))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

fn tsv_reader(path: &Path) -> Result<csv::Reader<std::fs::File>, MetadataError> {
    csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)
        .context(ReadTableSnafu { path })
}

fn column(headers: &StringRecord, path: &Path, name: &str) -> Result<usize, MetadataError> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .context(MissingColumnSnafu { path, column: name })
}

fn required_field(
    row: &StringRecord,
    idx: usize,
    path: &Path,
    field: &str,
) -> Result<String, MetadataError> {
    let line = row.position().map(|p| p.line()).unwrap_or_default();
    row.get(idx)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .context(MissingFieldSnafu { path, line, field })
}

fn optional_field(row: &StringRecord, idx: Option<usize>) -> Option<String> {
    idx.and_then(|i| row.get(i))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Parse the tab-separated image crosswalk.
///
/// Any row lacking subjectId, examIndex, view or laterality fails the whole
/// parse.
pub fn build_image_index(path: &Path) -> Result<ImageIndex, MetadataError> {
    let mut reader = tsv_reader(path)?;
    let headers = reader.headers().context(ReadTableSnafu { path })?.clone();

    let subject = column(&headers, path, "subjectId")?;
    let exam = column(&headers, path, "examIndex")?;
    let view = column(&headers, path, "view")?;
    let laterality = column(&headers, path, "laterality")?;
    let image_index = headers.iter().position(|h| h.trim() == "imageIndex");
    let filename = column(&headers, path, "filename")?;
    let cancer = headers.iter().position(|h| h.trim() == "cancer");

    let mut index = ImageIndex::new();
    for row in reader.records() {
        let row = row.context(ReadTableSnafu { path })?;
        let key = ExamKey {
            subject_id: required_field(&row, subject, path, "subjectId")?,
            exam_index: required_field(&row, exam, path, "examIndex")?,
        };
        let record = ImageRecord {
            image_index: optional_field(&row, image_index).unwrap_or_default(),
            filename: required_field(&row, filename, path, "filename")?,
            cancer: optional_field(&row, cancer),
        };
        index.insert(
            key,
            required_field(&row, view, path, "view")?,
            required_field(&row, laterality, path, "laterality")?,
            record,
        );
    }

    info!(
        "Indexed {} exams ({} images) from {}",
        index.len(),
        index.image_count(),
        path.display()
    );
    Ok(index)
}

fn read_exam_index(path: &Path) -> Result<ExamIndex, MetadataError> {
    let mut reader = tsv_reader(path)?;
    let headers = reader.headers().context(ReadTableSnafu { path })?.clone();
    let subject = column(&headers, path, "subjectId")?;
    let exam = column(&headers, path, "examIndex")?;

    let mut rows = HashMap::new();
    for row in reader.records() {
        let row = row.context(ReadTableSnafu { path })?;
        let key = ExamKey {
            subject_id: required_field(&row, subject, path, "subjectId")?,
            exam_index: required_field(&row, exam, path, "examIndex")?,
        };
        let fields = headers
            .iter()
            .zip(row.iter())
            .map(|(h, v)| (h.trim().to_string(), v.trim().to_string()))
            .collect();
        rows.insert(key, fields);
    }
    Ok(ExamIndex { rows })
}

/// Parse the exam metadata table. Unreadable or missing tables yield `None`.
pub fn build_exam_index(path: &Path) -> Option<ExamIndex> {
    match read_exam_index(path) {
        Ok(index) => {
            info!("Indexed {} exam rows from {}", index.len(), path.display());
            Some(index)
        }
        Err(e) => {
            debug!("No exam metadata: {}", snafu::Report::from_error(e));
            None
        }
    }
}

/// Build both indexes. `exams_path` may be absent from the configuration.
pub fn build_metadata(
    crosswalk_path: &Path,
    exams_path: Option<&Path>,
) -> Result<(ImageIndex, Option<ExamIndex>), MetadataError> {
    let images = build_image_index(crosswalk_path)?;
    let exams = exams_path.and_then(build_exam_index);
    Ok((images, exams))
}
