//! Concatenation of per-worker metadata files into `metadata.tsv`.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use snafu::prelude::*;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Merged table name inside the dataset target directory
pub const MERGED_METADATA: &str = "metadata.tsv";

#[derive(Debug, Snafu)]
pub enum MergeError {
    /// Could not list {path}
    ListDir {
        path: String,
        source: walkdir::Error,
    },

    /// Could not read {path}
    ReadWorkerFile {
        path: String,
        source: std::io::Error,
    },

    /// Could not write {path}
    WriteMerged {
        path: String,
        source: std::io::Error,
    },

    /// Could not remove stale file {path}
    RemoveStale {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub files: usize,
    pub lines: usize,
}

/// Worker number of a `metadata_<n>.tsv` file name
pub fn worker_of(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix("metadata_")?
        .strip_suffix(".tsv")
        .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))?
        .parse()
        .ok()
}

/// Per-worker metadata files in `tmp_dir`, ordered by worker number.
pub fn discover_worker_files(tmp_dir: &Path) -> Result<Vec<(usize, PathBuf)>, MergeError> {
    if !tmp_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(tmp_dir).min_depth(1).max_depth(1) {
        let entry = entry.context(ListDirSnafu {
            path: tmp_dir.display().to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(worker) = entry.file_name().to_str().and_then(worker_of) {
            found.push((worker, entry.into_path()));
        }
    }
    found.sort();
    Ok(found)
}

/// Removes leftover worker files so a merge only sees the current run.
pub fn purge_worker_files(tmp_dir: &Path) -> Result<usize, MergeError> {
    let stale = discover_worker_files(tmp_dir)?;
    for (_, path) in &stale {
        fs::remove_file(path).context(RemoveStaleSnafu {
            path: path.display().to_string(),
        })?;
    }
    if !stale.is_empty() {
        debug!("Removed {} stale worker files from {}", stale.len(), tmp_dir.display());
    }
    Ok(stale.len())
}

/// Concatenates every worker file in `tmp_dir` into
/// `target_dir/metadata.tsv`, skipping workers listed in `exclude`.
/// Worker files stay in place.
pub fn merge_metadata(
    tmp_dir: &Path,
    target_dir: &Path,
    exclude: &[usize],
) -> Result<MergeSummary, MergeError> {
    let merged_path = target_dir.join(MERGED_METADATA);
    let merged_display = merged_path.display().to_string();
    let file = File::create(&merged_path).context(WriteMergedSnafu {
        path: &merged_display,
    })?;
    let mut out = BufWriter::new(file);

    let mut summary = MergeSummary::default();
    for (worker, path) in discover_worker_files(tmp_dir)? {
        if exclude.contains(&worker) {
            debug!("Not merging {} from failed worker", path.display());
            continue;
        }
        let display = path.display().to_string();
        let reader = BufReader::new(
            File::open(&path).context(ReadWorkerFileSnafu { path: &display })?,
        );
        for line in reader.lines() {
            let line = line.context(ReadWorkerFileSnafu { path: &display })?;
            if line.is_empty() {
                continue;
            }
            writeln!(out, "{}", line).context(WriteMergedSnafu {
                path: &merged_display,
            })?;
            summary.lines += 1;
        }
        summary.files += 1;
    }
    out.flush().context(WriteMergedSnafu {
        path: &merged_display,
    })?;

    info!(
        "Merged {} worker files ({} records) into {}",
        summary.files, summary.lines, merged_display
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_of() {
        assert_eq!(worker_of("metadata_0.tsv"), Some(0));
        assert_eq!(worker_of("metadata_12.tsv"), Some(12));
        assert_eq!(worker_of("metadata_.tsv"), None);
        assert_eq!(worker_of("metadata_a.tsv"), None);
        assert_eq!(worker_of("metadata.tsv"), None);
        assert_eq!(worker_of("metadata_1.csv"), None);
    }

    #[test]
    fn test_merge_sums_lines() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        let target = dir.path().join("target");
        fs::create_dir_all(&tmp).unwrap();
        fs::create_dir_all(&target).unwrap();

        let counts = [3usize, 0, 5, 1];
        for (worker, count) in counts.iter().enumerate() {
            let body: String = (0..*count)
                .map(|i| format!("s{worker}\t{i}\tCC\tL\t0\n"))
                .collect();
            fs::write(tmp.join(format!("metadata_{worker}.tsv")), body).unwrap();
        }
        // no trailing newline must not glue records together
        fs::write(tmp.join("metadata_9.tsv"), "s9\t1\tCC\tR\t1").unwrap();
        fs::write(tmp.join("notes.tsv"), "ignored\n").unwrap();

        let summary = merge_metadata(&tmp, &target, &[]).unwrap();
        assert_eq!(summary.files, 5);
        assert_eq!(summary.lines, counts.iter().sum::<usize>() + 1);
        let merged = fs::read_to_string(target.join(MERGED_METADATA)).unwrap();
        assert_eq!(merged.lines().count(), summary.lines);
        assert!(merged.ends_with("s9\t1\tCC\tR\t1\n"));

        // worker files are left in place
        assert_eq!(discover_worker_files(&tmp).unwrap().len(), 5);

        let summary = merge_metadata(&tmp, &target, &[2]).unwrap();
        assert_eq!(summary.files, 4);
        assert_eq!(summary.lines, 5);
    }

    #[test]
    fn test_purge_only_worker_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("metadata_0.tsv"), "x\n").unwrap();
        fs::write(dir.path().join("metadata_1.tsv"), "y\n").unwrap();
        fs::write(dir.path().join("keep.txt"), "z\n").unwrap();
        assert_eq!(purge_worker_files(dir.path()).unwrap(), 2);
        assert!(discover_worker_files(dir.path()).unwrap().is_empty());
        assert!(dir.path().join("keep.txt").exists());
        assert_eq!(purge_worker_files(&dir.path().join("missing")).unwrap(), 0);
    }
}
