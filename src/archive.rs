//! Zip extraction and the bounded search for the single data file inside.

use std::fs::File;
use std::path::{Path, PathBuf};

use log::debug;
use tempfile::TempDir;
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::{IngestError, Result};
use crate::formats::SourceFormat;

/// Default number of directory levels searched below the extraction root.
pub const DEFAULT_MAX_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSearch {
    Found(PathBuf),
    /// Several candidates at the shallowest level holding any.
    Ambiguous(Vec<PathBuf>),
    NotFound,
}

/// An extracted archive. The scratch directory lives as long as this value.
pub struct ExtractedArchive {
    scratch: TempDir,
}

impl ExtractedArchive {
    pub fn root(&self) -> &Path {
        self.scratch.path()
    }
}

/// Extracts `archive` into a fresh scratch directory created under
/// `scratch_parent`.
pub fn extract(archive: &Path, scratch_parent: &Path) -> Result<ExtractedArchive> {
    let file = File::open(archive).map_err(|e| IngestError::unreadable(archive, e))?;
    let mut zip = ZipArchive::new(file)?;
    let scratch = tempfile::Builder::new()
        .prefix(".extract")
        .tempdir_in(scratch_parent)?;
    zip.extract(scratch.path())?;
    debug!(
        "Extracted {} entries of {} into {}",
        zip.len(),
        archive.display(),
        scratch.path().display()
    );
    Ok(ExtractedArchive { scratch })
}

/// Finds the candidate data files (`geojson`, `shp`, `kml`) at the shallowest
/// directory level that has any, looking at most `max_depth` levels below
/// `root`.
pub fn find_candidate(root: &Path, max_depth: usize) -> ArchiveSearch {
    let mut shallowest: Option<usize> = None;
    let mut candidates = Vec::new();

    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth.saturating_add(1))
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        if !entry.file_type().is_file() || !is_candidate(entry.path()) {
            continue;
        }
        let depth = entry.depth();
        match shallowest {
            Some(level) if depth > level => continue,
            Some(level) if depth == level => candidates.push(entry.into_path()),
            _ => {
                shallowest = Some(depth);
                candidates = vec![entry.into_path()];
            }
        }
    }

    match candidates.len() {
        0 => ArchiveSearch::NotFound,
        1 => ArchiveSearch::Found(candidates.remove(0)),
        _ => ArchiveSearch::Ambiguous(candidates),
    }
}

fn is_candidate(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'));
    !hidden
        && !path.components().any(|c| c.as_os_str() == "__MACOSX")
        && SourceFormat::from_path(path).is_some_and(|format| format.is_data())
}

/// Extracts `archive` and resolves its single data file. The returned
/// [`ExtractedArchive`] must outlive any use of the path.
pub fn open_archive(
    archive: &Path,
    scratch_parent: &Path,
    max_depth: usize,
) -> Result<(ExtractedArchive, PathBuf)> {
    let extracted = extract(archive, scratch_parent)?;
    match find_candidate(extracted.root(), max_depth) {
        ArchiveSearch::Found(path) => Ok((extracted, path)),
        ArchiveSearch::Ambiguous(candidates) => Err(IngestError::AmbiguousArchive {
            path: archive.to_path_buf(),
            candidates,
        }),
        ArchiveSearch::NotFound => Err(IngestError::ArchiveNotFound {
            path: archive.to_path_buf(),
        }),
    }
}
