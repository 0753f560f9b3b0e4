use std::path::{Path, PathBuf};

pub mod archive;
pub mod consistency;
pub mod crs;
pub mod dataset;
pub mod error;
pub mod formats;
pub mod geojson_repair;
pub mod pipeline;
pub mod repair;
pub mod report;
pub mod utm;

pub use dataset::{Crs, GeometryType, Record, VectorDataset};
pub use error::{IngestError, Result};
pub use formats::{OutputFormat, SourceFormat};
pub use pipeline::{FileState, IngestConfig, Pipeline, RunOutcome, Status};
pub use report::{LogReporter, MemoryReporter, Reporter};

/// Reads a single data file (or archive) into a dataset in its own CRS.
pub fn process_file(path: &Path, max_archive_depth: usize) -> Result<VectorDataset> {
    match SourceFormat::from_path(path) {
        Some(SourceFormat::Zip) => {
            let scratch_parent = path.parent().unwrap_or_else(|| Path::new("."));
            let (_scratch, data_path) =
                archive::open_archive(path, scratch_parent, max_archive_depth)?;
            formats::read_source(&data_path)
        }
        _ => formats::read_source(path),
    }
}

/// Runs a full ingestion with log-backed reporting.
pub fn process_files(files: &[PathBuf], config: IngestConfig) -> Result<RunOutcome> {
    Pipeline::new(config, &LogReporter).run(files)
}
