//! The ingestion run: collect inputs, read and normalize each file, merge,
//! repair once, optionally check against a boundary, write.

use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::{self, DEFAULT_MAX_DEPTH};
use crate::consistency::{self, DEFAULT_TOLERANCE};
use crate::crs::reproject;
use crate::dataset::{Crs, GeometryType, Record, VectorDataset};
use crate::error::{IngestError, Result};
use crate::formats::{self, OutputFormat, SourceFormat};
use crate::repair::repair_geometries;
use crate::report::Reporter;
use crate::utm::{representative_point, select_utm};

/// Stem of the side file holding inconsistent points.
pub const INCONSISTENT_POINTS_STEM: &str = "inconsistent_points";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Formats picked up from input directories and accepted as input files.
    pub input_types: Vec<SourceFormat>,
    /// Keep only records of this type after explosion.
    pub geometry_type: Option<GeometryType>,
    pub output_format: OutputFormat,
    pub output_dir: PathBuf,
    pub output_stem: String,
    /// Reference boundary layer for the consistency check.
    pub boundary: Option<PathBuf>,
    pub tolerance: f64,
    pub max_archive_depth: usize,
    pub target_crs: Crs,
    /// Cut the primary output down to the boundary.
    pub clip_to_boundary: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            input_types: vec![
                SourceFormat::GeoJson,
                SourceFormat::Shapefile,
                SourceFormat::Kml,
                SourceFormat::Zip,
            ],
            geometry_type: None,
            output_format: OutputFormat::GeoJson,
            output_dir: PathBuf::from("output"),
            output_stem: "output".to_string(),
            boundary: None,
            tolerance: DEFAULT_TOLERANCE,
            max_archive_depth: DEFAULT_MAX_DEPTH,
            target_crs: Crs::WGS84,
            clip_to_boundary: false,
        }
    }
}

/// Outcome of a run, as surfaced to callers and as the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Failure,
    Success,
    InvalidInput,
    Warnings,
}

impl Status {
    pub fn code(&self) -> i32 {
        match self {
            Status::Failure => 0,
            Status::Success => 1,
            Status::InvalidInput => 2,
            Status::Warnings => 3,
        }
    }

    pub fn from_error(error: &IngestError) -> Self {
        if error.is_invalid_input() {
            Status::InvalidInput
        } else {
            Status::Failure
        }
    }
}

/// Per-file progress. `Invalid` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileState {
    Pending,
    Extracting,
    Reading,
    Reprojecting,
    Repairing,
    Merged,
    Done,
    Invalid,
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
    pub invalid_input: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: Status,
    pub output: Option<PathBuf>,
    pub inconsistent_points: Option<PathBuf>,
    pub records: usize,
    pub skipped: Vec<SkippedFile>,
}

pub struct Pipeline<'a> {
    config: IngestConfig,
    reporter: &'a dyn Reporter,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: IngestConfig, reporter: &'a dyn Reporter) -> Self {
        Pipeline { config, reporter }
    }

    /// Runs the whole ingestion over `inputs` (files or directories).
    ///
    /// Unreadable or invalid files are skipped and listed in the outcome.
    /// Errors are returned for problems with the run as a whole, such as a
    /// boundary that no geometry overlaps.
    pub fn run(&self, inputs: &[PathBuf]) -> Result<RunOutcome> {
        if let Some(geometry_type) = self.config.geometry_type {
            if !geometry_type.is_single_part() {
                return Err(IngestError::InvalidInput {
                    reason: format!(
                        "{geometry_type} never survives explosion, filter on Point, LineString or Polygon"
                    ),
                });
            }
        }
        fs::create_dir_all(&self.config.output_dir)?;

        let files = self.collect_inputs(inputs)?;
        if files.is_empty() {
            return Err(IngestError::InvalidInput {
                reason: "no input files matched the requested input types".to_string(),
            });
        }
        self.reporter
            .progress(&format!("Ingesting {} files", files.len()));

        let mut merged = VectorDataset::new(self.config.target_crs.clone());
        let mut ingested = Vec::new();
        let mut skipped = Vec::new();
        for path in &files {
            self.reporter.transition(path, FileState::Pending);
            match self.ingest_file(path) {
                Ok(dataset) => {
                    merged.append(dataset)?;
                    ingested.push(path);
                }
                Err(error) => {
                    self.reporter.transition(path, FileState::Invalid);
                    self.reporter
                        .warn(&format!("Skipping {}: {error}", path.display()));
                    skipped.push(SkippedFile {
                        path: path.clone(),
                        reason: error.to_string(),
                        invalid_input: error.is_invalid_input(),
                    });
                }
            }
        }

        if ingested.is_empty() {
            let status = if skipped.iter().all(|file| file.invalid_input) {
                Status::InvalidInput
            } else {
                Status::Failure
            };
            return Ok(RunOutcome {
                status,
                output: None,
                inconsistent_points: None,
                records: 0,
                skipped,
            });
        }

        for path in &ingested {
            self.reporter.transition(path, FileState::Repairing);
        }
        let mut repaired = repair_geometries(merged, self.reporter);
        for path in &ingested {
            self.reporter.transition(path, FileState::Merged);
        }

        let mut inconsistent = Vec::new();
        if let Some(boundary_path) = &self.config.boundary {
            let boundary = reproject(self.load(boundary_path)?, &self.config.target_crs)?;
            inconsistent = self.check_consistency(&repaired, &boundary)?;
            if self.config.clip_to_boundary {
                let polygons = consistency::boundary_polygons(&boundary);
                repaired = consistency::clip_to_boundary(repaired, &polygons);
            }
        }

        for path in &ingested {
            self.reporter.transition(path, FileState::Done);
        }

        if repaired.is_empty() {
            self.reporter.progress("No geometry left after repair, nothing written");
            return Ok(RunOutcome {
                status: Status::Success,
                output: None,
                inconsistent_points: None,
                records: 0,
                skipped,
            });
        }

        let output = formats::write_dataset(
            &repaired,
            self.config.output_format,
            &self.config.output_dir,
            &self.config.output_stem,
        )?;
        self.reporter.progress(&format!(
            "Wrote {} records to {}",
            repaired.len(),
            output.display()
        ));

        let mut status = Status::Success;
        let mut points_path = None;
        if !inconsistent.is_empty() {
            self.reporter.warn(&format!(
                "{} points lie farther than {} from the boundary",
                inconsistent.len(),
                self.config.tolerance
            ));
            let points = VectorDataset::with_records(self.config.target_crs.clone(), inconsistent);
            points_path = Some(formats::write_dataset(
                &points,
                self.config.output_format,
                &self.config.output_dir,
                INCONSISTENT_POINTS_STEM,
            )?);
            status = Status::Warnings;
        }

        Ok(RunOutcome {
            status,
            output: Some(output),
            inconsistent_points: points_path,
            records: repaired.len(),
            skipped,
        })
    }

    /// Reads, reprojects and filters one input file.
    fn ingest_file(&self, path: &Path) -> Result<VectorDataset> {
        let dataset = self.load(path)?;

        self.reporter.transition(path, FileState::Reprojecting);
        let mut dataset = reproject(dataset, &self.config.target_crs)?;
        if let Some(geometry_type) = self.config.geometry_type {
            dataset.retain_type(geometry_type);
        }
        Ok(dataset)
    }

    /// Reads a data file, going through extraction first for archives. The
    /// scratch directory is gone once this returns.
    fn load(&self, path: &Path) -> Result<VectorDataset> {
        if SourceFormat::from_path(path) == Some(SourceFormat::Zip) {
            self.reporter.transition(path, FileState::Extracting);
            let (_scratch, data_path) = archive::open_archive(
                path,
                &self.config.output_dir,
                self.config.max_archive_depth,
            )?;
            self.reporter.transition(path, FileState::Reading);
            return formats::read_source(&data_path);
        }

        self.reporter.transition(path, FileState::Reading);
        formats::read_source(path)
    }

    /// Projects both layers to the data's UTM zone and collects the
    /// inconsistent points, returned as records in the target CRS.
    fn check_consistency(
        &self,
        data: &VectorDataset,
        boundary: &VectorDataset,
    ) -> Result<Vec<Record>> {
        let point = representative_point(data).ok_or_else(|| IngestError::InvalidInput {
            reason: "no geometry to locate a UTM zone from".to_string(),
        })?;
        let utm = select_utm(point, &data.crs)?;
        self.reporter
            .progress(&format!("Checking against boundary in {utm}"));

        let data_utm = reproject(data.clone(), &utm)?;
        let boundary_utm = reproject(boundary.clone(), &utm)?;
        let points =
            consistency::find_inconsistent_points(&data_utm, &boundary_utm, self.config.tolerance)?;

        let in_utm = VectorDataset::with_records(
            utm,
            points
                .into_iter()
                .map(|point| Record::new(point.into(), Default::default()))
                .collect(),
        );
        Ok(reproject(in_utm, &self.config.target_crs)?.records)
    }

    /// Expands directories (not recursively), keeps the configured input
    /// types and orders files by their embedded numeric identifier.
    fn collect_inputs(&self, inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let accepted = |path: &Path| {
            SourceFormat::from_path(path).is_some_and(|f| self.config.input_types.contains(&f))
        };

        let mut files = Vec::new();
        for input in inputs {
            if input.is_dir() {
                for entry in fs::read_dir(input)? {
                    let path = entry?.path();
                    if path.is_file() && accepted(&path) {
                        files.push(path);
                    }
                }
            } else if accepted(input) {
                files.push(input.clone());
            } else {
                self.reporter.warn(&format!(
                    "Ignoring {}: not one of the requested input types",
                    input.display()
                ));
            }
        }
        sort_by_numeric_id(&mut files);
        Ok(files)
    }
}

/// First run of ASCII digits in the file stem.
pub fn numeric_id(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let start = stem.find(|c: char| c.is_ascii_digit())?;
    let digits: String = stem[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Ascending by numeric identifier; files without one follow, by name.
pub fn sort_by_numeric_id(files: &mut [PathBuf]) {
    files.sort_by_cached_key(|path| {
        let id = numeric_id(path);
        (id.is_none(), id, path.file_name().map(|name| name.to_owned()))
    });
}
