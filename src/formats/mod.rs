//! Thin readers and writers around the supported vector formats.

pub mod geojson;
pub mod kml;
pub mod shapefile;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::debug;

use crate::crs::resolve_crs;
use crate::dataset::VectorDataset;
use crate::error::{IngestError, Result};

/// What a file on disk is, judged by its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    GeoJson,
    Shapefile,
    Kml,
    Zip,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        SourceFormat::from_extension(&extension)
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "geojson" | "json" => Some(SourceFormat::GeoJson),
            "shp" => Some(SourceFormat::Shapefile),
            "kml" => Some(SourceFormat::Kml),
            "zip" => Some(SourceFormat::Zip),
            _ => None,
        }
    }

    /// Formats that hold vector data directly, as opposed to archives.
    pub fn is_data(&self) -> bool {
        !matches!(self, SourceFormat::Zip)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    GeoJson,
    /// A zip bundle holding `.shp`, `.shx`, `.dbf`, `.prj` and `.cpg`.
    Shapefile,
    Kml,
}

impl OutputFormat {
    /// Extension of the file actually written.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::GeoJson => "geojson",
            OutputFormat::Shapefile => "zip",
            OutputFormat::Kml => "kml",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "geojson" | "json" => Ok(OutputFormat::GeoJson),
            "shp" | "shapefile" => Ok(OutputFormat::Shapefile),
            "kml" => Ok(OutputFormat::Kml),
            other => Err(IngestError::InvalidInput {
                reason: format!("unsupported output format '{other}'"),
            }),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::GeoJson => "geojson",
            OutputFormat::Shapefile => "shp",
            OutputFormat::Kml => "kml",
        })
    }
}

/// Reads one data file into a dataset carrying the file's resolved CRS, with
/// every multi-part geometry exploded into single-part records.
pub fn read_source(path: &Path) -> Result<VectorDataset> {
    let format = SourceFormat::from_path(path)
        .filter(SourceFormat::is_data)
        .ok_or_else(|| IngestError::unreadable(path, "not a geojson, shp or kml file"))?;
    if !path.is_file() {
        return Err(IngestError::unreadable(path, "file does not exist"));
    }

    let records = match format {
        SourceFormat::GeoJson => geojson::read_geojson(path)?,
        SourceFormat::Shapefile => shapefile::read_shapefile(path)?,
        SourceFormat::Kml => kml::read_kml(path)?,
        SourceFormat::Zip => unreachable!("archives are filtered above"),
    };

    let crs = resolve_crs(path)?.assign(path)?;
    debug!("Read {} records from {} in {}", records.len(), path.display(), crs);
    Ok(VectorDataset::with_records(crs, records).explode())
}

/// Writes `dataset` as `<dir>/<stem>.<ext>` and returns the written path.
pub fn write_dataset(
    dataset: &VectorDataset,
    format: OutputFormat,
    dir: &Path,
    stem: &str,
) -> Result<PathBuf> {
    let path = dir.join(format!("{stem}.{}", format.extension()));
    match format {
        OutputFormat::GeoJson => geojson::write_geojson(dataset, &path)?,
        OutputFormat::Shapefile => shapefile::write_shapefile_bundle(dataset, &path, stem)?,
        OutputFormat::Kml => kml::write_kml(dataset, &path, stem)?,
    }
    Ok(path)
}
