//! CRS resolution for source files and reprojection of datasets.
//!
//! Resolution reads whatever spatial-reference metadata a format carries:
//! the `.prj` sidecar of a shapefile, the legacy `crs` member of GeoJSON,
//! and the implicit WGS84 of KML.

use std::fs;
use std::path::Path;

use gdal::errors::GdalError;
use gdal::spatial_ref::SpatialRef;
use geo::{Coord, Geometry, LineString, Polygon};
use log::debug;
use proj::Proj;
use serde_json::Value;

use crate::dataset::{Crs, VectorDataset};
use crate::error::{IngestError, Result};
use crate::geojson_repair::trim_envelope;

/// What the metadata of a source file says about its CRS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrsIdentifier {
    Epsg(u32),
    /// Metadata exists but carries no authority code. The data provider ships
    /// its legacy regional datum this way, so the coordinates are already in
    /// that datum and must not be relabelled as WGS84. The raw definition is
    /// kept when there is one.
    Unresolved(Option<String>),
    /// No CRS metadata at all.
    Untagged,
}

impl CrsIdentifier {
    /// Turns the resolver's answer into the CRS stamped on the dataset.
    ///
    /// `Untagged` falls back to EPSG:4326. `Unresolved` keeps the source
    /// definition untouched; without one there is nothing proj could use, so
    /// the file is unreadable.
    pub fn assign(self, path: &Path) -> Result<Crs> {
        match self {
            CrsIdentifier::Epsg(code) => Ok(Crs::Epsg(code)),
            CrsIdentifier::Unresolved(Some(definition)) => Ok(Crs::Definition(definition)),
            CrsIdentifier::Unresolved(None) => Err(IngestError::unreadable(
                path,
                "CRS metadata has neither an authority code nor a definition",
            )),
            CrsIdentifier::Untagged => Ok(Crs::WGS84),
        }
    }
}

pub fn resolve_crs(path: &Path) -> Result<CrsIdentifier> {
    if !path.is_file() {
        return Err(IngestError::unreadable(path, "file does not exist"));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let identifier = match extension.as_str() {
        "shp" => resolve_shapefile_crs(path)?,
        "geojson" | "json" => resolve_geojson_crs(path)?,
        "kml" => CrsIdentifier::Epsg(4326),
        other => {
            return Err(IngestError::unreadable(
                path,
                format!("no driver for extension '{other}'"),
            ))
        }
    };

    debug!("Resolved CRS of {} as {:?}", path.display(), identifier);
    Ok(identifier)
}

fn resolve_shapefile_crs(path: &Path) -> Result<CrsIdentifier> {
    let prj = ["prj", "PRJ"]
        .iter()
        .map(|ext| path.with_extension(ext))
        .find(|candidate| candidate.is_file());

    let Some(prj) = prj else {
        return Ok(CrsIdentifier::Untagged);
    };

    let wkt = fs::read_to_string(&prj).map_err(|e| IngestError::unreadable(&prj, e))?;
    let wkt = wkt.trim();
    if wkt.is_empty() {
        return Ok(CrsIdentifier::Untagged);
    }

    let code = wkt_authority_code(wkt).map_err(|e| IngestError::unreadable(&prj, e))?;
    Ok(match code {
        Some(code) => CrsIdentifier::Epsg(code),
        None => CrsIdentifier::Unresolved(Some(wkt.to_string())),
    })
}

fn resolve_geojson_crs(path: &Path) -> Result<CrsIdentifier> {
    let raw = fs::read_to_string(path).map_err(|e| IngestError::unreadable(path, e))?;
    let value: Value = serde_json::from_str(&trim_envelope(&raw))
        .map_err(|e| IngestError::unreadable(path, e))?;
    Ok(geojson_crs_member(&value))
}

/// Reads the pre-RFC 7946 `crs` member. Its absence means WGS84.
pub fn geojson_crs_member(object: &Value) -> CrsIdentifier {
    let Some(crs) = object.get("crs").filter(|crs| !crs.is_null()) else {
        return CrsIdentifier::Epsg(4326);
    };
    let properties = crs.get("properties");

    if let Some(code) = properties.and_then(|p| p.get("code")) {
        return match code.as_u64().and_then(|code| u32::try_from(code).ok()) {
            Some(code) => CrsIdentifier::Epsg(code),
            None => CrsIdentifier::Unresolved(None),
        };
    }

    match properties
        .and_then(|p| p.get("name"))
        .and_then(|name| name.as_str())
    {
        Some(name) => match crs_name_code(name) {
            Some(code) => CrsIdentifier::Epsg(code),
            None => CrsIdentifier::Unresolved(Some(name.to_string())),
        },
        None => CrsIdentifier::Unresolved(None),
    }
}

/// Extracts the EPSG code from names such as `EPSG:31983`,
/// `urn:ogc:def:crs:EPSG::4326` or `http://www.opengis.net/def/crs/EPSG/0/4326`.
pub fn crs_name_code(name: &str) -> Option<u32> {
    let upper = name.trim().to_ascii_uppercase();
    if upper.ends_with("CRS84") {
        return Some(4326);
    }
    if !upper.contains("EPSG") {
        return None;
    }
    upper
        .rsplit(|c: char| c == ':' || c == '/')
        .find(|part| !part.is_empty())
        .and_then(|code| code.parse().ok())
}

/// EPSG code of the root CRS node of a WKT definition (WKT1 `AUTHORITY` or
/// WKT2 `ID`), read through GDAL's spatial reference parser. Authorities of
/// nested datums or base CRSs describe a component, not the file's CRS, and
/// are never consulted.
pub fn wkt_authority_code(wkt: &str) -> std::result::Result<Option<u32>, GdalError> {
    let srs = SpatialRef::from_wkt(wkt)?;
    let Some(authority) = srs.auth_name() else {
        return Ok(None);
    };
    if !authority.eq_ignore_ascii_case("EPSG") {
        return Ok(None);
    }
    Ok(srs.auth_code().ok().and_then(|code| u32::try_from(code).ok()))
}

/// A reusable coordinate transformation between two dataset CRSs.
pub struct Transformer {
    proj: Proj,
    from: Crs,
    to: Crs,
}

impl Transformer {
    pub fn new(from: &Crs, to: &Crs) -> Result<Self> {
        let proj = Proj::new_known_crs(&from.proj_string(), &to.proj_string(), None).map_err(
            |e| IngestError::Projection {
                from: from.to_string(),
                to: to.to_string(),
                reason: e.to_string(),
            },
        )?;
        Ok(Transformer {
            proj,
            from: from.clone(),
            to: to.clone(),
        })
    }

    pub fn transform_xy(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        self.proj
            .convert((x, y))
            .map_err(|e| self.projection_error(e))
    }

    /// Transforms every coordinate of `geometry` in place. `Rect` and
    /// `Triangle` become polygons, since their shape does not survive a
    /// projection.
    pub fn transform_geometry(&self, geometry: &mut Geometry<f64>) -> Result<()> {
        match geometry {
            Geometry::Point(point) => self.transform_coords(std::slice::from_mut(&mut point.0)),
            Geometry::Line(line) => {
                let mut ends = [line.start, line.end];
                self.transform_coords(&mut ends)?;
                line.start = ends[0];
                line.end = ends[1];
                Ok(())
            }
            Geometry::LineString(line) => self.transform_coords(&mut line.0),
            Geometry::Polygon(polygon) => self.transform_polygon(polygon),
            Geometry::MultiPoint(multi) => multi
                .0
                .iter_mut()
                .try_for_each(|point| self.transform_coords(std::slice::from_mut(&mut point.0))),
            Geometry::MultiLineString(multi) => multi
                .0
                .iter_mut()
                .try_for_each(|line| self.transform_coords(&mut line.0)),
            Geometry::MultiPolygon(multi) => multi
                .0
                .iter_mut()
                .try_for_each(|polygon| self.transform_polygon(polygon)),
            Geometry::GeometryCollection(collection) => collection
                .0
                .iter_mut()
                .try_for_each(|member| self.transform_geometry(member)),
            Geometry::Rect(rect) => {
                let mut polygon = rect.to_polygon();
                self.transform_polygon(&mut polygon)?;
                *geometry = Geometry::Polygon(polygon);
                Ok(())
            }
            Geometry::Triangle(triangle) => {
                let mut polygon = triangle.to_polygon();
                self.transform_polygon(&mut polygon)?;
                *geometry = Geometry::Polygon(polygon);
                Ok(())
            }
        }
    }

    fn transform_polygon(&self, polygon: &mut Polygon<f64>) -> Result<()> {
        let taken = std::mem::replace(polygon, Polygon::new(LineString::new(Vec::new()), Vec::new()));
        let (mut exterior, mut interiors) = taken.into_inner();
        self.transform_coords(&mut exterior.0)?;
        for ring in &mut interiors {
            self.transform_coords(&mut ring.0)?;
        }
        *polygon = Polygon::new(exterior, interiors);
        Ok(())
    }

    fn transform_coords(&self, coords: &mut [Coord<f64>]) -> Result<()> {
        if coords.is_empty() {
            return Ok(());
        }
        self.proj
            .convert_array(coords)
            .map_err(|e| self.projection_error(e))?;
        Ok(())
    }

    fn projection_error(&self, error: impl ToString) -> IngestError {
        IngestError::Projection {
            from: self.from.to_string(),
            to: self.to.to_string(),
            reason: error.to_string(),
        }
    }
}

/// Reprojects every record of `dataset` into `target`. A dataset already in
/// `target` is returned as-is.
pub fn reproject(mut dataset: VectorDataset, target: &Crs) -> Result<VectorDataset> {
    if &dataset.crs == target {
        return Ok(dataset);
    }

    debug!("Reprojecting {} records from {} to {}", dataset.len(), dataset.crs, target);
    let transformer = Transformer::new(&dataset.crs, target)?;
    for record in &mut dataset.records {
        transformer.transform_geometry(&mut record.geometry)?;
    }
    dataset.crs = target.clone();
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    const UTM_21S_PRJ: &str = r#"PROJCS["WGS 84 / UTM zone 21S",GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AUTHORITY["EPSG","4326"]],PROJECTION["Transverse_Mercator"],PARAMETER["latitude_of_origin",0],PARAMETER["central_meridian",-57],PARAMETER["scale_factor",0.9996],PARAMETER["false_easting",500000],PARAMETER["false_northing",10000000],UNIT["metre",1,AUTHORITY["EPSG","9001"]],AXIS["Easting",EAST],AXIS["Northing",NORTH],AUTHORITY["EPSG","32721"]]"#;

    const ESRI_SIRGAS_PRJ: &str = r#"GEOGCS["GCS_SIRGAS_2000",DATUM["D_SIRGAS_2000",SPHEROID["GRS_1980",6378137.0,298.257222101]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]]"#;

    #[test]
    fn top_level_authority_wins_over_nested_ones() {
        assert_eq!(wkt_authority_code(UTM_21S_PRJ).unwrap(), Some(32721));
    }

    #[test]
    fn esri_wkt_without_authority_is_unresolved() {
        assert_eq!(wkt_authority_code(ESRI_SIRGAS_PRJ).unwrap(), None);
    }

    #[test]
    fn wkt2_id_is_understood() {
        let wkt = r#"GEOGCRS["WGS 84",DATUM["World Geodetic System 1984",ELLIPSOID["WGS 84",6378137,298.257223563]],CS[ellipsoidal,2,AXIS["latitude",north,ORDER[1],ANGLEUNIT["degree",0.0174532925199433]],AXIS["longitude",east,ORDER[2],ANGLEUNIT["degree",0.0174532925199433]]],ID["EPSG",4326]]"#;
        assert_eq!(wkt_authority_code(wkt).unwrap(), Some(4326));
    }

    #[test]
    fn garbage_prj_makes_the_shapefile_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let shp = dir.path().join("area.shp");
        std::fs::write(&shp, b"").unwrap();
        std::fs::write(dir.path().join("area.prj"), "not a projection").unwrap();
        assert!(matches!(
            resolve_crs(&shp),
            Err(IngestError::SourceUnreadable { .. })
        ));
    }

    #[test]
    fn crs_names_resolve_to_codes() {
        assert_eq!(crs_name_code("EPSG:31983"), Some(31983));
        assert_eq!(crs_name_code("urn:ogc:def:crs:EPSG::4674"), Some(4674));
        assert_eq!(crs_name_code("urn:ogc:def:crs:OGC:1.3:CRS84"), Some(4326));
        assert_eq!(
            crs_name_code("http://www.opengis.net/def/crs/EPSG/0/32722"),
            Some(32722)
        );
        assert_eq!(crs_name_code("SIRGAS 2000"), None);
    }

    #[test]
    fn geojson_crs_member_variants() {
        assert_eq!(
            geojson_crs_member(&json!({"type": "FeatureCollection"})),
            CrsIdentifier::Epsg(4326)
        );
        assert_eq!(
            geojson_crs_member(&json!({"crs": {"type": "name", "properties": {"name": "EPSG:32721"}}})),
            CrsIdentifier::Epsg(32721)
        );
        assert_eq!(
            geojson_crs_member(&json!({"crs": {"type": "name", "properties": {"name": "SIRGAS 2000"}}})),
            CrsIdentifier::Unresolved(Some("SIRGAS 2000".into()))
        );
        assert_eq!(
            geojson_crs_member(&json!({"crs": {"type": "EPSG", "properties": {"code": 4674}}})),
            CrsIdentifier::Epsg(4674)
        );
    }

    #[test]
    fn unusable_legacy_codes_are_not_truncated() {
        for code in [json!(-4326), json!(4326.5), json!(8_589_938_918u64), json!("4326")] {
            assert_eq!(
                geojson_crs_member(&json!({"crs": {"type": "EPSG", "properties": {"code": code}}})),
                CrsIdentifier::Unresolved(None)
            );
        }
    }

    #[test]
    fn shapefile_resolution_reads_prj_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let shp = dir.path().join("area.shp");
        std::fs::write(&shp, b"").unwrap();
        assert_eq!(resolve_crs(&shp).unwrap(), CrsIdentifier::Untagged);

        let mut prj = std::fs::File::create(dir.path().join("area.prj")).unwrap();
        prj.write_all(ESRI_SIRGAS_PRJ.as_bytes()).unwrap();
        assert_eq!(
            resolve_crs(&shp).unwrap(),
            CrsIdentifier::Unresolved(Some(ESRI_SIRGAS_PRJ.to_string()))
        );

        std::fs::write(dir.path().join("area.prj"), UTM_21S_PRJ).unwrap();
        assert_eq!(resolve_crs(&shp).unwrap(), CrsIdentifier::Epsg(32721));
    }

    #[test]
    fn missing_or_undriverable_files_are_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.geojson");
        assert!(matches!(
            resolve_crs(&missing),
            Err(IngestError::SourceUnreadable { .. })
        ));

        let csv = dir.path().join("table.csv");
        std::fs::write(&csv, "a,b").unwrap();
        assert!(matches!(
            resolve_crs(&csv),
            Err(IngestError::SourceUnreadable { .. })
        ));
    }

    #[test]
    fn unresolved_keeps_the_source_definition() {
        let path = Path::new("a.shp");
        assert_eq!(
            CrsIdentifier::Unresolved(Some("GEOGCS[]".into())).assign(path).unwrap(),
            Crs::Definition("GEOGCS[]".into())
        );
        assert_eq!(CrsIdentifier::Untagged.assign(path).unwrap(), Crs::WGS84);
        assert!(CrsIdentifier::Unresolved(None).assign(path).is_err());
    }

    #[test]
    fn reprojection_reaches_every_part_of_a_collection() {
        use geo::{line_string, point, polygon, GeometryCollection};

        let mut dataset = VectorDataset::new(Crs::WGS84);
        dataset.push(crate::dataset::Record::new(
            Geometry::GeometryCollection(GeometryCollection::new_from(vec![
                Geometry::Point(point!(x: -57.0, y: 0.0)),
                Geometry::LineString(line_string![(x: -57.0, y: -1.0), (x: -56.0, y: -1.0)]),
                Geometry::Polygon(polygon![(x: -57.0, y: -2.0), (x: -56.0, y: -2.0), (x: -56.0, y: -3.0)]),
            ])),
            Default::default(),
        ));

        let projected = reproject(dataset, &Crs::Epsg(32721)).unwrap();
        assert_eq!(projected.crs, Crs::Epsg(32721));
        let Geometry::GeometryCollection(parts) = &projected.records[0].geometry else {
            panic!("expected a collection");
        };
        let Geometry::Point(origin) = parts.0[0] else {
            panic!("expected a point");
        };
        // the central meridian of zone 21 lands on the false easting
        assert!((origin.x() - 500_000.0).abs() < 1e-3);
        assert!((origin.y() - 10_000_000.0).abs() < 1e-3);
        assert!(parts
            .0
            .iter()
            .flat_map(|part| geo::CoordsIter::coords_iter(part).collect::<Vec<_>>())
            .all(|coord| coord.x > 100_000.0 && coord.y > 9_000_000.0));
    }

    #[test]
    fn reprojecting_into_the_same_crs_is_a_no_op() {
        let dataset = VectorDataset::new(Crs::WGS84);
        assert_eq!(reproject(dataset.clone(), &Crs::WGS84).unwrap(), dataset);
    }
}
