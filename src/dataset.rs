use std::fmt;
use std::str::FromStr;

use geo::{CoordsIter, Geometry};
use serde_json::{Map, Value};

use crate::error::IngestError;

/// Declared geometry types, as they appear in GeoJSON `type` members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryType {
    Point,
    LineString,
    Polygon,
    MultiPoint,
    MultiLineString,
    MultiPolygon,
    GeometryCollection,
}

impl GeometryType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "point" => Some(GeometryType::Point),
            "linestring" => Some(GeometryType::LineString),
            "polygon" => Some(GeometryType::Polygon),
            "multipoint" => Some(GeometryType::MultiPoint),
            "multilinestring" => Some(GeometryType::MultiLineString),
            "multipolygon" => Some(GeometryType::MultiPolygon),
            "geometrycollection" => Some(GeometryType::GeometryCollection),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GeometryType::Point => "Point",
            GeometryType::LineString => "LineString",
            GeometryType::Polygon => "Polygon",
            GeometryType::MultiPoint => "MultiPoint",
            GeometryType::MultiLineString => "MultiLineString",
            GeometryType::MultiPolygon => "MultiPolygon",
            GeometryType::GeometryCollection => "GeometryCollection",
        }
    }

    /// Number of array levels wrapping the coordinates of this type in GeoJSON.
    /// Collections nest geometries, not coordinates, so they have no fixed depth.
    pub fn nesting_depth(&self) -> Option<usize> {
        match self {
            GeometryType::Point => Some(1),
            GeometryType::LineString | GeometryType::MultiPoint => Some(2),
            GeometryType::Polygon | GeometryType::MultiLineString => Some(3),
            GeometryType::MultiPolygon => Some(4),
            GeometryType::GeometryCollection => None,
        }
    }

    pub fn of(geometry: &Geometry<f64>) -> Self {
        match geometry {
            Geometry::Point(_) => GeometryType::Point,
            Geometry::Line(_) | Geometry::LineString(_) => GeometryType::LineString,
            Geometry::Polygon(_) | Geometry::Rect(_) | Geometry::Triangle(_) => {
                GeometryType::Polygon
            }
            Geometry::MultiPoint(_) => GeometryType::MultiPoint,
            Geometry::MultiLineString(_) => GeometryType::MultiLineString,
            Geometry::MultiPolygon(_) => GeometryType::MultiPolygon,
            Geometry::GeometryCollection(_) => GeometryType::GeometryCollection,
        }
    }

    /// Single-part types, the only ones left once a dataset is exploded.
    pub fn is_single_part(&self) -> bool {
        matches!(
            self,
            GeometryType::Point | GeometryType::LineString | GeometryType::Polygon
        )
    }
}

impl FromStr for GeometryType {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GeometryType::from_name(s).ok_or_else(|| IngestError::InvalidInput {
            reason: format!("unknown geometry type '{s}'"),
        })
    }
}

impl fmt::Display for GeometryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The single CRS assigned to a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Crs {
    Epsg(u32),
    /// A raw WKT or CRS name without an authority code, kept verbatim so proj
    /// can still interpret it.
    Definition(String),
}

impl Crs {
    pub const WGS84: Crs = Crs::Epsg(4326);

    pub fn is_geographic(&self) -> bool {
        match self {
            // EPSG reserves 4000-4999 for geographic 2D systems
            Crs::Epsg(code) => (4000..5000).contains(code),
            Crs::Definition(definition) => {
                let upper = definition.trim_start().to_ascii_uppercase();
                upper.starts_with("GEOGCS")
                    || upper.starts_with("GEOGCRS")
                    || upper.contains("+PROJ=LONGLAT")
            }
        }
    }

    /// The string handed to proj.
    pub fn proj_string(&self) -> String {
        match self {
            Crs::Epsg(code) => format!("EPSG:{code}"),
            Crs::Definition(definition) => definition.clone(),
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Crs::Epsg(code) => write!(f, "EPSG:{code}"),
            Crs::Definition(definition) => {
                let short: String = definition.chars().take(40).collect();
                write!(f, "{short}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub geometry: Geometry<f64>,
    pub attributes: Map<String, Value>,
    /// Z ordinates in vertex order, when the source carried 3D coordinates.
    pub z: Option<Vec<f64>>,
}

impl Record {
    pub fn new(geometry: Geometry<f64>, attributes: Map<String, Value>) -> Self {
        Record {
            geometry,
            attributes,
            z: None,
        }
    }

    pub fn with_z(mut self, z: Vec<f64>) -> Self {
        self.z = Some(z);
        self
    }

    pub fn geometry_type(&self) -> GeometryType {
        GeometryType::of(&self.geometry)
    }

    pub fn is_3d(&self) -> bool {
        self.z.is_some()
    }

    /// Splits a multi-part record into one record per part. Each part keeps the
    /// parent's attributes and its own share of the Z ordinates.
    pub fn explode(self) -> Vec<Record> {
        let Record {
            geometry,
            attributes,
            z,
        } = self;

        let parts = explode_geometry(geometry);
        let mut remaining_z = z.as_deref();
        parts
            .into_iter()
            .map(|part| {
                let part_z = match remaining_z {
                    Some(values) => {
                        let (head, tail) =
                            values.split_at(part.coords_count().min(values.len()));
                        remaining_z = Some(tail);
                        Some(head.to_vec())
                    }
                    None => None,
                };
                Record {
                    geometry: part,
                    attributes: attributes.clone(),
                    z: part_z,
                }
            })
            .collect()
    }
}

/// Flattens multi-part geometries and collections into single-part geometries.
pub fn explode_geometry(geometry: Geometry<f64>) -> Vec<Geometry<f64>> {
    match geometry {
        Geometry::MultiPoint(multi) => multi.0.into_iter().map(Geometry::Point).collect(),
        Geometry::MultiLineString(multi) => {
            multi.0.into_iter().map(Geometry::LineString).collect()
        }
        Geometry::MultiPolygon(multi) => multi.0.into_iter().map(Geometry::Polygon).collect(),
        Geometry::GeometryCollection(collection) => collection
            .0
            .into_iter()
            .flat_map(explode_geometry)
            .collect(),
        Geometry::Line(line) => vec![Geometry::LineString(line.into())],
        Geometry::Rect(rect) => vec![Geometry::Polygon(rect.to_polygon())],
        Geometry::Triangle(triangle) => vec![Geometry::Polygon(triangle.to_polygon())],
        single => vec![single],
    }
}

/// An ordered collection of records sharing exactly one CRS.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorDataset {
    pub crs: Crs,
    pub records: Vec<Record>,
}

impl VectorDataset {
    pub fn new(crs: Crs) -> Self {
        VectorDataset {
            crs,
            records: Vec::new(),
        }
    }

    pub fn with_records(crs: Crs, records: Vec<Record>) -> Self {
        VectorDataset { crs, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    /// Appends another dataset's records. Both must already share a CRS.
    pub fn append(&mut self, other: VectorDataset) -> crate::error::Result<()> {
        if other.crs != self.crs {
            return Err(IngestError::InvalidInput {
                reason: format!("cannot merge dataset in {} into {}", other.crs, self.crs),
            });
        }
        self.records.extend(other.records);
        Ok(())
    }

    pub fn explode(self) -> Self {
        VectorDataset {
            crs: self.crs,
            records: self.records.into_iter().flat_map(Record::explode).collect(),
        }
    }

    pub fn retain_type(&mut self, geometry_type: GeometryType) {
        self.records
            .retain(|record| record.geometry_type() == geometry_type);
    }

    pub fn geometries(&self) -> impl Iterator<Item = &Geometry<f64>> {
        self.records.iter().map(|record| &record.geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{line_string, point, polygon, MultiPolygon};

    #[test]
    fn nesting_depths_follow_geojson_layout() {
        assert_eq!(GeometryType::Point.nesting_depth(), Some(1));
        assert_eq!(GeometryType::MultiPoint.nesting_depth(), Some(2));
        assert_eq!(GeometryType::LineString.nesting_depth(), Some(2));
        assert_eq!(GeometryType::MultiLineString.nesting_depth(), Some(3));
        assert_eq!(GeometryType::Polygon.nesting_depth(), Some(3));
        assert_eq!(GeometryType::MultiPolygon.nesting_depth(), Some(4));
        assert_eq!(GeometryType::GeometryCollection.nesting_depth(), None);
    }

    #[test]
    fn geometry_type_names_are_case_insensitive() {
        assert_eq!("polygon".parse::<GeometryType>().unwrap(), GeometryType::Polygon);
        assert_eq!(
            GeometryType::from_name("LINESTRING"),
            Some(GeometryType::LineString)
        );
        assert!("Curve".parse::<GeometryType>().is_err());
    }

    #[test]
    fn only_single_part_types_survive_explosion() {
        assert!(GeometryType::Point.is_single_part());
        assert!(GeometryType::Polygon.is_single_part());
        assert!(!GeometryType::MultiLineString.is_single_part());
        assert!(!GeometryType::GeometryCollection.is_single_part());
    }

    #[test]
    fn explode_splits_parts_and_keeps_attributes() {
        let mut attributes = Map::new();
        attributes.insert("id".into(), Value::from(7));
        let multi = MultiPolygon::new(vec![
            polygon![(x: 0., y: 0.), (x: 1., y: 0.), (x: 1., y: 1.)],
            polygon![(x: 5., y: 5.), (x: 6., y: 5.), (x: 6., y: 6.)],
        ]);
        let record = Record::new(Geometry::MultiPolygon(multi), attributes.clone());

        let parts = record.explode();
        assert_eq!(parts.len(), 2);
        for part in &parts {
            assert_eq!(part.geometry_type(), GeometryType::Polygon);
            assert_eq!(part.attributes, attributes);
        }
    }

    #[test]
    fn explode_distributes_z_values() {
        let multi = geo::MultiLineString::new(vec![
            line_string![(x: 0., y: 0.), (x: 1., y: 1.)],
            line_string![(x: 2., y: 2.), (x: 3., y: 3.), (x: 4., y: 4.)],
        ]);
        let record = Record::new(Geometry::MultiLineString(multi), Map::new())
            .with_z(vec![10., 11., 20., 21., 22.]);

        let parts = record.explode();
        assert_eq!(parts[0].z, Some(vec![10., 11.]));
        assert_eq!(parts[1].z, Some(vec![20., 21., 22.]));
    }

    #[test]
    fn single_part_records_are_untouched_by_explode() {
        let record = Record::new(Geometry::Point(point!(x: 1., y: 2.)), Map::new());
        assert_eq!(record.clone().explode(), vec![record]);
    }

    #[test]
    fn geographic_crs_detection() {
        assert!(Crs::WGS84.is_geographic());
        assert!(Crs::Epsg(4674).is_geographic());
        assert!(!Crs::Epsg(32721).is_geographic());
        assert!(Crs::Definition("GEOGCS[\"SIRGAS 2000\"]".into()).is_geographic());
        assert!(!Crs::Definition("PROJCS[\"x\"]".into()).is_geographic());
    }

    #[test]
    fn append_refuses_mixed_crs() {
        let mut left = VectorDataset::new(Crs::WGS84);
        let right = VectorDataset::new(Crs::Epsg(32721));
        assert!(left.append(right).is_err());
    }
}
