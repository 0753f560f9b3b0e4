use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use geo::Geometry;
use geojson::{Feature, FeatureCollection, GeoJson};
use serde_json::{json, Map, Value};

use crate::dataset::{Crs, Record, VectorDataset};
use crate::error::{IngestError, Result};
use crate::geojson_repair;

/// Reads a GeoJSON file through the repairer. Features whose geometry cannot
/// be converted are reported as an unreadable source.
pub fn read_geojson(path: &Path) -> Result<Vec<Record>> {
    let raw = fs::read_to_string(path).map_err(|e| IngestError::unreadable(path, e))?;
    let features = match geojson_repair::repair(&raw)? {
        GeoJson::FeatureCollection(collection) => collection.features,
        GeoJson::Feature(feature) => vec![feature],
        GeoJson::Geometry(geometry) => vec![Feature::from(geometry)],
    };

    let mut records = Vec::with_capacity(features.len());
    for feature in features {
        let Some(geometry) = feature.geometry else {
            continue;
        };
        let z = position_z(&geometry.value);
        let geometry = Geometry::<f64>::try_from(geometry.value)
            .map_err(|e| IngestError::unreadable(path, e))?;
        let record = Record::new(geometry, feature.properties.unwrap_or_default());
        records.push(match z {
            Some(z) => record.with_z(z),
            None => record,
        });
    }
    Ok(records)
}

/// Z ordinates of every position in document order, or `None` when the
/// geometry is planar. Planar positions inside a 3D geometry count as 0.
fn position_z(value: &geojson::Value) -> Option<Vec<f64>> {
    let mut z = Vec::new();
    let mut has_z = false;
    collect_z(value, &mut z, &mut has_z);
    has_z.then_some(z)
}

fn collect_z(value: &geojson::Value, z: &mut Vec<f64>, has_z: &mut bool) {
    match value {
        geojson::Value::Point(position) => push_z(position, z, has_z),
        geojson::Value::MultiPoint(positions) | geojson::Value::LineString(positions) => {
            for position in positions {
                push_z(position, z, has_z);
            }
        }
        geojson::Value::MultiLineString(lines) | geojson::Value::Polygon(lines) => {
            for position in lines.iter().flatten() {
                push_z(position, z, has_z);
            }
        }
        geojson::Value::MultiPolygon(polygons) => {
            for position in polygons.iter().flatten().flatten() {
                push_z(position, z, has_z);
            }
        }
        geojson::Value::GeometryCollection(geometries) => {
            for geometry in geometries {
                collect_z(&geometry.value, z, has_z);
            }
        }
    }
}

fn push_z(position: &[f64], z: &mut Vec<f64>, has_z: &mut bool) {
    *has_z |= position.len() > 2;
    z.push(position.get(2).copied().unwrap_or(0.0));
}

/// Writes the dataset as a pretty-printed FeatureCollection. A non-WGS84
/// dataset carries a legacy `crs` member so readers can tell.
pub fn write_geojson(dataset: &VectorDataset, path: &Path) -> Result<()> {
    let features = dataset
        .records
        .iter()
        .map(|record| Feature {
            bbox: None,
            geometry: Some(geojson::Geometry::new(geojson::Value::from(&record.geometry))),
            id: None,
            properties: Some(record.attributes.clone()),
            foreign_members: None,
        })
        .collect();

    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: crs_member(&dataset.crs),
    };

    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, &GeoJson::from(collection))?;
    Ok(())
}

fn crs_member(crs: &Crs) -> Option<Map<String, Value>> {
    let name = match crs {
        Crs::Epsg(4326) => return None,
        Crs::Epsg(code) => format!("urn:ogc:def:crs:EPSG::{code}"),
        Crs::Definition(definition) => definition.clone(),
    };
    let mut members = Map::new();
    members.insert(
        "crs".to_string(),
        json!({ "type": "name", "properties": { "name": name } }),
    );
    Some(members)
}
