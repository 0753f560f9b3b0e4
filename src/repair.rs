//! Geometry repair applied once to the merged dataset.
//!
//! Order matters: Z is dropped first (the planar primitives cannot carry it),
//! then simplification, then re-noding of polygons, then explosion and
//! attribute coercion. Every step is a no-op on its own output, so the whole
//! engine is idempotent.

use std::collections::{BTreeSet, HashSet};

use geo::{Area, Geometry, LineString, Polygon, Simplify};
use serde_json::Value;

use crate::dataset::{explode_geometry, Record, VectorDataset};
use crate::report::Reporter;

/// Douglas-Peucker tolerance in projected units.
pub const SIMPLIFY_TOLERANCE: f64 = 1e-5;
/// Scale applied to [`SIMPLIFY_TOLERANCE`] for geographic (degree) CRSs.
pub const GEOGRAPHIC_SCALE: f64 = 9e-6;

pub fn simplify_tolerance(geographic: bool) -> f64 {
    if geographic {
        SIMPLIFY_TOLERANCE * GEOGRAPHIC_SCALE
    } else {
        SIMPLIFY_TOLERANCE
    }
}

/// Returns a dataset of valid, planar, single-part geometries in the same CRS.
pub fn repair_geometries(dataset: VectorDataset, reporter: &dyn Reporter) -> VectorDataset {
    let VectorDataset { crs, records } = dataset;
    let tolerance = simplify_tolerance(crs.is_geographic());

    let mut dropped_z = false;
    let mut vanished = 0usize;
    let mut repaired = Vec::with_capacity(records.len());
    for mut record in records {
        if record.z.take().is_some() && !dropped_z {
            reporter.progress("Dropping Z coordinates, output is 2D");
            dropped_z = true;
        }

        let parts = make_valid(simplify(record.geometry, tolerance));
        if parts.is_empty() {
            vanished += 1;
            continue;
        }
        repaired.extend(
            parts
                .into_iter()
                .map(|part| Record::new(part, record.attributes.clone())),
        );
    }

    if vanished > 0 {
        reporter.warn(&format!("{vanished} geometries collapsed during repair and were removed"));
    }

    coerce_attributes(&mut repaired, reporter);
    VectorDataset::with_records(crs, repaired)
}

/// Douglas-Peucker per geometry kind. Points have nothing to simplify.
pub fn simplify(geometry: Geometry<f64>, tolerance: f64) -> Geometry<f64> {
    match geometry {
        Geometry::LineString(line) => Geometry::LineString(line.simplify(&tolerance)),
        Geometry::MultiLineString(multi) => Geometry::MultiLineString(multi.simplify(&tolerance)),
        Geometry::Polygon(polygon) => Geometry::Polygon(polygon.simplify(&tolerance)),
        Geometry::MultiPolygon(multi) => Geometry::MultiPolygon(multi.simplify(&tolerance)),
        Geometry::GeometryCollection(collection) => Geometry::GeometryCollection(
            collection
                .into_iter()
                .map(|member| simplify(member, tolerance))
                .collect(),
        ),
        other => other,
    }
}

/// Splits into single parts and makes each one valid.
///
/// Polygons are re-noded through a unary union, which resolves
/// self-intersections, fixes ring orientation and may yield several parts.
/// Lines lose consecutive duplicate vertices. Parts without area or length
/// are discarded.
pub fn make_valid(geometry: Geometry<f64>) -> Vec<Geometry<f64>> {
    explode_geometry(geometry)
        .into_iter()
        .flat_map(|part| match part {
            Geometry::Polygon(polygon) => valid_polygons(&polygon)
                .into_iter()
                .map(Geometry::Polygon)
                .collect(),
            Geometry::LineString(line) => valid_line(line)
                .map(Geometry::LineString)
                .into_iter()
                .collect(),
            Geometry::Point(point) if point.x().is_finite() && point.y().is_finite() => {
                vec![Geometry::Point(point)]
            }
            _ => Vec::new(),
        })
        .collect()
}

fn valid_polygons(polygon: &Polygon<f64>) -> Vec<Polygon<f64>> {
    if polygon.exterior().0.len() < 4 {
        return Vec::new();
    }
    geo::unary_union([polygon])
        .0
        .into_iter()
        .filter(|part| part.unsigned_area() > 0.0)
        .collect()
}

fn valid_line(mut line: LineString<f64>) -> Option<LineString<f64>> {
    line.0.dedup();
    (line.0.len() >= 2).then_some(line)
}

/// Turns attribute columns with mixed JSON types, or holding arrays and
/// objects, into text so every column has one scalar type. Nulls stay null.
pub fn coerce_attributes(records: &mut [Record], reporter: &dyn Reporter) {
    let mut kinds: Vec<(String, BTreeSet<&'static str>)> = Vec::new();
    for record in records.iter() {
        for (key, value) in &record.attributes {
            let Some(kind) = json_kind(value) else {
                continue;
            };
            match kinds.iter_mut().find(|(existing, _)| existing == key) {
                Some((_, seen)) => {
                    seen.insert(kind);
                }
                None => kinds.push((key.clone(), BTreeSet::from([kind]))),
            }
        }
    }

    let coerced: HashSet<String> = kinds
        .into_iter()
        .filter(|(_, seen)| seen.len() > 1 || seen.contains("array") || seen.contains("object"))
        .map(|(key, _)| key)
        .collect();
    if coerced.is_empty() {
        return;
    }

    let mut names: Vec<_> = coerced.iter().map(String::as_str).collect();
    names.sort_unstable();
    reporter.progress(&format!("Storing mixed-type attributes as text: {}", names.join(", ")));

    for record in records.iter_mut() {
        for (key, value) in record.attributes.iter_mut() {
            if !coerced.contains(key) {
                continue;
            }
            let text = match &*value {
                Value::Null | Value::String(_) => continue,
                other => other.to_string(),
            };
            *value = Value::String(text);
        }
    }
}

fn json_kind(value: &Value) -> Option<&'static str> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some("bool"),
        Value::Number(_) => Some("number"),
        Value::String(_) => Some("string"),
        Value::Array(_) => Some("array"),
        Value::Object(_) => Some("object"),
    }
}
