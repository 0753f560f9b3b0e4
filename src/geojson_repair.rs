//! Recovery of GeoJSON produced by upstream systems that wrap the document in
//! stray characters and bury coordinates under spurious array levels.
//!
//! The amount of superfluous nesting differs per geometry type, so depth
//! repair is driven by the declared `type` of each geometry rather than by a
//! fixed unwrap count.

use geojson::GeoJson;
use log::trace;
use serde_json::{json, Map, Value};

use crate::dataset::GeometryType;
use crate::error::{IngestError, Result};

/// Repairs `raw` into a structurally valid GeoJSON object.
///
/// Only fails when no JSON object can be recovered, or when what survives
/// repair is still not GeoJSON.
pub fn repair(raw: &str) -> Result<GeoJson> {
    let value = repair_value(raw)?;
    GeoJson::from_json_value(value).map_err(|e| unrepairable(e.to_string()))
}

/// Same as [`repair`], stopping at the JSON level.
pub fn repair_value(raw: &str) -> Result<Value> {
    let trimmed = trim_envelope(raw);
    let mut root: Value = serde_json::from_str(&trimmed).map_err(|e| unrepairable(e.to_string()))?;

    let Value::Object(object) = &mut root else {
        return Err(unrepairable("top-level JSON value is not an object"));
    };

    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if kind.contains("Collection") && object.get("features").is_some_and(Value::is_array) {
        let features = match object.remove("features") {
            Some(Value::Array(features)) => features,
            _ => Vec::new(),
        };
        let total = features.len();
        let repaired: Vec<Value> = features.into_iter().filter_map(repair_feature).collect();
        if repaired.len() < total {
            trace!("Dropped {} features without geometry", total - repaired.len());
        }
        object.insert("features".to_string(), Value::Array(repaired));
        return Ok(root);
    }

    if kind == "Feature" {
        return Ok(match repair_feature(root) {
            Some(feature) => feature,
            None => empty_collection(),
        });
    }

    if GeometryType::from_name(&kind).is_some() {
        let feature = json!({ "type": "Feature", "properties": {}, "geometry": root });
        return Ok(repair_feature(feature).unwrap_or_else(empty_collection));
    }

    Err(unrepairable(format!("unknown GeoJSON type '{kind}'")))
}

/// Strips an equal-length wrapper around the outer object.
///
/// The prefix length is the offset of the first `{` on the first line; the
/// same number of characters is removed from the end of the text. Line
/// breaks are removed before the lines are joined.
pub fn trim_envelope(raw: &str) -> String {
    let mut lines = raw.lines();
    let Some(first) = lines.next() else {
        return String::new();
    };

    let mut joined = String::with_capacity(raw.len());
    joined.push_str(first);
    lines.for_each(|line| joined.push_str(line));

    let k = match first.find('{') {
        Some(offset) => first[..offset].chars().count(),
        None => 0,
    };
    if k == 0 {
        return joined;
    }

    let total = joined.chars().count();
    if 2 * k >= total {
        return String::new();
    }
    joined.chars().skip(k).take(total - 2 * k).collect()
}

/// Number of array levels opening at the start of `coordinates`.
pub fn nesting_depth(coordinates: &Value) -> usize {
    let mut depth = 0;
    let mut current = coordinates;
    while let Value::Array(items) = current {
        depth += 1;
        match items.first() {
            Some(first) => current = first,
            None => break,
        }
    }
    depth
}

fn repair_feature(mut feature: Value) -> Option<Value> {
    let geometry = feature.get_mut("geometry").filter(|g| !g.is_null())?;
    repair_geometry(geometry);
    Some(feature)
}

fn repair_geometry(geometry: &mut Value) {
    let Some(kind) = geometry
        .get("type")
        .and_then(Value::as_str)
        .and_then(GeometryType::from_name)
    else {
        return;
    };

    if kind == GeometryType::GeometryCollection {
        if let Some(Value::Array(members)) = geometry.get_mut("geometries") {
            members.iter_mut().for_each(repair_geometry);
        }
        return;
    }

    let (Some(expected), Some(coordinates)) = (kind.nesting_depth(), geometry.get_mut("coordinates"))
    else {
        return;
    };

    normalize_depth(coordinates, expected);

    match kind {
        GeometryType::Polygon => drop_degenerate_rings(coordinates),
        GeometryType::MultiPolygon => {
            if let Value::Array(polygons) = coordinates {
                polygons.iter_mut().for_each(drop_degenerate_rings);
                if polygons.len() > 1 {
                    polygons.retain(|polygon| !all_rings_degenerate(polygon));
                }
            }
        }
        _ => {}
    }
}

/// Unwraps spurious outer levels until `coordinates` sits at `expected` depth.
///
/// A position that lacks levels is wrapped instead, as long as it bottoms out
/// in a number; empty arrays are left alone.
fn normalize_depth(coordinates: &mut Value, expected: usize) {
    let mut actual = nesting_depth(coordinates);

    while actual > expected {
        let inner = match coordinates {
            Value::Array(items) if !items.is_empty() => items.swap_remove(0),
            _ => break,
        };
        *coordinates = inner;
        actual -= 1;
    }

    if actual < expected && bottoms_out_in_number(coordinates) {
        while actual < expected {
            let inner = std::mem::take(coordinates);
            *coordinates = Value::Array(vec![inner]);
            actual += 1;
        }
    }
}

fn bottoms_out_in_number(coordinates: &Value) -> bool {
    let mut current = coordinates;
    loop {
        match current {
            Value::Array(items) => match items.first() {
                Some(first) => current = first,
                None => return false,
            },
            Value::Number(_) => return true,
            _ => return false,
        }
    }
}

fn point_count(ring: &Value) -> usize {
    ring.as_array().map_or(0, Vec::len)
}

/// Removes rings with two or fewer points, unless the polygon has no other ring.
fn drop_degenerate_rings(polygon: &mut Value) {
    if let Value::Array(rings) = polygon {
        if rings.len() > 1 {
            rings.retain(|ring| point_count(ring) > 2);
        }
    }
}

fn all_rings_degenerate(polygon: &Value) -> bool {
    polygon
        .as_array()
        .is_some_and(|rings| rings.iter().all(|ring| point_count(ring) <= 2))
}

fn empty_collection() -> Value {
    Value::Object(Map::from_iter([
        ("type".to_string(), Value::from("FeatureCollection")),
        ("features".to_string(), Value::Array(Vec::new())),
    ]))
}

fn unrepairable(reason: impl Into<String>) -> IngestError {
    IngestError::UnrepairableInput {
        reason: reason.into(),
    }
}
