//! ESRI Shapefile reading, and writing of a zipped `.shp/.shx/.dbf/.prj/.cpg`
//! bundle.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io;
use std::path::Path;

use geo::Geometry;
use log::warn;
use serde_json::{Map, Number, Value};
use shapefile::dbase::{self, FieldName, FieldValue, TableWriterBuilder};
use shapefile::record::EsriShape;
use shapefile::{Point, Polygon, PolygonRing, Polyline, Reader, Shape, Writer};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::dataset::{Crs, GeometryType, Record, VectorDataset};
use crate::error::{IngestError, Result};

const CHARACTER_FIELD_LENGTH: u8 = 254;
const FIELD_NAME_LENGTH: usize = 10;
const BUNDLE_MEMBERS: [&str; 5] = ["shp", "shx", "dbf", "prj", "cpg"];

pub fn read_shapefile(path: &Path) -> Result<Vec<Record>> {
    let mut reader = Reader::from_path(path).map_err(|e| IngestError::unreadable(path, e))?;

    let mut records = Vec::new();
    for item in reader.iter_shapes_and_records() {
        let (shape, record) = item.map_err(|e| IngestError::unreadable(path, e))?;
        if matches!(shape, Shape::NullShape) {
            continue;
        }
        let z = shape_z(&shape);
        let geometry =
            Geometry::<f64>::try_from(shape).map_err(|e| IngestError::unreadable(path, e))?;

        let fields: HashMap<String, FieldValue> = record.into();
        let mut names: Vec<_> = fields.keys().cloned().collect();
        names.sort();
        let mut attributes = Map::new();
        for name in names {
            if let Some(value) = fields.get(&name) {
                attributes.insert(name, field_to_json(value));
            }
        }

        let record = Record::new(geometry, attributes);
        records.push(match z {
            Some(z) => record.with_z(z),
            None => record,
        });
    }

    if records.is_empty() {
        warn!("{} holds no shapes", path.display());
    }
    Ok(records)
}

fn shape_z(shape: &Shape) -> Option<Vec<f64>> {
    match shape {
        Shape::PointZ(point) => Some(vec![point.z]),
        Shape::MultipointZ(multi) => Some(multi.points().iter().map(|p| p.z).collect()),
        Shape::PolylineZ(line) => Some(line.parts().iter().flatten().map(|p| p.z).collect()),
        Shape::PolygonZ(polygon) => Some(
            polygon
                .rings()
                .iter()
                .flat_map(|ring| ring.points())
                .map(|p| p.z)
                .collect(),
        ),
        _ => None,
    }
}

fn field_to_json(value: &FieldValue) -> Value {
    let number = |n: f64| Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null);
    match value {
        FieldValue::Character(text) => text
            .as_ref()
            .map(|t| Value::String(t.trim().to_string()))
            .unwrap_or(Value::Null),
        FieldValue::Memo(text) => Value::String(text.clone()),
        FieldValue::Numeric(n) => n.map(number).unwrap_or(Value::Null),
        FieldValue::Float(n) => n.map(|n| number(f64::from(n))).unwrap_or(Value::Null),
        FieldValue::Double(n) | FieldValue::Currency(n) => number(*n),
        FieldValue::Integer(n) => Value::from(*n),
        FieldValue::Logical(b) => b.map(Value::Bool).unwrap_or(Value::Null),
        FieldValue::Date(date) => date
            .as_ref()
            .map(|d| Value::String(format!("{:04}-{:02}-{:02}", d.year(), d.month(), d.day())))
            .unwrap_or(Value::Null),
        FieldValue::DateTime(datetime) => {
            let d = datetime.date();
            Value::String(format!("{:04}-{:02}-{:02}", d.year(), d.month(), d.day()))
        }
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    }
}

/// Writes `dataset` as a shapefile named `<stem>` into a scratch directory
/// next to `zip_path` and packs the members into `zip_path`.
pub fn write_shapefile_bundle(dataset: &VectorDataset, zip_path: &Path, stem: &str) -> Result<()> {
    let out_dir = zip_path.parent().unwrap_or_else(|| Path::new("."));
    let scratch = tempfile::Builder::new()
        .prefix(".shp-bundle")
        .tempdir_in(out_dir)?;
    let shp_path = scratch.path().join(format!("{stem}.shp"));

    write_shapefile(dataset, &shp_path)?;
    fs::write(scratch.path().join(format!("{stem}.cpg")), "UTF-8")?;
    match prj_wkt(&dataset.crs) {
        Some(wkt) => fs::write(scratch.path().join(format!("{stem}.prj")), wkt)?,
        None => warn!("No WKT known for {}, bundle is written without .prj", dataset.crs),
    }

    let mut zip = ZipWriter::new(File::create(zip_path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for extension in BUNDLE_MEMBERS {
        let member = scratch.path().join(format!("{stem}.{extension}"));
        if !member.is_file() {
            continue;
        }
        zip.start_file(format!("{stem}.{extension}"), options)?;
        io::copy(&mut File::open(&member)?, &mut zip)?;
    }
    zip.finish()?;
    Ok(())
}

/// Writes the dataset as a plain shapefile at `shp_path`. Every attribute
/// becomes a character field; a shapefile holds exactly one shape type.
pub fn write_shapefile(dataset: &VectorDataset, shp_path: &Path) -> Result<()> {
    let kinds: BTreeSet<&'static str> = dataset
        .records
        .iter()
        .map(|record| shape_family(record.geometry_type()))
        .collect();
    if kinds.len() > 1 {
        return Err(IngestError::InvalidInput {
            reason: format!(
                "a shapefile holds a single shape type, got {}",
                kinds.into_iter().collect::<Vec<_>>().join(", ")
            ),
        });
    }

    let fields = field_names(dataset);
    let mut builder = TableWriterBuilder::new();
    for (_, short) in &fields {
        let name = FieldName::try_from(short.as_str()).map_err(|e| IngestError::InvalidInput {
            reason: format!("cannot use '{short}' as a dbf field name: {e:?}"),
        })?;
        builder = builder.add_character_field(name, CHARACTER_FIELD_LENGTH);
    }

    let rows = dataset.records.iter().map(|record| {
        let mut row = dbase::Record::default();
        for (key, short) in &fields {
            let text = match record.attributes.get(key) {
                None | Some(Value::Null) => None,
                Some(Value::String(text)) => Some(text.clone()),
                Some(other) => Some(other.to_string()),
            };
            row.insert(short.clone(), FieldValue::Character(text));
        }
        row
    });

    match kinds.into_iter().next() {
        Some("point") => write_shapes(
            shp_path,
            builder,
            dataset.records.iter().map(|r| point_shape(&r.geometry)).zip(rows),
        ),
        Some("polyline") => write_shapes(
            shp_path,
            builder,
            dataset.records.iter().map(|r| polyline_shape(&r.geometry)).zip(rows),
        ),
        _ => write_shapes(
            shp_path,
            builder,
            dataset.records.iter().map(|r| polygon_shape(&r.geometry)).zip(rows),
        ),
    }
}

fn write_shapes<S: EsriShape>(
    shp_path: &Path,
    builder: TableWriterBuilder,
    items: impl Iterator<Item = (Option<S>, dbase::Record)>,
) -> Result<()> {
    let mut writer = Writer::from_path(shp_path, builder)?;
    for (shape, row) in items {
        match shape {
            Some(shape) => writer.write_shape_and_record(&shape, &row)?,
            None => warn!("Skipping a geometry that has no shapefile representation"),
        }
    }
    Ok(())
}

fn shape_family(geometry_type: GeometryType) -> &'static str {
    match geometry_type {
        GeometryType::Point | GeometryType::MultiPoint => "point",
        GeometryType::LineString | GeometryType::MultiLineString => "polyline",
        _ => "polygon",
    }
}

fn point_shape(geometry: &Geometry<f64>) -> Option<Point> {
    match geometry {
        Geometry::Point(point) => Some(Point::new(point.x(), point.y())),
        _ => None,
    }
}

fn polyline_shape(geometry: &Geometry<f64>) -> Option<Polyline> {
    let parts: Vec<Vec<Point>> = match geometry {
        Geometry::LineString(line) => vec![to_points(line)],
        Geometry::MultiLineString(multi) => multi.0.iter().map(to_points).collect(),
        _ => return None,
    };
    let parts: Vec<_> = parts.into_iter().filter(|part| part.len() >= 2).collect();
    (!parts.is_empty()).then(|| Polyline::with_parts(parts))
}

fn polygon_shape(geometry: &Geometry<f64>) -> Option<Polygon> {
    let polygons = match geometry {
        Geometry::Polygon(polygon) => vec![polygon],
        Geometry::MultiPolygon(multi) => multi.0.iter().collect(),
        _ => return None,
    };
    let mut rings = Vec::new();
    for polygon in polygons {
        rings.push(PolygonRing::Outer(to_points(polygon.exterior())));
        for interior in polygon.interiors() {
            rings.push(PolygonRing::Inner(to_points(interior)));
        }
    }
    (!rings.is_empty()).then(|| Polygon::with_rings(rings))
}

fn to_points(line: &geo::LineString<f64>) -> Vec<Point> {
    line.0.iter().map(|c| Point::new(c.x, c.y)).collect()
}

/// Attribute keys in first-seen order, paired with a unique dbf field name.
fn field_names(dataset: &VectorDataset) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();
    for record in &dataset.records {
        for key in record.attributes.keys() {
            if fields.iter().any(|(existing, _)| existing == key) {
                continue;
            }
            let base: String = key
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
                .take(FIELD_NAME_LENGTH)
                .collect();
            let base = if base.is_empty() { "field".to_string() } else { base };
            let mut short = base.clone();
            let mut suffix = 1;
            while fields.iter().any(|(_, taken)| taken.eq_ignore_ascii_case(&short)) {
                let tail = suffix.to_string();
                let keep = FIELD_NAME_LENGTH.saturating_sub(tail.len()).min(base.len());
                short = format!("{}{tail}", &base[..keep]);
                suffix += 1;
            }
            fields.push((key.clone(), short));
        }
    }
    fields
}

const WGS84_GEOGCS: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AUTHORITY["EPSG","4326"]]"#;

/// WKT for the `.prj` sidecar. Only WGS84, WGS84 / UTM and raw definitions
/// are known without a CRS database.
pub fn prj_wkt(crs: &Crs) -> Option<String> {
    match crs {
        Crs::Epsg(4326) => Some(WGS84_GEOGCS.to_string()),
        Crs::Epsg(code @ (32601..=32660 | 32701..=32760)) => {
            let zone = code % 100;
            let south = *code > 32700;
            let central_meridian = f64::from(zone) * 6.0 - 183.0;
            let false_northing = if south { 10_000_000 } else { 0 };
            Some(format!(
                r#"PROJCS["WGS 84 / UTM zone {zone}{hemisphere}",{WGS84_GEOGCS},PROJECTION["Transverse_Mercator"],PARAMETER["latitude_of_origin",0],PARAMETER["central_meridian",{central_meridian}],PARAMETER["scale_factor",0.9996],PARAMETER["false_easting",500000],PARAMETER["false_northing",{false_northing}],UNIT["metre",1,AUTHORITY["EPSG","9001"]],AXIS["Easting",EAST],AXIS["Northing",NORTH],AUTHORITY["EPSG","{code}"]]"#,
                hemisphere = if south { "S" } else { "N" },
            ))
        }
        Crs::Epsg(_) => None,
        Crs::Definition(definition) => Some(definition.clone()),
    }
}
