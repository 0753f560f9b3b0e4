//! KML Placemark reading with `roxmltree` and a plain string writer.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

use geo::{Coord, Geometry, GeometryCollection, LineString, Point, Polygon};
use roxmltree::Node;
use serde_json::{Map, Value};

use crate::dataset::{Record, VectorDataset};
use crate::error::{IngestError, Result};

const GEOMETRY_TAGS: [&str; 5] = ["Point", "LineString", "LinearRing", "Polygon", "MultiGeometry"];

pub fn read_kml(path: &Path) -> Result<Vec<Record>> {
    let xml = fs::read_to_string(path).map_err(|e| IngestError::unreadable(path, e))?;
    let document = roxmltree::Document::parse(&xml).map_err(|e| IngestError::unreadable(path, e))?;

    let mut records = Vec::new();
    for placemark in document
        .descendants()
        .filter(|node| node.is_element() && node.tag_name().name() == "Placemark")
    {
        let Some(geometry_node) = placemark
            .children()
            .find(|child| child.is_element() && GEOMETRY_TAGS.contains(&child.tag_name().name()))
        else {
            continue;
        };

        let mut z = ZValues::default();
        let geometry = parse_geometry(geometry_node, &mut z)
            .map_err(|reason| IngestError::unreadable(path, reason))?;
        let record = Record::new(geometry, placemark_attributes(placemark));
        records.push(match z.finish() {
            Some(z) => record.with_z(z),
            None => record,
        });
    }
    Ok(records)
}

#[derive(Default)]
struct ZValues {
    values: Vec<f64>,
    present: bool,
}

impl ZValues {
    fn push(&mut self, z: Option<f64>) {
        self.present |= z.is_some();
        self.values.push(z.unwrap_or(0.0));
    }

    fn finish(self) -> Option<Vec<f64>> {
        self.present.then_some(self.values)
    }
}

fn parse_geometry(node: Node<'_, '_>, z: &mut ZValues) -> std::result::Result<Geometry<f64>, String> {
    match node.tag_name().name() {
        "Point" => {
            let coords = coordinates_of(node, z)?;
            let coord = coords
                .first()
                .copied()
                .ok_or_else(|| "Point without coordinates".to_string())?;
            Ok(Geometry::Point(Point::from(coord)))
        }
        "LineString" | "LinearRing" => Ok(Geometry::LineString(LineString::new(coordinates_of(
            node, z,
        )?))),
        "Polygon" => {
            let exterior = boundary_rings(node, "outerBoundaryIs", z)?
                .into_iter()
                .next()
                .ok_or_else(|| "Polygon without outerBoundaryIs".to_string())?;
            let interiors = boundary_rings(node, "innerBoundaryIs", z)?;
            Ok(Geometry::Polygon(Polygon::new(exterior, interiors)))
        }
        "MultiGeometry" => {
            let mut parts = Vec::new();
            for child in node
                .children()
                .filter(|child| child.is_element() && GEOMETRY_TAGS.contains(&child.tag_name().name()))
            {
                parts.push(parse_geometry(child, z)?);
            }
            Ok(Geometry::GeometryCollection(GeometryCollection::new_from(parts)))
        }
        other => Err(format!("unsupported KML geometry <{other}>")),
    }
}

fn boundary_rings(
    polygon: Node<'_, '_>,
    tag: &str,
    z: &mut ZValues,
) -> std::result::Result<Vec<LineString<f64>>, String> {
    let mut rings = Vec::new();
    for boundary in polygon.children().filter(|c| c.is_element() && c.tag_name().name() == tag) {
        if let Some(ring) = child_element(boundary, "LinearRing") {
            rings.push(LineString::new(coordinates_of(ring, z)?));
        }
    }
    Ok(rings)
}

/// Parses the `<coordinates>` child: whitespace separated `lon,lat[,alt]`
/// tuples.
fn coordinates_of(node: Node<'_, '_>, z: &mut ZValues) -> std::result::Result<Vec<Coord<f64>>, String> {
    let text = child_element(node, "coordinates")
        .and_then(|c| c.text())
        .unwrap_or_default();

    let mut coords = Vec::new();
    for tuple in text.split_whitespace() {
        let parts: Vec<f64> = tuple
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| format!("invalid coordinate tuple '{tuple}': {e}"))?;
        if parts.len() < 2 {
            return Err(format!("invalid coordinate tuple '{tuple}'"));
        }
        coords.push(Coord { x: parts[0], y: parts[1] });
        z.push(parts.get(2).copied());
    }
    Ok(coords)
}

fn placemark_attributes(placemark: Node<'_, '_>) -> Map<String, Value> {
    let mut attributes = Map::new();
    for tag in ["name", "description"] {
        if let Some(text) = optional_child_text(placemark, tag) {
            attributes.insert(tag.to_string(), Value::String(text));
        }
    }

    let Some(extended) = child_element(placemark, "ExtendedData") else {
        return attributes;
    };
    for node in extended.descendants().filter(Node::is_element) {
        let Some(name) = node.attribute("name") else {
            continue;
        };
        let value = match node.tag_name().name() {
            "Data" => optional_child_text(node, "value"),
            "SimpleData" => node.text().map(str::trim).map(ToOwned::to_owned),
            _ => continue,
        };
        attributes.insert(
            name.to_string(),
            value.map(Value::String).unwrap_or(Value::Null),
        );
    }
    attributes
}

fn child_element<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|child| child.is_element() && child.tag_name().name() == tag)
}

fn optional_child_text(node: Node<'_, '_>, tag: &str) -> Option<String> {
    child_element(node, tag)
        .and_then(|child| child.text())
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(ToOwned::to_owned)
}

/// Writes one Placemark per record, attributes as `ExtendedData`.
pub fn write_kml(dataset: &VectorDataset, path: &Path, name: &str) -> Result<()> {
    let kml = render_kml(dataset, name).map_err(io::Error::other)?;
    fs::write(path, kml)?;
    Ok(())
}

fn render_kml(dataset: &VectorDataset, name: &str) -> std::result::Result<String, std::fmt::Error> {
    let mut kml = String::new();
    writeln!(kml, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>")?;
    writeln!(kml, "<kml xmlns=\"http://www.opengis.net/kml/2.2\">")?;
    writeln!(kml, "  <Document>")?;
    writeln!(kml, "    <name>{}</name>", xml_escape(name))?;
    for record in &dataset.records {
        writeln!(kml, "    <Placemark>")?;
        if let Some(Value::String(title)) = record.attributes.get("name") {
            writeln!(kml, "      <name>{}</name>", xml_escape(title))?;
        }
        if !record.attributes.is_empty() {
            writeln!(kml, "      <ExtendedData>")?;
            for (key, value) in &record.attributes {
                let text = match value {
                    Value::Null => String::new(),
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                writeln!(
                    kml,
                    "        <Data name=\"{}\"><value>{}</value></Data>",
                    xml_escape(key),
                    xml_escape(&text)
                )?;
            }
            writeln!(kml, "      </ExtendedData>")?;
        }
        write_geometry(&mut kml, &record.geometry, 6)?;
        writeln!(kml, "    </Placemark>")?;
    }
    writeln!(kml, "  </Document>")?;
    writeln!(kml, "</kml>")?;
    Ok(kml)
}

fn write_geometry(kml: &mut String, geometry: &Geometry<f64>, indent: usize) -> std::fmt::Result {
    let pad = " ".repeat(indent);
    match geometry {
        Geometry::Point(point) => {
            writeln!(kml, "{pad}<Point><coordinates>{},{}</coordinates></Point>", point.x(), point.y())
        }
        Geometry::LineString(line) => writeln!(
            kml,
            "{pad}<LineString><coordinates>{}</coordinates></LineString>",
            coordinate_text(line)
        ),
        Geometry::Polygon(polygon) => {
            writeln!(kml, "{pad}<Polygon>")?;
            writeln!(
                kml,
                "{pad}  <outerBoundaryIs><LinearRing><coordinates>{}</coordinates></LinearRing></outerBoundaryIs>",
                coordinate_text(polygon.exterior())
            )?;
            for interior in polygon.interiors() {
                writeln!(
                    kml,
                    "{pad}  <innerBoundaryIs><LinearRing><coordinates>{}</coordinates></LinearRing></innerBoundaryIs>",
                    coordinate_text(interior)
                )?;
            }
            writeln!(kml, "{pad}</Polygon>")
        }
        Geometry::MultiPoint(multi) => write_multi(kml, multi.iter().map(|p| Geometry::Point(*p)), indent),
        Geometry::MultiLineString(multi) => {
            write_multi(kml, multi.iter().cloned().map(Geometry::LineString), indent)
        }
        Geometry::MultiPolygon(multi) => {
            write_multi(kml, multi.iter().cloned().map(Geometry::Polygon), indent)
        }
        Geometry::GeometryCollection(collection) => write_multi(kml, collection.iter().cloned(), indent),
        Geometry::Line(line) => write_geometry(kml, &Geometry::LineString((*line).into()), indent),
        Geometry::Rect(rect) => write_geometry(kml, &Geometry::Polygon(rect.to_polygon()), indent),
        Geometry::Triangle(triangle) => {
            write_geometry(kml, &Geometry::Polygon(triangle.to_polygon()), indent)
        }
    }
}

fn write_multi(
    kml: &mut String,
    parts: impl Iterator<Item = Geometry<f64>>,
    indent: usize,
) -> std::fmt::Result {
    let pad = " ".repeat(indent);
    writeln!(kml, "{pad}<MultiGeometry>")?;
    for part in parts {
        write_geometry(kml, &part, indent + 2)?;
    }
    writeln!(kml, "{pad}</MultiGeometry>")
}

fn coordinate_text(line: &LineString<f64>) -> String {
    line.coords()
        .map(|c| format!("{},{}", c.x, c.y))
        .collect::<Vec<_>>()
        .join(" ")
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Crs;
    use geo::polygon;
    use serde_json::json;

    const PLACEMARKS: &str = r##"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <Placemark>
      <name>Terrace 4</name>
      <ExtendedData>
        <Data name="owner"><value>Silva</value></Data>
        <SchemaData schemaUrl="#s"><SimpleData name="area">12.5</SimpleData></SchemaData>
      </ExtendedData>
      <LineString><coordinates>-54.3,-15.4,410 -54.2,-15.4,412</coordinates></LineString>
    </Placemark>
    <Placemark>
      <MultiGeometry>
        <Point><coordinates>-54.0,-15.0</coordinates></Point>
        <Polygon>
          <outerBoundaryIs><LinearRing><coordinates>0,0 1,0 1,1 0,0</coordinates></LinearRing></outerBoundaryIs>
        </Polygon>
      </MultiGeometry>
    </Placemark>
    <Placemark><name>no geometry</name></Placemark>
  </Document>
</kml>"##;

    #[test]
    fn reads_placemarks_with_extended_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terraces.kml");
        fs::write(&path, PLACEMARKS).unwrap();

        let records = read_kml(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].attributes["name"], json!("Terrace 4"));
        assert_eq!(records[0].attributes["owner"], json!("Silva"));
        assert_eq!(records[0].attributes["area"], json!("12.5"));
        assert_eq!(records[0].z, Some(vec![410.0, 412.0]));
        assert!(matches!(records[1].geometry, Geometry::GeometryCollection(_)));
        assert_eq!(records[1].z, None);
    }

    #[test]
    fn malformed_coordinates_make_the_file_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.kml");
        fs::write(
            &path,
            "<kml><Placemark><Point><coordinates>abc,1</coordinates></Point></Placemark></kml>",
        )
        .unwrap();
        assert!(matches!(
            read_kml(&path),
            Err(IngestError::SourceUnreadable { .. })
        ));
    }

    #[test]
    fn written_kml_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.kml");
        let mut dataset = VectorDataset::new(Crs::WGS84);
        let mut attributes = Map::new();
        attributes.insert("name".into(), json!("A & B"));
        dataset.push(Record::new(
            Geometry::Polygon(polygon![(x: 0., y: 0.), (x: 2., y: 0.), (x: 2., y: 2.)]),
            attributes,
        ));
        write_kml(&dataset, &path, "out").unwrap();

        let records = read_kml(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attributes["name"], json!("A & B"));
        assert_eq!(records[0].geometry, dataset.records[0].geometry);
    }
}
