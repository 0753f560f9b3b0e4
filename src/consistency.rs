//! Cross-check of ingested features against a reference boundary layer.
//!
//! Everything here works in a metric CRS; the caller projects both layers to
//! the same UTM zone first so the tolerance is in metres.

use std::collections::HashSet;

use geo::{
    BooleanOps, BoundingRect, Contains, Coord, Geometry, Intersects, LineString, MultiLineString,
    MultiPolygon, Point, Polygon, Rect,
};
use geos::Geom;
use log::debug;
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::dataset::{explode_geometry, Record, VectorDataset};
use crate::error::{IngestError, Result};

/// Distance, in working CRS units, a feature's boundary point may lie from
/// the reference edge.
pub const DEFAULT_TOLERANCE: f64 = 20.0;

/// A boundary edge stored in the R-tree.
#[derive(Clone, Debug)]
pub struct EdgeSegment {
    pub start: [f64; 2],
    pub end: [f64; 2],
}

impl EdgeSegment {
    pub fn new(start: [f64; 2], end: [f64; 2]) -> Self {
        Self { start, end }
    }

    pub fn distance_squared_to_point(&self, point: [f64; 2]) -> f64 {
        let [ax, ay] = self.start;
        let [bx, by] = self.end;
        let [px, py] = point;

        let abx = bx - ax;
        let aby = by - ay;
        let apx = px - ax;
        let apy = py - ay;

        let ab_sq = abx * abx + aby * aby;
        if ab_sq == 0.0 {
            return apx * apx + apy * apy;
        }

        // projection clamped to the segment
        let t = ((apx * abx + apy * aby) / ab_sq).clamp(0.0, 1.0);
        let dx = px - (ax + t * abx);
        let dy = py - (ay + t * aby);
        dx * dx + dy * dy
    }
}

impl RTreeObject for EdgeSegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.start[0].min(self.end[0]), self.start[1].min(self.end[1])],
            [self.start[0].max(self.end[0]), self.start[1].max(self.end[1])],
        )
    }
}

impl PointDistance for EdgeSegment {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        self.distance_squared_to_point(*point)
    }
}

/// One reference polygon with its edges indexed for distance queries.
pub struct BoundaryIndex {
    polygon: Polygon<f64>,
    bounds: Option<Rect<f64>>,
    edges: RTree<EdgeSegment>,
}

impl BoundaryIndex {
    pub fn new(polygon: Polygon<f64>) -> Self {
        let mut segments = ring_edges(polygon.exterior());
        for interior in polygon.interiors() {
            segments.extend(ring_edges(interior));
        }
        BoundaryIndex {
            bounds: polygon.bounding_rect(),
            edges: RTree::bulk_load(segments),
            polygon,
        }
    }

    pub fn polygon(&self) -> &Polygon<f64> {
        &self.polygon
    }

    /// Distance from `coord` to the nearest edge of the polygon.
    pub fn distance_to_edge(&self, coord: Coord<f64>) -> f64 {
        let point = [coord.x, coord.y];
        self.edges
            .nearest_neighbor(&point)
            .map(|edge| edge.distance_squared_to_point(point).sqrt())
            .unwrap_or(f64::INFINITY)
    }

    /// Bounding-box rejection first, exact intersection test after.
    pub fn touches(&self, geometry: &Geometry<f64>) -> bool {
        match (self.bounds, geometry.bounding_rect()) {
            (Some(bounds), Some(other)) if bounds.intersects(&other) => {
                self.polygon.intersects(geometry)
            }
            _ => false,
        }
    }
}

fn ring_edges(ring: &LineString<f64>) -> Vec<EdgeSegment> {
    ring.0
        .windows(2)
        .map(|pair| EdgeSegment::new([pair[0].x, pair[0].y], [pair[1].x, pair[1].y]))
        .collect()
}

/// Polygons of a boundary layer, multi-parts exploded.
pub fn boundary_polygons(boundary: &VectorDataset) -> Vec<Polygon<f64>> {
    boundary
        .geometries()
        .cloned()
        .flat_map(explode_geometry)
        .filter_map(|geometry| match geometry {
            Geometry::Polygon(polygon) => Some(polygon),
            _ => None,
        })
        .collect()
}

/// Points of linear and polygonal `features` lying farther than `tolerance`
/// from the edge of the boundary polygon they intersect.
///
/// Line chains contribute their endpoints and polygons their exterior
/// vertices, in both cases only those outside the boundary polygon. The result keeps
/// first-seen order and holds each location once.
///
/// Fails with [`IngestError::InvalidInput`] when there is nothing to check:
/// no boundary polygon, no linear or polygonal feature, or no feature
/// overlapping the boundary at all.
pub fn find_inconsistent_points(
    features: &VectorDataset,
    boundary: &VectorDataset,
    tolerance: f64,
) -> Result<Vec<Point<f64>>> {
    let indexes: Vec<BoundaryIndex> = boundary_polygons(boundary)
        .into_iter()
        .map(BoundaryIndex::new)
        .collect();
    if indexes.is_empty() {
        return Err(invalid("reference boundary holds no polygon"));
    }

    let mut lines = Vec::new();
    let mut areas = Vec::new();
    for geometry in features.geometries().cloned().flat_map(explode_geometry) {
        match geometry {
            Geometry::LineString(line) if line.0.len() >= 2 => lines.push(line),
            Geometry::Polygon(polygon) => areas.push(polygon),
            _ => {}
        }
    }
    if lines.is_empty() && areas.is_empty() {
        return Err(invalid("no valid linear or polygonal geometry to check"));
    }

    let chains = merge_lines(lines)?;
    let candidates: Vec<Geometry<f64>> = chains
        .into_iter()
        .map(Geometry::LineString)
        .chain(areas.into_iter().map(Geometry::Polygon))
        .collect();

    let overlapping = candidates
        .iter()
        .any(|geometry| indexes.iter().any(|index| index.touches(geometry)));
    if !overlapping {
        return Err(invalid("no geometry overlaps the reference boundary"));
    }

    let mut seen = HashSet::new();
    let mut inconsistent = Vec::new();
    for index in &indexes {
        for geometry in candidates.iter().filter(|g| index.touches(g)) {
            for coord in boundary_points(geometry, index.polygon()) {
                if index.distance_to_edge(coord) > tolerance && seen.insert(coord_key(coord)) {
                    inconsistent.push(Point::from(coord));
                }
            }
        }
    }

    debug!(
        "{} of {} features checked, {} inconsistent points",
        candidates.len(),
        features.len(),
        inconsistent.len()
    );
    Ok(inconsistent)
}

/// Chain endpoints and polygon exterior vertices of `geometry` that lie
/// outside `reference`. Points inside the boundary are never inconsistent,
/// however far they are from its edge.
fn boundary_points(geometry: &Geometry<f64>, reference: &Polygon<f64>) -> Vec<Coord<f64>> {
    let candidates = match geometry {
        Geometry::LineString(line) => match (line.0.first(), line.0.last()) {
            (Some(first), Some(last)) if first != last => vec![*first, *last],
            (Some(first), Some(_)) => vec![*first],
            _ => Vec::new(),
        },
        Geometry::Polygon(polygon) => {
            let ring = &polygon.exterior().0;
            match (ring.first(), ring.last()) {
                (Some(first), Some(last)) if ring.len() > 1 && first == last => {
                    ring[..ring.len() - 1].to_vec()
                }
                _ => ring.clone(),
            }
        }
        _ => Vec::new(),
    };
    candidates
        .into_iter()
        .filter(|coord| !reference.contains(&Point::from(*coord)))
        .collect()
}

/// Joins lines that meet end to end into maximal chains with GEOS line
/// merging. Lines are only joined through nodes shared by exactly two line
/// ends, so junctions stay chain boundaries; a closed loop comes back as one
/// closed chain.
pub fn merge_lines(lines: Vec<LineString<f64>>) -> Result<Vec<LineString<f64>>> {
    let lines: Vec<LineString<f64>> = lines.into_iter().filter(|l| l.0.len() >= 2).collect();
    if lines.is_empty() {
        return Ok(Vec::new());
    }

    let network = geos::Geometry::try_from(&MultiLineString::new(lines))?;
    let merged = Geometry::<f64>::try_from(network.line_merge()?)?;
    Ok(explode_geometry(merged)
        .into_iter()
        .filter_map(|part| match part {
            Geometry::LineString(line) if line.0.len() >= 2 => Some(line),
            _ => None,
        })
        .collect())
}

fn coord_key(coord: Coord<f64>) -> (u64, u64) {
    // +0.0 and -0.0 share a key
    ((coord.x + 0.0).to_bits(), (coord.y + 0.0).to_bits())
}

/// Cuts every record down to the part inside the boundary polygons. Records
/// with nothing inside are dropped; pieces keep their parent's attributes.
pub fn clip_to_boundary(dataset: VectorDataset, boundary: &[Polygon<f64>]) -> VectorDataset {
    let mask = MultiPolygon::new(boundary.to_vec());
    let crs = dataset.crs.clone();

    let mut clipped = Vec::new();
    for record in dataset.records {
        let pieces: Vec<Geometry<f64>> = match &record.geometry {
            Geometry::Point(point) => {
                if mask.intersects(point) {
                    vec![Geometry::Point(*point)]
                } else {
                    Vec::new()
                }
            }
            Geometry::LineString(line) => mask
                .clip(&MultiLineString::new(vec![line.clone()]), false)
                .0
                .into_iter()
                .filter(|piece| piece.0.len() >= 2)
                .map(Geometry::LineString)
                .collect(),
            Geometry::Polygon(polygon) => mask
                .intersection(&MultiPolygon::new(vec![polygon.clone()]))
                .0
                .into_iter()
                .map(Geometry::Polygon)
                .collect(),
            other => explode_geometry(other.clone()),
        };
        clipped.extend(
            pieces
                .into_iter()
                .map(|piece| Record::new(piece, record.attributes.clone())),
        );
    }
    VectorDataset::with_records(crs, clipped)
}

fn invalid(reason: &str) -> IngestError {
    IngestError::InvalidInput {
        reason: reason.to_string(),
    }
}
