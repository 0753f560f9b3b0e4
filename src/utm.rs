use geo::{Centroid, Point};

use crate::crs::Transformer;
use crate::dataset::{Crs, VectorDataset};
use crate::error::{IngestError, Result};

/// Standard 6° UTM zone for a longitude, 1..=60.
pub fn utm_zone(lon: f64) -> u32 {
    let zone = ((lon + 180.0) / 6.0).floor() as i64 + 1;
    zone.clamp(1, 60) as u32
}

/// EPSG code of the WGS84 / UTM zone containing `(lon, lat)`:
/// 326xx in the northern hemisphere, 327xx in the southern one.
pub fn utm_epsg(lon: f64, lat: f64) -> u32 {
    let base = if lat < 0.0 { 32700 } else { 32600 };
    base + utm_zone(lon)
}

/// Picks the metric CRS for distance and area work around `point`, which is
/// expressed in `source`.
pub fn select_utm(point: Point<f64>, source: &Crs) -> Result<Crs> {
    let (lon, lat) = if *source == Crs::WGS84 {
        (point.x(), point.y())
    } else {
        Transformer::new(source, &Crs::WGS84)?.transform_xy(point.x(), point.y())?
    };

    if !lon.is_finite() || !lat.is_finite() {
        return Err(IngestError::InvalidInput {
            reason: format!("cannot pick a UTM zone for ({lon}, {lat})"),
        });
    }

    Ok(Crs::Epsg(utm_epsg(lon, lat)))
}

/// Centroid of the first record that has one.
pub fn representative_point(dataset: &VectorDataset) -> Option<Point<f64>> {
    dataset.geometries().find_map(|geometry| geometry.centroid())
}
