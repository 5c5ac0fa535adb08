//! Coordinate handling for GML points

use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum GeoError {
    #[error("Unsupported coordinate reference system '{0}'")]
    UnsupportedCrs(String),

    #[error("Malformed position '{0}'")]
    MalformedPosition(String),
}

/// Converts a GML `pos` in a named reference system to WGS84
pub trait CoordinateTransform: Send + Sync {
    /// Returns `(longitude, latitude)`
    fn to_wgs84(&self, pos: &str, srs_name: &str) -> Result<(f64, f64), GeoError>;
}

/// Accepts positions that are already WGS84 (EPSG:4326, latitude first)
#[derive(Debug, Clone, Copy, Default)]
pub struct Wgs84Transform;

impl CoordinateTransform for Wgs84Transform {
    fn to_wgs84(&self, pos: &str, srs_name: &str) -> Result<(f64, f64), GeoError> {
        if !is_wgs84(srs_name) {
            return Err(GeoError::UnsupportedCrs(srs_name.to_string()));
        }

        let mut parts = pos.split_whitespace().map(str::parse::<f64>);
        match (parts.next(), parts.next()) {
            (Some(Ok(lat)), Some(Ok(lon))) => Ok((lon, lat)),
            _ => Err(GeoError::MalformedPosition(pos.to_string())),
        }
    }
}

/// Matches `EPSG:4326`, `urn:ogc:def:crs:EPSG::4326` and the
/// `http://www.opengis.net/def/crs/EPSG/0/4326` form
fn is_wgs84(srs_name: &str) -> bool {
    let code = srs_name
        .rsplit([':', '/'])
        .next()
        .unwrap_or_default();
    code == "4326" && srs_name.to_ascii_uppercase().contains("EPSG")
}

/// GeoJSON point geometry
pub fn geo_json_point(lon: f64, lat: f64) -> Value {
    json!({
        "type": "Point",
        "coordinates": [lon, lat],
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_wgs84_swaps_axis_order() {
        let t = Wgs84Transform;
        assert_eq!(
            t.to_wgs84("48.2 16.37", "urn:ogc:def:crs:EPSG::4326").unwrap(),
            (16.37, 48.2)
        );
        assert_eq!(
            t.to_wgs84("48.2 16.37", "http://www.opengis.net/def/crs/EPSG/0/4326").unwrap(),
            (16.37, 48.2)
        );
    }

    #[test]
    fn test_other_reference_systems_fail() {
        assert!(matches!(
            Wgs84Transform.to_wgs84("4800000 600000", "EPSG:31287"),
            Err(GeoError::UnsupportedCrs(_))
        ));
        assert!(matches!(
            Wgs84Transform.to_wgs84("north", "EPSG:4326"),
            Err(GeoError::MalformedPosition(_))
        ));
    }

    #[test]
    fn test_point_geometry() {
        assert_eq!(
            geo_json_point(16.37, 48.2),
            json!({"type": "Point", "coordinates": [16.37, 48.2]})
        );
    }
}
