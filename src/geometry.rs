//! Geographic primitives: points, bounding boxes and distances in meters.
//!
//! Distances go through the `geo` crate; [`GeoPoint`] converts into its
//! `Point`/`Coord` types with x = longitude, y = latitude.

use geo::algorithm::Distance;
use geo::{Closest, ClosestPoint, Coord, Haversine, Line, Point};
use serde::{Deserialize, Serialize};

/// Mean earth radius, the one `geo`'s haversine metric uses.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Meters spanned by one degree of latitude on the mean-radius sphere.
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// The (0, 0) placeholder many AVL units report before a GPS fix.
    pub fn is_null_island(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }

    pub fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

impl From<GeoPoint> for Coord<f64> {
    fn from(p: GeoPoint) -> Self {
        Coord {
            x: p.longitude,
            y: p.latitude,
        }
    }
}

impl From<GeoPoint> for Point<f64> {
    fn from(p: GeoPoint) -> Self {
        Point::new(p.longitude, p.latitude)
    }
}

/// Inclusive latitude/longitude rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Mexico City and the adjoining metropolitan municipalities.
    pub const MEXICO_CITY: BoundingBox = BoundingBox {
        min_lat: 19.0,
        max_lat: 19.9,
        min_lon: -99.5,
        max_lon: -98.8,
    };

    pub fn contains(&self, p: &GeoPoint) -> bool {
        p.latitude >= self.min_lat
            && p.latitude <= self.max_lat
            && p.longitude >= self.min_lon
            && p.longitude <= self.max_lon
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::MEXICO_CITY
    }
}

/// Haversine distance in meters from `p` to the closest point of `line`.
///
/// A zero-length line has no single closest point, so its start stands in.
pub fn distance_to_line(p: &GeoPoint, line: &Line<f64>) -> f64 {
    let point = Point::from(*p);
    let projection = match line.closest_point(&point) {
        Closest::Intersection(c) | Closest::SinglePoint(c) => c,
        Closest::Indeterminate => line.start_point(),
    };
    Haversine.distance(point, projection)
}

/// Half-widths in degrees (lat, lon) of a square of `meters` around `p`.
pub fn degree_span(p: &GeoPoint, meters: f64) -> (f64, f64) {
    let dlat = meters / METERS_PER_DEGREE;
    let dlon = dlat / p.latitude.to_radians().cos().max(1e-6);
    (dlat, dlon)
}
