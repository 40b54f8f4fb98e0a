use geo::{HaversineDistance, Point};
use serde::{Deserialize, Serialize};

/// Mean earth radius (m) used by the haversine implementation
const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// WGS84 position in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Returns `None` unless both components are finite and in range.
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let lat_ok = latitude.is_finite() && (-90.0..=90.0).contains(&latitude);
        let lng_ok = longitude.is_finite() && (-180.0..=180.0).contains(&longitude);

        (lat_ok && lng_ok).then_some(Self {
            latitude,
            longitude,
        })
    }

    /// Great-circle distance to `other` in meters
    pub fn distance_meters(&self, other: &GeoPoint) -> f64 {
        let a = Point::new(self.longitude, self.latitude);
        let b = Point::new(other.longitude, other.latitude);

        let d = a.haversine_distance(&b);
        // rounding inside asin can push near-antipodal pairs slightly past 1.0
        if d.is_nan() {
            core::f64::consts::PI * EARTH_RADIUS_METERS
        } else {
            d.max(0.0)
        }
    }

    pub fn within_geofence(&self, center: &GeoPoint, radius_km: f64) -> bool {
        within_radius(self.distance_meters(center), radius_km)
    }
}

/// Boundary is inclusive.
pub fn within_radius(distance_meters: f64, radius_km: f64) -> bool {
    distance_meters <= radius_km * 1000.0
}
