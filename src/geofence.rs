use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A circular boundary around a fixed point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geofence {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
}

impl Geofence {
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.radius_m.is_finite()
            && self.radius_m > 0.0
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance from the centre, in metres (haversine).
    pub fn distance_m(&self, latitude: f64, longitude: f64) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), latitude.to_radians());
        let d_lat = (latitude - self.latitude).to_radians();
        let d_lon = (longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        self.distance_m(latitude, longitude) <= self.radius_m
    }
}

/// Tracks which side of the fence each vehicle is on and reports crossings.
///
/// Vehicles start out inside, so the first reading outside is a crossing.
#[derive(Debug)]
pub struct GeofenceMonitor {
    fence: Geofence,
    outside: Mutex<HashMap<String, bool>>,
}

impl GeofenceMonitor {
    pub fn new(fence: Geofence) -> Self {
        Self {
            fence,
            outside: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `Some(is_outside)` when this reading crosses the boundary.
    pub fn observe(&self, vehicle_id: &str, latitude: f64, longitude: f64) -> Option<bool> {
        let is_outside = !self.fence.contains(latitude, longitude);
        let mut outside = self.outside.lock().unwrap_or_else(PoisonError::into_inner);
        let was_outside = outside.insert(vehicle_id.to_string(), is_outside).unwrap_or(false);
        (was_outside != is_outside).then_some(is_outside)
    }
}
