// src/geo.rs
//! Great-circle distance and bearing helpers
//!
//! All functions expect WGS84 latitude/longitude in degrees and treat the
//! Earth as a sphere of radius [`EARTH_RADIUS_M`].

use crate::error::{Result, TrackerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Mean Earth radius used by the Haversine formula, in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Radius around a destination inside which the driver counts as arrived
pub const ARRIVAL_RADIUS_M: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        distance_meters(self, other)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6},{:.6}", self.latitude, self.longitude)
    }
}

/// Parses the `"lat,lng"` form used for client locations.
impl FromStr for Coordinate {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        let (lat, lng) = s
            .split_once(',')
            .ok_or_else(|| TrackerError::Parse(format!("expected \"lat,lng\", got {:?}", s)))?;

        let latitude = lat
            .trim()
            .parse::<f64>()
            .map_err(|e| TrackerError::Parse(format!("bad latitude {:?}: {}", lat, e)))?;
        let longitude = lng
            .trim()
            .parse::<f64>()
            .map_err(|e| TrackerError::Parse(format!("bad longitude {:?}: {}", lng, e)))?;

        let coordinate = Coordinate::new(latitude, longitude);
        if !coordinate.is_valid() {
            return Err(TrackerError::Parse(format!("coordinate out of range: {}", s)));
        }
        Ok(coordinate)
    }
}

/// Great-circle distance between two points in meters (Haversine).
///
/// Total for valid input; identical points yield exactly `0.0`.
pub fn distance_meters(a: &Coordinate, b: &Coordinate) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push near-antipodal pairs just past 1
    let h = h.clamp(0.0, 1.0);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Initial bearing from `a` towards `b`, in degrees clockwise from north (0..360)
pub fn bearing_degrees(a: &Coordinate, b: &Coordinate) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();

    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// Summed length of a path in meters
pub fn path_length(points: &[Coordinate]) -> f64 {
    points.windows(2).map(|w| distance_meters(&w[0], &w[1])).sum()
}

pub fn arrived(current: &Coordinate, destination: &Coordinate) -> bool {
    distance_meters(current, destination) <= ARRIVAL_RADIUS_M
}

/// Human-readable distance: meters below one kilometer, otherwise kilometers
pub fn format_distance(meters: f64) -> String {
    if meters < 1000.0 {
        format!("{} m", meters.round() as i64)
    } else {
        format!("{:.1} km", meters / 1000.0)
    }
}
