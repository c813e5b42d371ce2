// src/gps/data.rs
//! Position fixes produced by the receivers

use crate::geo::Coordinate;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Rough user-equivalent range error per unit of HDOP, in meters
const UERE_METERS: f64 = 5.0;

/// One position report from the location subsystem
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub coordinate: Coordinate,
    pub timestamp: DateTime<Utc>,
    pub accuracy_m: Option<f64>,
    pub speed_kmh: Option<f64>,
}

impl LocationFix {
    pub fn new(coordinate: Coordinate, timestamp: DateTime<Utc>) -> Self {
        Self {
            coordinate,
            timestamp,
            accuracy_m: None,
            speed_kmh: None,
        }
    }

    /// Age of the fix in seconds relative to `now`
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.timestamp).num_seconds()
    }
}

/// Collects the pieces of a fix that NMEA spreads over several sentences.
///
/// GGA carries the position and HDOP, RMC carries the date, validity and speed.
/// A fix is emitted once a position is present and then the position is
/// cleared, so every new position sentence yields at most one fix.
#[derive(Debug, Clone, Default)]
pub struct FixAccumulator {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub speed_kmh: Option<f64>,
    pub hdop: Option<f64>,
    pub fix_quality: Option<u8>,
    pub valid: bool,
}

impl FixAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_fix(&self) -> bool {
        self.valid && self.latitude.is_some() && self.longitude.is_some()
    }

    /// Best timestamp available: receiver date+time, else receiver time today, else `now`
    fn timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.date, self.time) {
            (Some(date), Some(time)) => date.and_time(time).and_utc(),
            (None, Some(time)) => now.date_naive().and_time(time).and_utc(),
            _ => now,
        }
    }

    /// Take the pending fix, if any
    pub fn take_fix(&mut self, now: DateTime<Utc>) -> Option<LocationFix> {
        if !self.has_fix() {
            return None;
        }

        let coordinate = Coordinate::new(self.latitude.take()?, self.longitude.take()?);
        if !coordinate.is_valid() {
            return None;
        }

        Some(LocationFix {
            coordinate,
            timestamp: self.timestamp(now),
            accuracy_m: self.hdop.map(|h| h * UERE_METERS),
            speed_kmh: self.speed_kmh,
        })
    }
}
