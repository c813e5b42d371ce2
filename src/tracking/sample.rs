// src/tracking/sample.rs
//! Retained location samples as they are sent to the backend

use crate::delivery::{Estimate, StopId};
use crate::geo::Coordinate;
use crate::gps::LocationFix;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Route between deliveries
    Journey,
    /// Route while a stop is in progress
    DeliveryJourney,
    StartDelivery,
    EndDelivery,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EventType::Journey => "journey",
            EventType::DeliveryJourney => "delivery_journey",
            EventType::StartDelivery => "start_delivery",
            EventType::EndDelivery => "end_delivery",
        };
        f.write_str(label)
    }
}

/// Immutable once created. Field names follow the backend's camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSample {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<StopId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_distance: Option<String>,
}

impl TrackingSample {
    pub fn from_fix(fix: &LocationFix, event_type: EventType, delivery_id: Option<StopId>) -> Self {
        Self {
            latitude: fix.coordinate.latitude,
            longitude: fix.coordinate.longitude,
            timestamp: fix.timestamp,
            event_type,
            delivery_id,
            estimated_duration: None,
            estimated_distance: None,
        }
    }

    pub fn with_estimate(mut self, estimate: Option<&Estimate>) -> Self {
        if let Some(estimate) = estimate {
            self.estimated_distance = Some(estimate.distance.clone());
            self.estimated_duration = Some(estimate.duration.clone());
        }
        self
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    /// Start/end markers, as opposed to route points
    pub fn is_lifecycle(&self) -> bool {
        matches!(self.event_type, EventType::StartDelivery | EventType::EndDelivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_wire_format() {
        let fix = LocationFix::new(
            Coordinate::new(19.4326, -99.1332),
            Utc.with_ymd_and_hms(2024, 5, 1, 14, 0, 0).unwrap(),
        );
        let sample = TrackingSample::from_fix(&fix, EventType::StartDelivery, Some(7)).with_estimate(Some(
            &Estimate { distance: "2.4 km".into(), duration: "9 min".into() },
        ));

        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["eventType"], "start_delivery");
        assert_eq!(json["deliveryId"], 7);
        assert_eq!(json["estimatedDistance"], "2.4 km");
        assert_eq!(json["timestamp"], "2024-05-01T14:00:00Z");
        assert!(sample.is_lifecycle());
    }

    #[test]
    fn test_journey_sample_omits_stop() {
        let fix = LocationFix::new(Coordinate::new(1.0, 2.0), Utc::now());
        let json = serde_json::to_value(TrackingSample::from_fix(&fix, EventType::Journey, None)).unwrap();
        assert!(json.get("deliveryId").is_none());
        assert!(json.get("estimatedDuration").is_none());
    }
}
