// src/delivery/model.rs
//! Manifest and stop records

use crate::error::{Result, TrackerError};
use crate::geo::Coordinate;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

pub type StopId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl StopStatus {
    /// Completed and cancelled stops never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopStatus::Completed | StopStatus::Cancelled)
    }
}

impl fmt::Display for StopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StopStatus::Pending => "pending",
            StopStatus::InProgress => "in progress",
            StopStatus::Completed => "completed",
            StopStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentReason {
    ClientAbsent,
    WrongAddress,
    VehicleBreakdown,
    GoodsRejected,
    Other,
}

impl IncidentReason {
    pub const ALL: [IncidentReason; 5] = [
        IncidentReason::ClientAbsent,
        IncidentReason::WrongAddress,
        IncidentReason::VehicleBreakdown,
        IncidentReason::GoodsRejected,
        IncidentReason::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentReason::ClientAbsent => "client_absent",
            IncidentReason::WrongAddress => "wrong_address",
            IncidentReason::VehicleBreakdown => "vehicle_breakdown",
            IncidentReason::GoodsRejected => "goods_rejected",
            IncidentReason::Other => "other",
        }
    }
}

impl std::str::FromStr for IncidentReason {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        IncidentReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == normalized)
            .ok_or_else(|| TrackerError::Parse(format!("unknown incident reason: {}", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: u64,
    pub name: String,
    pub phone: String,
    /// "lat,lng"
    pub gps_location: String,
}

impl Client {
    pub fn coordinate(&self) -> Option<Coordinate> {
        self.gps_location.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: StopId,
    pub client: Client,
    pub status: StopStatus,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default)]
    pub estimated_distance: Option<String>,
    #[serde(default)]
    pub estimated_duration: Option<String>,
    #[serde(default)]
    pub cancellation_reason: Option<IncidentReason>,
    #[serde(default)]
    pub cancellation_notes: Option<String>,
    /// Always UTC; offsets in the source document are normalized on load
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl Stop {
    pub fn new(id: StopId, client: Client) -> Self {
        Self {
            id,
            client,
            status: StopStatus::Pending,
            priority: None,
            estimated_distance: None,
            estimated_duration: None,
            cancellation_reason: None,
            cancellation_notes: None,
            started_at: None,
        }
    }

    pub fn destination(&self) -> Option<Coordinate> {
        self.client.coordinate()
    }
}

/// The ordered stops assigned to one work session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub issued_on: NaiveDate,
    pub stops: Vec<Stop>,
    #[serde(default)]
    pub optimized_order: Option<Vec<StopId>>,
    #[serde(default)]
    pub encoded_path: Option<String>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| TrackerError::Other(format!("Failed to read manifest {}: {}", path.display(), e)))?;
        let manifest: Self = serde_json::from_str(&contents)?;
        Ok(manifest)
    }

    pub fn stop(&self, id: StopId) -> Option<&Stop> {
        self.stops.iter().find(|s| s.id == id)
    }

    pub fn stop_mut(&mut self, id: StopId) -> Option<&mut Stop> {
        self.stops.iter_mut().find(|s| s.id == id)
    }

    pub fn in_progress(&self) -> impl Iterator<Item = &Stop> {
        self.stops.iter().filter(|s| s.status == StopStatus::InProgress)
    }

    pub fn has_pending(&self) -> bool {
        self.stops.iter().any(|s| s.status == StopStatus::Pending)
    }

    /// Pending stops in the order the driver should visit them.
    ///
    /// Follows the optimized order when one is set; ids it does not know are
    /// skipped and pending stops it leaves out keep their manifest position
    /// after the optimized ones.
    pub fn visiting_order(&self) -> Vec<&Stop> {
        let pending = |s: &&Stop| s.status == StopStatus::Pending;

        let Some(order) = &self.optimized_order else {
            return self.stops.iter().filter(pending).collect();
        };

        let mut visit: Vec<&Stop> = order
            .iter()
            .filter_map(|id| self.stop(*id))
            .filter(pending)
            .collect();

        for stop in self.stops.iter().filter(pending) {
            if !order.contains(&stop.id) {
                visit.push(stop);
            }
        }
        visit
    }
}

/// Stops of a manifest partitioned by lifecycle status
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopBuckets {
    pub active: Option<Stop>,
    pub pending: Vec<Stop>,
    pub completed: Vec<Stop>,
    pub cancelled: Vec<Stop>,
}

impl StopBuckets {
    pub fn partition(manifest: &Manifest) -> Self {
        let mut buckets = Self::default();
        for stop in &manifest.stops {
            match stop.status {
                StopStatus::Pending => buckets.pending.push(stop.clone()),
                StopStatus::InProgress => buckets.active = Some(stop.clone()),
                StopStatus::Completed => buckets.completed.push(stop.clone()),
                StopStatus::Cancelled => buckets.cancelled.push(stop.clone()),
            }
        }
        buckets
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_visiting_order_defaults_to_manifest() {
        let manifest = manifest();
        let ids: Vec<_> = manifest.visiting_order().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_visiting_order_follows_optimization() {
        let mut manifest = manifest();
        manifest.optimized_order = Some(vec![3, 99, 1]);
        manifest.stops[0].status = StopStatus::Completed;

        let ids: Vec<_> = manifest.visiting_order().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[test]
    fn test_started_at_is_normalized_to_utc() {
        let json = r#"{"id":1,"client":{"id":1,"name":"A","phone":"1","gps_location":"1,1"},
                       "status":"in_progress","started_at":"2024-05-01T08:00:00-06:00"}"#;
        let stop: Stop = serde_json::from_str(json).unwrap();
        assert_eq!(stop.started_at.unwrap().to_rfc3339(), "2024-05-01T14:00:00+00:00");
    }

    #[test]
    fn test_incident_reason_parsing() {
        assert_eq!("client-absent".parse::<IncidentReason>().unwrap(), IncidentReason::ClientAbsent);
        assert_eq!("WRONG_ADDRESS".parse::<IncidentReason>().unwrap(), IncidentReason::WrongAddress);
        assert!("lost".parse::<IncidentReason>().is_err());
    }

    #[test]
    fn test_partition() {
        let mut manifest = manifest();
        manifest.stops[1].status = StopStatus::InProgress;
        manifest.stops[2].status = StopStatus::Cancelled;

        let buckets = StopBuckets::partition(&manifest);
        assert_eq!(buckets.active.map(|s| s.id), Some(2));
        assert_eq!(buckets.pending.len(), 1);
        assert_eq!(buckets.cancelled.len(), 1);
        assert!(buckets.completed.is_empty());
    }
}
