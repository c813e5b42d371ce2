// src/sync/mutation.rs
//! Queued changes awaiting remote acceptance

use crate::delivery::{Action, Estimate, IncidentReason, StopId};
use crate::geo::Coordinate;
use crate::tracking::TrackingSample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Mutation {
    StartDelivery {
        stop_id: StopId,
        at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimate: Option<Estimate>,
    },
    CompleteDelivery {
        stop_id: StopId,
        at: DateTime<Utc>,
    },
    ReportIncident {
        stop_id: StopId,
        reason: IncidentReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
        at: DateTime<Utc>,
        /// Where the driver was when reporting, if a fix was known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<Coordinate>,
    },
    LocationBatch {
        samples: Vec<TrackingSample>,
    },
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::StartDelivery { .. } => "start_delivery",
            Mutation::CompleteDelivery { .. } => "complete_delivery",
            Mutation::ReportIncident { .. } => "report_incident",
            Mutation::LocationBatch { .. } => "location_batch",
        }
    }

    pub fn stop_id(&self) -> Option<StopId> {
        match self {
            Mutation::StartDelivery { stop_id, .. }
            | Mutation::CompleteDelivery { stop_id, .. }
            | Mutation::ReportIncident { stop_id, .. } => Some(*stop_id),
            Mutation::LocationBatch { .. } => None,
        }
    }

    pub fn sample_count(&self) -> usize {
        match self {
            Mutation::LocationBatch { samples } => samples.len(),
            _ => 0,
        }
    }

    /// The local transition this mutation stands for. Location batches
    /// do not touch delivery state.
    pub fn action(&self) -> Option<Action> {
        match self {
            Mutation::StartDelivery { stop_id, at, estimate } => Some(Action::StartStop {
                id: *stop_id,
                at: *at,
                estimate: estimate.clone(),
            }),
            Mutation::CompleteDelivery { stop_id, at } => Some(Action::CompleteStop { id: *stop_id, at: *at }),
            Mutation::ReportIncident { stop_id, reason, notes, at, .. } => Some(Action::ReportIncident {
                id: *stop_id,
                reason: *reason,
                notes: notes.clone(),
                at: *at,
            }),
            Mutation::LocationBatch { .. } => None,
        }
    }
}

/// A mutation with its queue position. `seq` grows strictly and is never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub seq: u64,
    pub enqueued_at: DateTime<Utc>,
    pub mutation: Mutation,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_tagged_wire_format() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 15, 30, 0).unwrap();
        let pending = PendingMutation {
            seq: 4,
            enqueued_at: at,
            mutation: Mutation::ReportIncident {
                stop_id: 9,
                reason: IncidentReason::GoodsRejected,
                notes: None,
                at,
                position: None,
            },
        };

        let json = serde_json::to_value(&pending).unwrap();
        assert_eq!(json["seq"], 4);
        assert_eq!(json["mutation"]["type"], "report_incident");
        assert_eq!(json["mutation"]["payload"]["stop_id"], 9);
        assert_eq!(json["mutation"]["payload"]["reason"], "goods_rejected");
        assert!(json["mutation"]["payload"].get("notes").is_none());
        assert!(json["mutation"]["payload"].get("position").is_none());

        let back: PendingMutation = serde_json::from_value(json).unwrap();
        assert_eq!(back, pending);
    }

    #[test]
    fn test_incident_position_on_the_wire() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 15, 30, 0).unwrap();
        let incident = Mutation::ReportIncident {
            stop_id: 3,
            reason: IncidentReason::ClientAbsent,
            notes: Some("gate locked".into()),
            at,
            position: Some(Coordinate::new(19.4281, -99.1251)),
        };

        let json = serde_json::to_value(&incident).unwrap();
        assert_eq!(json["payload"]["position"]["latitude"], 19.4281);
        assert_eq!(json["payload"]["position"]["longitude"], -99.1251);
        assert_eq!(
            incident.action(),
            Some(Action::ReportIncident {
                id: 3,
                reason: IncidentReason::ClientAbsent,
                notes: Some("gate locked".into()),
                at,
            })
        );

        // Entries queued before positions were recorded still load
        let legacy = serde_json::json!({
            "type": "report_incident",
            "payload": { "stop_id": 3, "reason": "client_absent", "at": "2024-05-01T15:30:00Z" }
        });
        let Mutation::ReportIncident { position, .. } = serde_json::from_value(legacy).unwrap() else {
            panic!("expected report_incident");
        };
        assert!(position.is_none());
    }

    #[test]
    fn test_actions() {
        let at = Utc::now();
        let start = Mutation::StartDelivery { stop_id: 2, at, estimate: None };
        assert_eq!(start.action(), Some(Action::StartStop { id: 2, at, estimate: None }));
        assert_eq!(start.stop_id(), Some(2));

        let batch = Mutation::LocationBatch { samples: Vec::new() };
        assert!(batch.action().is_none());
        assert_eq!(batch.kind(), "location_batch");
    }
}
