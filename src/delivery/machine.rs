// src/delivery/machine.rs
//! Delivery lifecycle reducer
//!
//! `reduce` is a pure function of the current state and one action. Time
//! enters only through the action (`at`), so replaying the same actions
//! always yields the same state. Side effects the caller must perform are
//! returned as [`Effect`]s instead of being executed here.

use super::model::{IncidentReason, Manifest, Stop, StopBuckets, StopId, StopStatus};
use super::timer::TimerState;
use crate::error::{Result, TrackerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Distance/duration snapshot taken when a stop is started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Estimate {
    pub distance: String,
    pub duration: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Login {
        manifest: Manifest,
        at: DateTime<Utc>,
    },
    Logout,
    StartStop {
        id: StopId,
        at: DateTime<Utc>,
        estimate: Option<Estimate>,
    },
    CompleteStop {
        id: StopId,
        at: DateTime<Utc>,
    },
    ReportIncident {
        id: StopId,
        reason: IncidentReason,
        notes: Option<String>,
        at: DateTime<Utc>,
    },
    SetOptimizedOrder {
        order: Vec<StopId>,
        encoded_path: Option<String>,
    },
}

/// Work the state owner performs after committing a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StopChanged { id: StopId, status: StopStatus },
    TimerStarted(DateTime<Utc>),
    TimerStopped,
    TrackDelivery(StopId),
    TrackJourney,
    StopTracking,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryState {
    pub manifest: Option<Manifest>,
    pub timer: TimerState,
}

impl DeliveryState {
    pub fn is_logged_in(&self) -> bool {
        self.manifest.is_some()
    }

    pub fn active_stop(&self) -> Option<&Stop> {
        self.manifest.as_ref()?.in_progress().next()
    }

    pub fn buckets(&self) -> StopBuckets {
        self.manifest.as_ref().map(StopBuckets::partition).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: DeliveryState,
    pub effects: Vec<Effect>,
}

/// Apply one action. On error the caller's state is untouched.
pub fn reduce(state: &DeliveryState, action: Action) -> Result<Transition> {
    match action {
        Action::Login { manifest, at } => login(manifest, at),
        Action::Logout => Ok(logout(state)),
        Action::StartStop { id, at, estimate } => start_stop(state, id, at, estimate),
        Action::CompleteStop { id, .. } => complete_stop(state, id),
        Action::ReportIncident { id, reason, notes, .. } => report_incident(state, id, reason, notes),
        Action::SetOptimizedOrder { order, encoded_path } => set_optimized_order(state, order, encoded_path),
    }
}

/// Tracking mode once no stop is in progress
fn idle_tracking(manifest: &Manifest) -> Effect {
    if manifest.has_pending() {
        Effect::TrackJourney
    } else {
        Effect::StopTracking
    }
}

fn login(mut manifest: Manifest, at: DateTime<Utc>) -> Result<Transition> {
    let active: Vec<StopId> = manifest.in_progress().map(|s| s.id).collect();
    if active.len() > 1 {
        return Err(TrackerError::InvariantViolation(format!(
            "manifest {} has {} stops in progress ({:?})",
            manifest.id,
            active.len(),
            active
        )));
    }

    let mut effects = Vec::new();
    let timer = match active.first() {
        Some(&id) => {
            // Restored session: the persisted start time is the source of truth
            let stop = manifest
                .stop_mut(id)
                .ok_or(TrackerError::StopNotFound(id))?;
            let started = *stop.started_at.get_or_insert(at);
            effects.push(Effect::TimerStarted(started));
            effects.push(Effect::TrackDelivery(id));
            TimerState::started(started)
        }
        None => {
            effects.push(idle_tracking(&manifest));
            TimerState::stopped()
        }
    };

    Ok(Transition {
        state: DeliveryState {
            manifest: Some(manifest),
            timer,
        },
        effects,
    })
}

fn logout(state: &DeliveryState) -> Transition {
    let mut effects = Vec::new();
    if state.timer.is_active {
        effects.push(Effect::TimerStopped);
    }
    effects.push(Effect::StopTracking);

    Transition {
        state: DeliveryState::default(),
        effects,
    }
}

fn start_stop(
    state: &DeliveryState,
    id: StopId,
    at: DateTime<Utc>,
    estimate: Option<Estimate>,
) -> Result<Transition> {
    if let Some(active) = state.active_stop() {
        return Err(TrackerError::AlreadyActive { active: active.id });
    }

    let mut manifest = state.manifest.clone().ok_or(TrackerError::NoSession)?;
    let stop = manifest.stop_mut(id).ok_or(TrackerError::StopNotFound(id))?;

    if stop.status != StopStatus::Pending {
        return Err(TrackerError::InvariantViolation(format!(
            "stop {} is {} and cannot be started",
            id, stop.status
        )));
    }

    stop.status = StopStatus::InProgress;
    stop.started_at = Some(at);
    if let Some(estimate) = estimate {
        // Estimates are captured once, at the first start
        stop.estimated_distance.get_or_insert(estimate.distance);
        stop.estimated_duration.get_or_insert(estimate.duration);
    }

    Ok(Transition {
        state: DeliveryState {
            manifest: Some(manifest),
            timer: TimerState::started(at),
        },
        effects: vec![
            Effect::StopChanged { id, status: StopStatus::InProgress },
            Effect::TimerStarted(at),
            Effect::TrackDelivery(id),
        ],
    })
}

fn complete_stop(state: &DeliveryState, id: StopId) -> Result<Transition> {
    let mut manifest = state.manifest.clone().ok_or(TrackerError::NoSession)?;

    match state.active_stop() {
        Some(active) if active.id == id => {}
        Some(active) => {
            return Err(TrackerError::InvariantViolation(format!(
                "cannot complete stop {}: stop {} is the one in progress",
                id, active.id
            )))
        }
        None => {
            return Err(TrackerError::InvariantViolation(format!(
                "cannot complete stop {}: no stop is in progress",
                id
            )))
        }
    }

    let stop = manifest.stop_mut(id).ok_or(TrackerError::StopNotFound(id))?;
    stop.status = StopStatus::Completed;

    let effects = vec![
        Effect::StopChanged { id, status: StopStatus::Completed },
        Effect::TimerStopped,
        idle_tracking(&manifest),
    ];

    Ok(Transition {
        state: DeliveryState {
            manifest: Some(manifest),
            timer: TimerState::stopped(),
        },
        effects,
    })
}

fn report_incident(
    state: &DeliveryState,
    id: StopId,
    reason: IncidentReason,
    notes: Option<String>,
) -> Result<Transition> {
    let mut manifest = state.manifest.clone().ok_or(TrackerError::NoSession)?;
    let stop = manifest.stop_mut(id).ok_or(TrackerError::StopNotFound(id))?;

    if stop.status.is_terminal() {
        return Err(TrackerError::InvariantViolation(format!(
            "stop {} is already {}",
            id, stop.status
        )));
    }

    let was_active = stop.status == StopStatus::InProgress;
    stop.status = StopStatus::Cancelled;
    stop.cancellation_reason = Some(reason);
    stop.cancellation_notes = notes.filter(|n| !n.trim().is_empty());

    let mut effects = vec![Effect::StopChanged { id, status: StopStatus::Cancelled }];
    let timer = if was_active {
        effects.push(Effect::TimerStopped);
        effects.push(idle_tracking(&manifest));
        TimerState::stopped()
    } else {
        state.timer
    };

    Ok(Transition {
        state: DeliveryState {
            manifest: Some(manifest),
            timer,
        },
        effects,
    })
}

fn set_optimized_order(
    state: &DeliveryState,
    order: Vec<StopId>,
    encoded_path: Option<String>,
) -> Result<Transition> {
    let mut manifest = state.manifest.clone().ok_or(TrackerError::NoSession)?;

    if let Some(unknown) = order.iter().find(|id| manifest.stop(**id).is_none()) {
        return Err(TrackerError::StopNotFound(*unknown));
    }

    manifest.optimized_order = Some(order);
    manifest.encoded_path = encoded_path;

    Ok(Transition {
        state: DeliveryState {
            manifest: Some(manifest),
            timer: state.timer,
        },
        effects: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::super::model::fixtures;
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn logged_in() -> DeliveryState {
        reduce(&DeliveryState::default(), Action::Login { manifest: fixtures::manifest(), at: t0() })
            .unwrap()
            .state
    }

    fn apply(state: &DeliveryState, action: Action) -> DeliveryState {
        reduce(state, action).unwrap().state
    }

    #[test]
    fn test_login_fresh_manifest_tracks_journey() {
        let transition =
            reduce(&DeliveryState::default(), Action::Login { manifest: fixtures::manifest(), at: t0() }).unwrap();

        assert!(transition.state.is_logged_in());
        assert!(!transition.state.timer.is_active);
        assert_eq!(transition.effects, vec![Effect::TrackJourney]);
        assert_eq!(transition.state.buckets().pending.len(), 3);
    }

    #[test]
    fn test_login_restores_active_stop_start_time() {
        let mut manifest = fixtures::manifest();
        let started = t0() - Duration::minutes(42);
        manifest.stops[1].status = StopStatus::InProgress;
        manifest.stops[1].started_at = Some(started);

        let transition = reduce(&DeliveryState::default(), Action::Login { manifest, at: t0() }).unwrap();

        assert_eq!(transition.state.timer, TimerState::started(started));
        assert_eq!(transition.state.timer.elapsed_seconds(t0()), 42 * 60);
        assert!(transition.effects.contains(&Effect::TrackDelivery(2)));
    }

    #[test]
    fn test_login_rejects_two_active_stops() {
        let mut manifest = fixtures::manifest();
        manifest.stops[0].status = StopStatus::InProgress;
        manifest.stops[1].status = StopStatus::InProgress;

        let err = reduce(&DeliveryState::default(), Action::Login { manifest, at: t0() }).unwrap_err();
        assert!(matches!(err, TrackerError::InvariantViolation(_)));
    }

    #[test]
    fn test_start_stop() {
        let state = logged_in();
        let transition = reduce(
            &state,
            Action::StartStop {
                id: 2,
                at: t0(),
                estimate: Some(Estimate { distance: "1.2 km".into(), duration: "6 min".into() }),
            },
        )
        .unwrap();

        let active = transition.state.active_stop().unwrap();
        assert_eq!(active.id, 2);
        assert_eq!(active.started_at, Some(t0()));
        assert_eq!(active.estimated_distance.as_deref(), Some("1.2 km"));
        assert!(transition.state.timer.is_active);
        assert!(transition.effects.contains(&Effect::TrackDelivery(2)));
    }

    #[test]
    fn test_second_start_signals_already_active() {
        let state = apply(&logged_in(), Action::StartStop { id: 2, at: t0(), estimate: None });

        let err = reduce(&state, Action::StartStop { id: 1, at: t0(), estimate: None }).unwrap_err();
        assert!(matches!(err, TrackerError::AlreadyActive { active: 2 }));
    }

    #[test]
    fn test_complete_requires_active_stop() {
        let state = apply(&logged_in(), Action::StartStop { id: 2, at: t0(), estimate: None });

        let err = reduce(&state, Action::CompleteStop { id: 1, at: t0() }).unwrap_err();
        assert!(matches!(err, TrackerError::InvariantViolation(_)));

        let err = reduce(&logged_in(), Action::CompleteStop { id: 1, at: t0() }).unwrap_err();
        assert!(matches!(err, TrackerError::InvariantViolation(_)));
    }

    #[test]
    fn test_complete_returns_to_journey_when_stops_remain() {
        let state = apply(&logged_in(), Action::StartStop { id: 2, at: t0(), estimate: None });
        let transition = reduce(&state, Action::CompleteStop { id: 2, at: t0() }).unwrap();

        assert!(transition.state.active_stop().is_none());
        assert!(!transition.state.timer.is_active);
        assert_eq!(transition.effects.last(), Some(&Effect::TrackJourney));

        let buckets = transition.state.buckets();
        assert_eq!(buckets.pending.len(), 2);
        assert_eq!(buckets.completed.len(), 1);
    }

    #[test]
    fn test_complete_last_stop_stops_tracking() {
        let state = apply(&logged_in(), Action::ReportIncident {
            id: 1,
            reason: IncidentReason::WrongAddress,
            notes: None,
            at: t0(),
        });
        let state = apply(&state, Action::ReportIncident {
            id: 3,
            reason: IncidentReason::WrongAddress,
            notes: None,
            at: t0(),
        });
        let state = apply(&state, Action::StartStop { id: 2, at: t0(), estimate: None });
        let transition = reduce(&state, Action::CompleteStop { id: 2, at: t0() }).unwrap();
        assert_eq!(transition.effects.last(), Some(&Effect::StopTracking));
    }

    #[test]
    fn test_incident_on_active_stop() {
        let state = apply(&logged_in(), Action::StartStop { id: 2, at: t0(), estimate: None });
        let transition = reduce(
            &state,
            Action::ReportIncident {
                id: 2,
                reason: IncidentReason::ClientAbsent,
                notes: Some("nobody home".into()),
                at: t0(),
            },
        )
        .unwrap();

        assert!(transition.state.active_stop().is_none());
        assert!(!transition.state.timer.is_active);
        assert!(transition.effects.contains(&Effect::TimerStopped));

        let buckets = transition.state.buckets();
        assert_eq!(buckets.cancelled.len(), 1);
        assert_eq!(buckets.cancelled[0].cancellation_reason, Some(IncidentReason::ClientAbsent));
        assert_eq!(buckets.cancelled[0].cancellation_notes.as_deref(), Some("nobody home"));
    }

    #[test]
    fn test_incident_on_pending_keeps_active_timer() {
        let state = apply(&logged_in(), Action::StartStop { id: 2, at: t0(), estimate: None });
        let transition = reduce(
            &state,
            Action::ReportIncident { id: 3, reason: IncidentReason::WrongAddress, notes: None, at: t0() },
        )
        .unwrap();

        assert_eq!(transition.state.active_stop().map(|s| s.id), Some(2));
        assert!(transition.state.timer.is_active);
        assert_eq!(transition.effects.len(), 1);
    }

    #[test]
    fn test_terminal_stops_do_not_move() {
        let state = apply(&logged_in(), Action::StartStop { id: 1, at: t0(), estimate: None });
        let state = apply(&state, Action::CompleteStop { id: 1, at: t0() });

        assert!(reduce(&state, Action::StartStop { id: 1, at: t0(), estimate: None }).is_err());
        assert!(reduce(
            &state,
            Action::ReportIncident { id: 1, reason: IncidentReason::Other, notes: None, at: t0() }
        )
        .is_err());
    }

    #[test]
    fn test_actions_require_session() {
        let err = reduce(&DeliveryState::default(), Action::StartStop { id: 1, at: t0(), estimate: None })
            .unwrap_err();
        assert!(matches!(err, TrackerError::NoSession));
    }

    #[test]
    fn test_set_optimized_order() {
        let state = apply(&logged_in(), Action::SetOptimizedOrder { order: vec![3, 1, 2], encoded_path: Some("abc".into()) });
        let manifest = state.manifest.unwrap();
        assert_eq!(manifest.optimized_order, Some(vec![3, 1, 2]));
        assert_eq!(manifest.encoded_path.as_deref(), Some("abc"));

        let err = reduce(&logged_in(), Action::SetOptimizedOrder { order: vec![42], encoded_path: None }).unwrap_err();
        assert!(matches!(err, TrackerError::StopNotFound(42)));
    }

    #[test]
    fn test_logout_clears_everything() {
        let state = apply(&logged_in(), Action::StartStop { id: 2, at: t0(), estimate: None });
        let transition = reduce(&state, Action::Logout).unwrap();
        assert_eq!(transition.state, DeliveryState::default());
        assert_eq!(transition.effects, vec![Effect::TimerStopped, Effect::StopTracking]);
    }

    fn arb_action() -> impl Strategy<Value = Action> {
        let reasons = prop::sample::select(IncidentReason::ALL.to_vec());
        prop_oneof![
            (1u64..=4).prop_map(|id| Action::StartStop { id, at: t0(), estimate: None }),
            (1u64..=4).prop_map(|id| Action::CompleteStop { id, at: t0() }),
            ((1u64..=4), reasons).prop_map(|(id, reason)| Action::ReportIncident {
                id,
                reason,
                notes: None,
                at: t0(),
            }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property: whatever the drivers taps, at most one stop is in progress
        /// and terminal stops never change status.
        #[test]
        fn prop_single_active_stop(actions in prop::collection::vec(arb_action(), 0..40)) {
            let mut state = logged_in();

            for action in actions {
                let before = state.clone();
                if let Ok(transition) = reduce(&state, action) {
                    state = transition.state;
                }

                let manifest = state.manifest.as_ref().unwrap();
                prop_assert!(manifest.in_progress().count() <= 1);
                prop_assert_eq!(state.timer.is_active, state.active_stop().is_some());

                for old in &before.manifest.as_ref().unwrap().stops {
                    if old.status.is_terminal() {
                        prop_assert_eq!(manifest.stop(old.id).unwrap().status, old.status);
                    }
                }
            }
        }

        /// Property: replaying the same actions yields the same state.
        #[test]
        fn prop_replay_is_deterministic(actions in prop::collection::vec(arb_action(), 0..30)) {
            let run = |actions: &[Action]| {
                let mut state = logged_in();
                for action in actions {
                    if let Ok(transition) = reduce(&state, action.clone()) {
                        state = transition.state;
                    }
                }
                state
            };
            prop_assert_eq!(run(&actions), run(&actions));
        }
    }
}
