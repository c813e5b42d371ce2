// tests/engine_scenarios.rs
//! End-to-end driver scenarios against a running engine

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use delivery_tracker::delivery::{Client, Stop};
use delivery_tracker::route::ProximityOptimizer;
use delivery_tracker::storage::{KeyValueStore, MemoryStore, ACTIVE_STOP_KEY, MANIFEST_KEY};
use delivery_tracker::sync::{BatchPolicy, Mutation, PendingMutation, RemoteEndpoint};
use delivery_tracker::tracking::{EventType, LocationPlatform, ManualPlatform, PermissionStatus};
use delivery_tracker::{
    Coordinate, Engine, EngineConfig, EngineEvent, EngineHandle, IncidentReason, LocationFix, Manifest,
    Result, TrackerError, TrackingMode,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify, Semaphore};

/// Backend double: records accepted batches, can refuse them, and can hold
/// requests until the test releases them.
#[derive(Default)]
struct ScriptedRemote {
    accepted: Mutex<Vec<Vec<PendingMutation>>>,
    fail: AtomicBool,
    gate: Option<Semaphore>,
    started: Notify,
}

impl ScriptedRemote {
    fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1000);
        }
    }

    fn batch_seqs(&self) -> Vec<Vec<u64>> {
        self.accepted
            .lock()
            .unwrap()
            .iter()
            .map(|batch| batch.iter().map(|e| e.seq).collect())
            .collect()
    }

    fn all_entries(&self) -> Vec<PendingMutation> {
        self.accepted.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl RemoteEndpoint for ScriptedRemote {
    async fn send_batch(&self, batch: Vec<PendingMutation>) -> Result<()> {
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| TrackerError::Other("gate closed".into()))?
                .forget();
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TrackerError::RemoteRejected {
                status: 503,
                detail: "maintenance".into(),
            });
        }
        self.accepted.lock().unwrap().push(batch);
        Ok(())
    }
}

fn manifest() -> Manifest {
    let client = |id: u64, location: &str| Client {
        id,
        name: format!("Client {}", id),
        phone: "5550000000".into(),
        gps_location: location.into(),
    };
    Manifest {
        id: "FEC-042".into(),
        issued_on: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        stops: vec![
            Stop::new(1, client(11, "19.4326,-99.1332")),
            Stop::new(2, client(12, "19.4360,-99.1400")),
            Stop::new(3, client(13, "19.4280,-99.1250")),
        ],
        optimized_order: None,
        encoded_path: None,
    }
}

struct Harness {
    handle: EngineHandle,
    remote: Arc<ScriptedRemote>,
    store: MemoryStore,
    platform: ManualPlatform,
}

async fn start_with(config: EngineConfig, store: MemoryStore, platform: ManualPlatform, remote: ScriptedRemote) -> Harness {
    let remote = Arc::new(remote);
    let (handle, _task) = Engine::start(
        config,
        Arc::new(store.clone()),
        remote.clone(),
        Box::new(platform.clone()),
        Arc::new(ProximityOptimizer::default()),
    )
    .await
    .unwrap();
    Harness { handle, remote, store, platform }
}

async fn start() -> Harness {
    start_with(
        EngineConfig::default(),
        MemoryStore::new(),
        ManualPlatform::granted(),
        ScriptedRemote::default(),
    )
    .await
}

async fn next_matching(events: &mut broadcast::Receiver<EngineEvent>, wanted: impl Fn(&EngineEvent) -> bool) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("engine stopped"),
            }
        }
    })
    .await
    .expect("event did not arrive")
}

#[tokio::test]
async fn test_three_stop_shift() {
    let h = start().await;
    let snapshot = h.handle.login(manifest()).await.unwrap();
    assert_eq!(snapshot.mode, TrackingMode::Journey);
    assert_eq!(snapshot.pending, vec![1, 2, 3]);

    h.handle.start_stop(2).await.unwrap();
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.active, Some(2));
    assert_eq!(snapshot.mode, TrackingMode::Delivery);
    assert!(snapshot.timer.is_some());

    // A second stop cannot start while #2 is open
    let err = h.handle.start_stop(1).await.unwrap_err();
    assert!(matches!(err, TrackerError::AlreadyActive { active: 2 }));

    h.handle.complete_stop(2).await.unwrap();
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.active, None);
    assert_eq!(snapshot.mode, TrackingMode::Journey);
    assert_eq!(snapshot.pending, vec![1, 3]);
    assert_eq!(snapshot.completed, vec![2]);
    assert!(snapshot.timer.is_none());
    assert_eq!(snapshot.queued, 2);
}

#[tokio::test]
async fn test_incident_on_active_stop() {
    let h = start().await;
    h.handle.login(manifest()).await.unwrap();
    h.handle.start_stop(1).await.unwrap();

    h.handle
        .report_incident(1, IncidentReason::ClientAbsent, Some("nobody home".into()))
        .await
        .unwrap();

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.active, None);
    assert_eq!(snapshot.cancelled, vec![1]);
    assert_eq!(snapshot.mode, TrackingMode::Journey);
    assert!(snapshot.timer.is_none());

    // Terminal stops stay terminal
    assert!(h.handle.start_stop(1).await.is_err());
    assert!(h.handle.report_incident(1, IncidentReason::Other, None).await.is_err());
}

#[tokio::test]
async fn test_offline_changes_reach_backend_in_order() {
    let h = start().await;
    h.handle.login(manifest()).await.unwrap();

    h.handle.start_stop(1).await.unwrap();
    h.handle.complete_stop(1).await.unwrap();
    h.handle.start_stop(3).await.unwrap();
    h.handle
        .report_incident(3, IncidentReason::WrongAddress, None)
        .await
        .unwrap();
    assert!(h.remote.batch_seqs().is_empty());
    assert_eq!(h.handle.snapshot().await.unwrap().queued, 4);

    h.handle.set_online(true).await.unwrap();
    h.handle.checkpoint().await.unwrap();

    let kinds: Vec<&str> = h.remote.all_entries().iter().map(|e| e.mutation.kind()).collect();
    assert_eq!(kinds, vec!["start_delivery", "complete_delivery", "start_delivery", "report_incident"]);
    let seqs: Vec<u64> = h.remote.all_entries().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
    assert_eq!(h.handle.snapshot().await.unwrap().queued, 0);
}

#[tokio::test]
async fn test_enqueue_during_flush_survives_confirmation() {
    let config = EngineConfig {
        batch: BatchPolicy { max_entries: 2, ..BatchPolicy::default() },
        ..EngineConfig::default()
    };
    let h = start_with(config, MemoryStore::new(), ManualPlatform::granted(), ScriptedRemote::gated()).await;
    let mut events = h.handle.subscribe();
    h.handle.login(manifest()).await.unwrap();

    h.handle.start_stop(1).await.unwrap();
    h.handle.complete_stop(1).await.unwrap();
    h.handle.start_stop(2).await.unwrap();
    h.handle.complete_stop(2).await.unwrap();

    // First two entries go out and are held at the backend
    h.handle.set_online(true).await.unwrap();
    h.remote.started.notified().await;

    h.handle.start_stop(3).await.unwrap();
    h.handle.complete_stop(3).await.unwrap();
    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(snapshot.flushing);
    assert_eq!(snapshot.queued, 6);

    h.remote.release();
    let first = next_matching(&mut events, |e| matches!(e, EngineEvent::SyncSucceeded { .. })).await;
    assert_eq!(first, EngineEvent::SyncSucceeded { sent: 2, pending: 4 });

    h.handle.checkpoint().await.unwrap();
    assert_eq!(h.remote.batch_seqs(), vec![vec![1, 2], vec![3, 4], vec![5, 6]]);
    assert_eq!(h.handle.snapshot().await.unwrap().queued, 0);
}

#[tokio::test]
async fn test_rejected_batch_stays_queued() {
    let h = start().await;
    let mut events = h.handle.subscribe();
    h.handle.login(manifest()).await.unwrap();
    h.handle.start_stop(1).await.unwrap();

    h.remote.fail.store(true, Ordering::SeqCst);
    h.handle.set_online(true).await.unwrap();
    let failed = next_matching(&mut events, |e| matches!(e, EngineEvent::SyncFailed { .. })).await;
    assert!(matches!(failed, EngineEvent::SyncFailed { retryable: true, pending: 1, .. }));

    let err = h.handle.checkpoint().await.unwrap_err();
    assert!(matches!(err, TrackerError::RemoteRejected { status: 503, .. }));
    assert_eq!(h.handle.snapshot().await.unwrap().queued, 1);

    h.remote.fail.store(false, Ordering::SeqCst);
    h.handle.checkpoint().await.unwrap();
    assert_eq!(h.remote.batch_seqs(), vec![vec![1]]);
}

#[tokio::test]
async fn test_restart_resumes_session() {
    let store = MemoryStore::new();
    let platform = ManualPlatform::granted();

    let h = start_with(EngineConfig::default(), store.clone(), platform.clone(), ScriptedRemote::default()).await;
    h.handle.login(manifest()).await.unwrap();
    h.handle.start_stop(1).await.unwrap();
    h.handle.complete_stop(1).await.unwrap();
    h.handle.start_stop(3).await.unwrap();
    h.handle.shutdown().await.unwrap();

    let h = start_with(EngineConfig::default(), store, platform, ScriptedRemote::default()).await;
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.active, Some(3));
    assert_eq!(snapshot.completed, vec![1]);
    assert_eq!(snapshot.mode, TrackingMode::Delivery);
    assert_eq!(snapshot.queued, 3);
    assert!(snapshot.timer.is_some());

    h.handle.set_online(true).await.unwrap();
    h.handle.checkpoint().await.unwrap();
    let seqs: Vec<u64> = h.remote.all_entries().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_logout_keeps_queue_and_clears_session() {
    let h = start().await;
    let mut events = h.handle.subscribe();
    h.handle.login(manifest()).await.unwrap();
    h.handle.start_stop(2).await.unwrap();

    // Offline: the checkpoint before logout cannot succeed
    h.handle.logout().await.unwrap();
    next_matching(&mut events, |e| *e == EngineEvent::SessionEnded).await;

    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(snapshot.manifest.is_none());
    assert_eq!(snapshot.mode, TrackingMode::Off);
    assert_eq!(snapshot.queued, 1);
    assert!(h.store.get(MANIFEST_KEY).unwrap().is_none());
    assert!(h.store.get(ACTIVE_STOP_KEY).unwrap().is_none());

    assert!(matches!(h.handle.start_stop(1).await, Err(TrackerError::NoSession)));
}

#[tokio::test]
async fn test_permission_denied_does_not_block_deliveries() {
    let h = start_with(
        EngineConfig::default(),
        MemoryStore::new(),
        ManualPlatform::new(PermissionStatus::Denied),
        ScriptedRemote::default(),
    )
    .await;
    let mut events = h.handle.subscribe();

    let snapshot = h.handle.login(manifest()).await.unwrap();
    assert_eq!(snapshot.mode, TrackingMode::Off);
    next_matching(&mut events, |e| matches!(e, EngineEvent::TrackingUnavailable { .. })).await;

    h.handle.start_stop(1).await.unwrap();
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.active, Some(1));
    assert_eq!(snapshot.mode, TrackingMode::Off);
    assert_eq!(snapshot.queued, 1);
    assert!(h.platform.start_calls().is_empty());
}

#[tokio::test]
async fn test_route_samples_and_lifecycle_markers() {
    let h = start().await;
    h.handle.login(manifest()).await.unwrap();

    let fix = LocationFix::new(Coordinate::new(19.4300, -99.1300), Utc::now());
    assert!(h.platform.inject(fix));
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.handle.snapshot().await.unwrap().queued_samples == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sample was not queued");

    h.handle.start_stop(1).await.unwrap();
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.queued_samples, 2);

    h.handle.set_online(true).await.unwrap();
    h.handle.checkpoint().await.unwrap();

    let entries = h.remote.all_entries();
    let Mutation::StartDelivery { estimate, .. } = &entries[1].mutation else {
        panic!("expected start_delivery, got {:?}", entries[1].mutation);
    };
    assert!(estimate.is_some());

    let Mutation::LocationBatch { samples } = &entries[2].mutation else {
        panic!("expected location batch, got {:?}", entries[2].mutation);
    };
    assert_eq!(samples[0].event_type, EventType::StartDelivery);
    assert_eq!(samples[0].delivery_id, Some(1));
    assert!(samples[0].estimated_distance.is_some());
}

#[tokio::test]
async fn test_optimize_route_from_last_fix() {
    let h = start().await;
    h.handle.login(manifest()).await.unwrap();
    assert!(h.handle.optimize_route().await.unwrap().is_none());

    // Right next to stop 3
    assert!(h.platform.inject(LocationFix::new(Coordinate::new(19.4270, -99.1240), Utc::now())));
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.handle.snapshot().await.unwrap().last_fix.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("fix was not seen");

    let plan = h.handle.optimize_route().await.unwrap().unwrap();
    assert_eq!(plan.order, vec![3, 1, 2]);
    assert_eq!(h.handle.snapshot().await.unwrap().pending, vec![3, 1, 2]);
}

#[tokio::test]
async fn test_connection_lost_mid_drain_releases_waiters() {
    let config = EngineConfig {
        batch: BatchPolicy { max_entries: 2, ..BatchPolicy::default() },
        ..EngineConfig::default()
    };
    let h = start_with(config, MemoryStore::new(), ManualPlatform::granted(), ScriptedRemote::gated()).await;
    h.handle.login(manifest()).await.unwrap();

    h.handle.start_stop(1).await.unwrap();
    h.handle.complete_stop(1).await.unwrap();
    h.handle.start_stop(2).await.unwrap();
    h.handle.complete_stop(2).await.unwrap();

    h.handle.set_online(true).await.unwrap();
    h.remote.started.notified().await;

    // Waiting for all four entries while only the first two are out
    let waiter = h.handle.clone();
    let checkpoint = tokio::spawn(async move { waiter.checkpoint().await });
    tokio::task::yield_now().await;
    h.handle.snapshot().await.unwrap();

    h.handle.set_online(false).await.unwrap();
    h.remote.release();

    let result = tokio::time::timeout(Duration::from_secs(5), checkpoint)
        .await
        .expect("checkpoint never resolved")
        .unwrap();
    assert!(matches!(result, Err(TrackerError::NetworkUnavailable)));

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.handle.snapshot().await.unwrap().flushing {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("flush never settled");
    assert_eq!(h.handle.snapshot().await.unwrap().queued, 2);
    assert_eq!(h.remote.batch_seqs(), vec![vec![1, 2]]);

    // Logging out offline must not wait on the unsent half
    tokio::time::timeout(Duration::from_secs(5), h.handle.logout())
        .await
        .expect("logout hung")
        .unwrap();
    assert_eq!(h.handle.snapshot().await.unwrap().queued, 2);
}

#[tokio::test]
async fn test_receiver_loss_turns_tracking_off() {
    let h = start().await;
    let mut events = h.handle.subscribe();
    h.handle.login(manifest()).await.unwrap();
    assert!(h.platform.is_updating());

    h.platform.end_updates();
    let event = next_matching(&mut events, |e| matches!(e, EngineEvent::TrackingUnavailable { .. })).await;
    assert_eq!(
        event,
        EngineEvent::TrackingUnavailable { reason: "location updates stopped".into() }
    );
    next_matching(&mut events, |e| *e == EngineEvent::TrackingModeChanged(TrackingMode::Off)).await;
    assert_eq!(h.handle.snapshot().await.unwrap().mode, TrackingMode::Off);

    // Deliveries carry on and bring tracking back
    h.handle.start_stop(1).await.unwrap();
    assert_eq!(h.handle.snapshot().await.unwrap().mode, TrackingMode::Delivery);
}

#[tokio::test]
async fn test_incident_records_last_position() {
    let h = start().await;
    h.handle.login(manifest()).await.unwrap();
    h.handle.start_stop(1).await.unwrap();
    h.handle.report_incident(1, IncidentReason::ClientAbsent, None).await.unwrap();

    let here = Coordinate::new(19.4361, -99.1401);
    assert!(h.platform.inject(LocationFix::new(here, Utc::now())));
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.handle.snapshot().await.unwrap().last_fix.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("fix was not seen");

    h.handle.start_stop(2).await.unwrap();
    h.handle
        .report_incident(2, IncidentReason::GoodsRejected, Some("damaged box".into()))
        .await
        .unwrap();

    h.handle.set_online(true).await.unwrap();
    h.handle.checkpoint().await.unwrap();

    let positions: Vec<(u64, Option<Coordinate>)> = h
        .remote
        .all_entries()
        .into_iter()
        .filter_map(|e| match e.mutation {
            Mutation::ReportIncident { stop_id, position, .. } => Some((stop_id, position)),
            _ => None,
        })
        .collect();
    assert_eq!(positions, vec![(1, None), (2, Some(here))]);
}
