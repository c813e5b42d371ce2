// src/tracking/platform.rs
//! Location subsystem seam
//!
//! A platform delivers fixes into a channel while updates are started, under
//! an accuracy/distance/interval policy, and answers permission queries.

use crate::error::{Result, TrackerError};
use crate::gps::{GpsSource, LocationFix};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accuracy {
    Low,
    Balanced,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationPolicy {
    pub accuracy: Accuracy,
    pub min_distance_m: f64,
    pub min_interval_secs: u64,
}

impl LocationPolicy {
    /// Between deliveries: cheap, coarse route capture
    pub fn journey() -> Self {
        Self {
            accuracy: Accuracy::Balanced,
            min_distance_m: 50.0,
            min_interval_secs: 3 * 60,
        }
    }

    /// While a stop is in progress
    pub fn delivery() -> Self {
        Self {
            accuracy: Accuracy::High,
            min_distance_m: 20.0,
            min_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    Denied,
    NotDetermined,
}

#[async_trait]
pub trait LocationPlatform: Send {
    async fn permission_status(&mut self) -> PermissionStatus;

    /// Ask for access. Platforms without a prompt just re-check.
    async fn request_permission(&mut self) -> PermissionStatus {
        self.permission_status().await
    }

    /// Begin delivering fixes into `sink`, replacing any running subscription.
    async fn start_updates(&mut self, policy: LocationPolicy, sink: mpsc::Sender<LocationFix>) -> Result<()>;

    async fn stop_updates(&mut self);

    fn is_updating(&self) -> bool;
}

/// Drops fixes that moved less than the policy distance and arrived sooner
/// than the policy interval after the last forwarded fix.
#[derive(Debug, Clone)]
pub struct FixThrottle {
    policy: LocationPolicy,
    last: Option<LocationFix>,
}

impl FixThrottle {
    pub fn new(policy: LocationPolicy) -> Self {
        Self { policy, last: None }
    }

    pub fn admit(&mut self, fix: &LocationFix) -> bool {
        if let Some(last) = &self.last {
            let moved = last.coordinate.distance_to(&fix.coordinate) >= self.policy.min_distance_m;
            let waited = fix.timestamp.signed_duration_since(last.timestamp).num_seconds()
                >= self.policy.min_interval_secs as i64;
            if !moved && !waited {
                return false;
            }
        }
        self.last = Some(*fix);
        true
    }
}

/// Receiver-backed platform over gpsd or a serial NMEA device
pub struct GpsPlatform {
    source: GpsSource,
    task: Option<JoinHandle<()>>,
}

impl GpsPlatform {
    pub fn new(source: GpsSource) -> Self {
        Self { source, task: None }
    }

    pub fn source(&self) -> &GpsSource {
        &self.source
    }
}

#[async_trait]
impl LocationPlatform for GpsPlatform {
    async fn permission_status(&mut self) -> PermissionStatus {
        match self.source.check_access() {
            Ok(()) => PermissionStatus::Granted,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => PermissionStatus::Denied,
            Err(e) => {
                debug!(source = %self.source.describe(), error = %e, "receiver not accessible yet");
                PermissionStatus::NotDetermined
            }
        }
    }

    async fn start_updates(&mut self, policy: LocationPolicy, sink: mpsc::Sender<LocationFix>) -> Result<()> {
        self.stop_updates().await;

        let source = self.source.clone();
        info!(source = %source.describe(), accuracy = ?policy.accuracy, "starting location updates");

        self.task = Some(tokio::spawn(async move {
            let (raw_tx, mut raw_rx) = mpsc::channel(32);
            let mut throttle = FixThrottle::new(policy);

            let forward = async {
                while let Some(fix) = raw_rx.recv().await {
                    if throttle.admit(&fix) && sink.send(fix).await.is_err() {
                        break;
                    }
                }
            };

            let (read, ()) = tokio::join!(source.stream_fixes(raw_tx), forward);
            if let Err(e) = read {
                warn!(error = %e, "location receiver stopped");
            }
        }));

        Ok(())
    }

    async fn stop_updates(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            info!("location updates stopped");
        }
    }

    fn is_updating(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

#[derive(Debug)]
struct ManualState {
    permission: PermissionStatus,
    /// What a permission request resolves `NotDetermined` to
    grant_on_request: bool,
    sink: Option<mpsc::Sender<LocationFix>>,
    active: Option<LocationPolicy>,
    starts: Vec<LocationPolicy>,
    stops: usize,
}

/// Hand-driven platform for tests and replays. Clones share state, so a
/// test keeps one clone to inject fixes and inspect calls.
#[derive(Debug, Clone)]
pub struct ManualPlatform {
    state: Arc<Mutex<ManualState>>,
}

impl ManualPlatform {
    pub fn new(permission: PermissionStatus) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                permission,
                grant_on_request: true,
                sink: None,
                active: None,
                starts: Vec::new(),
                stops: 0,
            })),
        }
    }

    pub fn granted() -> Self {
        Self::new(PermissionStatus::Granted)
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_permission(&self, permission: PermissionStatus) {
        self.lock().permission = permission;
    }

    pub fn set_grant_on_request(&self, grant: bool) {
        self.lock().grant_on_request = grant;
    }

    /// Push a fix as if the platform produced it. Returns false when updates
    /// are not running or the consumer is gone.
    pub fn inject(&self, fix: LocationFix) -> bool {
        let sink = self.lock().sink.clone();
        match sink {
            Some(sink) => sink.try_send(fix).is_ok(),
            None => false,
        }
    }

    /// End the running updates from the platform side, as a receiver that
    /// went away would. Not counted as a stop call.
    pub fn end_updates(&self) {
        let mut state = self.lock();
        state.active = None;
        state.sink = None;
    }

    pub fn active_policy(&self) -> Option<LocationPolicy> {
        self.lock().active
    }

    pub fn start_calls(&self) -> Vec<LocationPolicy> {
        self.lock().starts.clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.lock().stops
    }
}

#[async_trait]
impl LocationPlatform for ManualPlatform {
    async fn permission_status(&mut self) -> PermissionStatus {
        self.lock().permission
    }

    async fn request_permission(&mut self) -> PermissionStatus {
        let mut state = self.lock();
        if state.permission == PermissionStatus::NotDetermined {
            state.permission = if state.grant_on_request {
                PermissionStatus::Granted
            } else {
                PermissionStatus::Denied
            };
        }
        state.permission
    }

    async fn start_updates(&mut self, policy: LocationPolicy, sink: mpsc::Sender<LocationFix>) -> Result<()> {
        let mut state = self.lock();
        if state.permission != PermissionStatus::Granted {
            return Err(TrackerError::PermissionDenied);
        }
        state.sink = Some(sink);
        state.active = Some(policy);
        state.starts.push(policy);
        Ok(())
    }

    async fn stop_updates(&mut self) {
        let mut state = self.lock();
        if state.active.take().is_some() {
            state.stops += 1;
        }
        state.sink = None;
    }

    fn is_updating(&self) -> bool {
        self.lock().active.is_some()
    }
}
