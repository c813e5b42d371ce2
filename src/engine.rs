// src/engine.rs
//! Session engine
//!
//! One task owns the delivery state, the sync queue and the tracking
//! controller. Everything else talks to it through [`EngineHandle`]:
//! commands, platform fixes, flush results and timers are all consumed by
//! a single `select!` loop, so every decision is made against state no other
//! task can change in between.

use crate::connectivity::OfflineNotifier;
use crate::delivery::{
    reduce, Action, DeliveryState, Effect, Estimate, IncidentReason, Manifest, StopId, StopStatus,
    TimerReconciler, TimerTick, Transition,
};
use crate::error::{Result, TrackerError};
use crate::geo;
use crate::gps::LocationFix;
use crate::route::{plan_route, RouteOptimizer, RoutePlan};
use crate::storage::{load_json, save_json, KeyValueStore, ACTIVE_STOP_KEY, MANIFEST_KEY};
use crate::sync::{BatchPolicy, Mutation, RemoteEndpoint, SyncQueue};
use crate::tracking::{
    EventType, FilterConfig, LocationPlatform, LocationPolicy, TrackingController, TrackingMode,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const COMMAND_CAPACITY: usize = 64;
const FIX_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 256;

/// Local notifications for UI and notification collaborators
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StopChanged { id: StopId, status: StopStatus },
    TrackingModeChanged(TrackingMode),
    /// Tracking could not start; delivery state is unaffected
    TrackingUnavailable { reason: String },
    TimerTick(TimerTick),
    TimerStopped,
    Arrived { stop: StopId },
    SyncSucceeded { sent: usize, pending: usize },
    SyncFailed { error: String, retryable: bool, pending: usize },
    WentOffline,
    BackOnline,
    SessionEnded,
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSnapshot {
    pub manifest: Option<Manifest>,
    pub active: Option<StopId>,
    /// Pending stops in visiting order
    pub pending: Vec<StopId>,
    pub completed: Vec<StopId>,
    pub cancelled: Vec<StopId>,
    pub mode: TrackingMode,
    pub timer: Option<TimerTick>,
    pub queued: usize,
    pub queued_samples: usize,
    pub flushing: bool,
    pub online: bool,
    pub last_fix: Option<LocationFix>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub batch: BatchPolicy,
    pub filter: FilterConfig,
    pub journey: LocationPolicy,
    pub delivery: LocationPolicy,
    /// Connectivity assumed until the first signal arrives
    pub start_online: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch: BatchPolicy::default(),
            filter: FilterConfig::default(),
            journey: LocationPolicy::journey(),
            delivery: LocationPolicy::delivery(),
            start_online: false,
        }
    }
}

impl From<&crate::config::TrackerConfig> for EngineConfig {
    fn from(config: &crate::config::TrackerConfig) -> Self {
        Self {
            batch: config.sync,
            filter: config.tracking.filter,
            journey: config.tracking.journey,
            delivery: config.tracking.delivery,
            start_online: false,
        }
    }
}

enum Command {
    Login {
        manifest: Manifest,
        reply: oneshot::Sender<Result<EngineSnapshot>>,
    },
    Logout {
        reply: oneshot::Sender<Result<()>>,
    },
    StartStop {
        id: StopId,
        estimate: Option<Estimate>,
        reply: oneshot::Sender<Result<()>>,
    },
    CompleteStop {
        id: StopId,
        reply: oneshot::Sender<Result<()>>,
    },
    ReportIncident {
        id: StopId,
        reason: IncidentReason,
        notes: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    SetOptimizedOrder {
        plan: RoutePlan,
        reply: oneshot::Sender<Result<()>>,
    },
    Checkpoint {
        reply: oneshot::Sender<Result<()>>,
    },
    Flush,
    SetOnline(bool),
    Suspend,
    Resume {
        reply: oneshot::Sender<Option<TimerTick>>,
    },
    Snapshot {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct FlushOutcome {
    up_to: u64,
    sent: usize,
    result: Result<()>,
}

/// Errors handed to several waiters need their own copy
fn copy_error(error: &TrackerError) -> TrackerError {
    match error {
        TrackerError::NetworkUnavailable => TrackerError::NetworkUnavailable,
        TrackerError::RemoteRejected { status, detail } => TrackerError::RemoteRejected {
            status: *status,
            detail: detail.clone(),
        },
        other => TrackerError::Other(other.to_string()),
    }
}

pub struct Engine {
    state: DeliveryState,
    queue: SyncQueue,
    tracking: TrackingController,
    timer: TimerReconciler,
    store: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteEndpoint>,
    events: broadcast::Sender<EngineEvent>,
    online: bool,
    offline_notice: OfflineNotifier,
    /// Keep flushing until everything up to this sequence number is sent
    drain_to: Option<u64>,
    checkpoints: Vec<oneshot::Sender<Result<()>>>,
    /// Route samples queued since the last write; saved on the next tick
    samples_unsaved: bool,
    arrival_announced: Option<StopId>,
    flush_tx: mpsc::Sender<FlushOutcome>,
}

impl Engine {
    /// Restore persisted state, start the engine task and return its handle.
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteEndpoint>,
        platform: Box<dyn LocationPlatform>,
        optimizer: Arc<dyn RouteOptimizer>,
    ) -> Result<(EngineHandle, JoinHandle<()>)> {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (fix_tx, fix_rx) = mpsc::channel(FIX_CAPACITY);
        let (flush_tx, flush_rx) = mpsc::channel(4);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let queue = SyncQueue::restore(store.as_ref(), config.batch, Utc::now())?;
        let tracking = TrackingController::new(platform, fix_tx, config.filter)
            .with_policies(config.journey, config.delivery);

        let mut engine = Engine {
            state: DeliveryState::default(),
            queue,
            tracking,
            timer: TimerReconciler::new(),
            store,
            remote,
            events: events.clone(),
            online: config.start_online,
            offline_notice: OfflineNotifier::new(),
            drain_to: None,
            checkpoints: Vec::new(),
            samples_unsaved: false,
            arrival_announced: None,
            flush_tx,
        };
        engine.restore_session().await?;

        let task = tokio::spawn(engine.run(command_rx, fix_rx, flush_rx));
        let handle = EngineHandle {
            commands: command_tx,
            events,
            optimizer,
        };
        Ok((handle, task))
    }

    async fn restore_session(&mut self) -> Result<()> {
        let Some(manifest) = load_json::<Manifest>(self.store.as_ref(), MANIFEST_KEY)? else {
            return Ok(());
        };

        let stored_active = load_json::<Option<StopId>>(self.store.as_ref(), ACTIVE_STOP_KEY)?.flatten();
        let manifest_active = manifest.in_progress().next().map(|s| s.id);
        if stored_active != manifest_active {
            warn!(?stored_active, ?manifest_active, "active stop record disagrees with manifest");
        }

        info!(manifest = %manifest.id, queued = self.queue.len(), "restoring session");
        let transition = reduce(&self.state, Action::Login { manifest, at: Utc::now() })?;
        self.commit(transition).await;
        Ok(())
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut fixes: mpsc::Receiver<LocationFix>,
        mut flushes: mpsc::Receiver<FlushOutcome>,
    ) {
        let mut periodic = tokio::time::interval(Duration::from_secs(self.queue.policy().periodic_secs.max(1)));
        periodic.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(fix) = fixes.recv() => self.on_fix(fix),
                Some(outcome) = flushes.recv() => self.on_flush_outcome(outcome),
                _ = periodic.tick() => {
                    if self.tracking.mode() != TrackingMode::Off && !self.queue.is_empty() {
                        self.request_flush();
                    }
                }
                _ = ticker.tick() => {
                    if let Some(tick) = self.timer.tick(&self.state.timer, Utc::now()) {
                        self.emit(EngineEvent::TimerTick(tick));
                    }
                    if self.samples_unsaved {
                        self.persist_queue();
                    }
                    self.watch_subscription().await;
                }
            }
        }
        info!("engine stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Login { manifest, reply } => {
                let result = self.login(manifest).await;
                let _ = reply.send(result);
            }
            Command::Logout { reply } => {
                let _ = reply.send(self.logout().await);
            }
            Command::StartStop { id, estimate, reply } => {
                let now = Utc::now();
                let result = self
                    .apply_mutation(Mutation::StartDelivery { stop_id: id, at: now, estimate: estimate.clone() })
                    .await;
                if result.is_ok() {
                    self.lifecycle_sample(EventType::StartDelivery, id, estimate.as_ref());
                    self.arrival_announced = None;
                }
                let _ = reply.send(result);
            }
            Command::CompleteStop { id, reply } => {
                let now = Utc::now();
                // The end marker is taken before tracking leaves delivery mode
                let estimate = self.stop_estimate(id);
                let result = self.apply_mutation(Mutation::CompleteDelivery { stop_id: id, at: now }).await;
                if result.is_ok() {
                    self.lifecycle_sample(EventType::EndDelivery, id, estimate.as_ref());
                }
                let _ = reply.send(result);
            }
            Command::ReportIncident { id, reason, notes, reply } => {
                let now = Utc::now();
                let position = self.tracking.last_fix().map(|f| f.coordinate);
                let result = self
                    .apply_mutation(Mutation::ReportIncident { stop_id: id, reason, notes, at: now, position })
                    .await;
                let _ = reply.send(result);
            }
            Command::SetOptimizedOrder { plan, reply } => {
                let action = Action::SetOptimizedOrder {
                    order: plan.order,
                    encoded_path: plan.encoded_path,
                };
                let result = match reduce(&self.state, action) {
                    Ok(transition) => {
                        self.commit(transition).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Checkpoint { reply } => self.checkpoint(reply),
            Command::Flush => self.request_flush(),
            Command::SetOnline(online) => self.set_online(online),
            Command::Suspend => {
                debug!("suspended");
                self.timer.suspend();
            }
            Command::Resume { reply } => {
                let tick = self.timer.resume(&self.state.timer, Utc::now());
                if let Some(tick) = &tick {
                    self.emit(EngineEvent::TimerTick(tick.clone()));
                }
                self.request_flush();
                let _ = reply.send(tick);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn login(&mut self, manifest: Manifest) -> Result<EngineSnapshot> {
        let transition = reduce(&self.state, Action::Login { manifest, at: Utc::now() })?;
        if let Some(manifest) = &transition.state.manifest {
            info!(manifest = %manifest.id, stops = manifest.stops.len(), "logged in");
        }
        self.tracking.reset();
        self.commit(transition).await;
        Ok(self.snapshot())
    }

    async fn logout(&mut self) -> Result<()> {
        // The queue outlives the session; whatever is left goes out later
        self.request_flush();
        let transition = reduce(&self.state, Action::Logout)?;
        self.commit(transition).await;
        self.tracking.reset();
        self.arrival_announced = None;
        self.emit(EngineEvent::SessionEnded);
        info!(queued = self.queue.len(), "logged out");
        Ok(())
    }

    /// Optimistic local application plus durable enqueue
    async fn apply_mutation(&mut self, mutation: Mutation) -> Result<()> {
        let kind = mutation.kind();
        let stop_id = mutation.stop_id();
        let transition = self.queue.enqueue(&self.state, mutation, Utc::now()).map_err(|e| {
            warn!(kind, ?stop_id, error = %e, "mutation rejected");
            e
        })?;
        self.persist_queue();
        self.commit(transition).await;
        self.request_flush();
        Ok(())
    }

    fn stop_estimate(&self, id: StopId) -> Option<Estimate> {
        let stop = self.state.manifest.as_ref()?.stop(id)?;
        Some(Estimate {
            distance: stop.estimated_distance.clone()?,
            duration: stop.estimated_duration.clone()?,
        })
    }

    fn lifecycle_sample(&mut self, event_type: EventType, id: StopId, estimate: Option<&Estimate>) {
        match self.tracking.lifecycle_sample(event_type, id, estimate, Utc::now()) {
            Some(sample) => {
                self.queue.push_sample(sample, Utc::now());
                self.persist_queue();
            }
            None => debug!(stop_id = id, %event_type, "no position for lifecycle marker"),
        }
    }

    /// Adopt a new state, persist it and carry out its effects
    async fn commit(&mut self, transition: Transition) {
        self.state = transition.state;
        self.persist_session();

        for effect in transition.effects {
            match effect {
                Effect::StopChanged { id, status } => {
                    info!(stop_id = id, %status, "stop changed");
                    self.emit(EngineEvent::StopChanged { id, status });
                }
                Effect::TimerStarted(_) => {
                    if let Some(tick) = TimerReconciler::reconcile(&self.state.timer, Utc::now()) {
                        self.emit(EngineEvent::TimerTick(tick));
                    }
                }
                Effect::TimerStopped => self.emit(EngineEvent::TimerStopped),
                Effect::TrackDelivery(id) => self.switch_tracking(TrackingMode::Delivery, Some(id)).await,
                Effect::TrackJourney => self.switch_tracking(TrackingMode::Journey, None).await,
                Effect::StopTracking => self.switch_tracking(TrackingMode::Off, None).await,
            }
        }
    }

    async fn switch_tracking(&mut self, mode: TrackingMode, stop: Option<StopId>) {
        let before = self.tracking.mode();

        let result = match (mode, stop) {
            (TrackingMode::Delivery, Some(id)) => self.tracking.start_delivery(id).await,
            (TrackingMode::Journey, _) => self.tracking.start_journey().await,
            _ => {
                // Get what was captured out before the subscription ends
                self.request_flush();
                self.tracking.stop_all().await;
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(%mode, error = %e, "tracking unavailable");
            self.emit(EngineEvent::TrackingUnavailable { reason: e.to_string() });
        }

        let after = self.tracking.mode();
        if after != before {
            self.emit(EngineEvent::TrackingModeChanged(after));
        }
    }

    /// Report a location subscription that died underneath an active mode
    async fn watch_subscription(&mut self) {
        if self.tracking.check_subscription().await {
            self.emit(EngineEvent::TrackingUnavailable {
                reason: "location updates stopped".to_string(),
            });
            self.emit(EngineEvent::TrackingModeChanged(TrackingMode::Off));
        }
    }

    fn on_fix(&mut self, fix: LocationFix) {
        let now = Utc::now();
        if let Some(sample) = self.tracking.on_fix(fix) {
            self.queue.push_sample(sample, now);
            self.samples_unsaved = true;
            if self.queue.should_flush_samples(now) {
                self.request_flush();
            }
        }

        if self.tracking.mode() != TrackingMode::Delivery {
            return;
        }
        let Some(active) = self.state.active_stop() else {
            return;
        };
        if self.arrival_announced == Some(active.id) {
            return;
        }
        if let Some(destination) = active.destination() {
            if geo::arrived(&fix.coordinate, &destination) {
                let stop = active.id;
                info!(stop_id = stop, "arrived at destination");
                self.arrival_announced = Some(stop);
                self.emit(EngineEvent::Arrived { stop });
            }
        }
    }

    fn set_online(&mut self, online: bool) {
        if online == self.online {
            return;
        }
        self.online = online;

        if online {
            info!(queued = self.queue.len(), "back online");
            self.emit(EngineEvent::BackOnline);
            self.request_flush();
        } else {
            info!("offline, sync deferred");
            if self.offline_notice.should_notify(Utc::now()) {
                self.emit(EngineEvent::WentOffline);
            }
        }
    }

    fn checkpoint(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.queue.is_empty() {
            let _ = reply.send(Ok(()));
            return;
        }
        if !self.online {
            let _ = reply.send(Err(TrackerError::NetworkUnavailable));
            return;
        }
        self.checkpoints.push(reply);
        self.request_flush();
    }

    /// Start a flush unless one is already out. Requests made meanwhile are
    /// coalesced: the outstanding flush keeps draining once it succeeds.
    fn request_flush(&mut self) {
        if !self.online {
            debug!(queued = self.queue.len(), "offline, flush deferred");
            // A drain cannot continue offline; waiters learn it now
            self.drain_to = None;
            self.resolve_checkpoints(|| Err(TrackerError::NetworkUnavailable));
            return;
        }

        if let Some(newest) = self.queue.newest_seq() {
            self.drain_to = Some(self.drain_to.map_or(newest, |d| d.max(newest)));
        }

        if self.queue.is_flushing() {
            debug!("flush already in flight");
            return;
        }

        let Some(batch) = self.queue.begin_flush() else {
            self.resolve_checkpoints(|| Ok(()));
            return;
        };

        info!(entries = batch.len(), up_to = batch.up_to, "flushing");
        let remote = Arc::clone(&self.remote);
        let tx = self.flush_tx.clone();
        let up_to = batch.up_to;
        let sent = batch.len();
        tokio::spawn(async move {
            let result = remote.send_batch(batch.entries).await;
            let _ = tx.send(FlushOutcome { up_to, sent, result }).await;
        });
    }

    fn on_flush_outcome(&mut self, outcome: FlushOutcome) {
        match outcome.result {
            Ok(()) => {
                self.queue.complete_flush(outcome.up_to, Utc::now());
                self.persist_queue();
                self.emit(EngineEvent::SyncSucceeded {
                    sent: outcome.sent,
                    pending: self.queue.len(),
                });

                let more = matches!(
                    (self.queue.oldest_seq(), self.drain_to),
                    (Some(oldest), Some(drain_to)) if oldest <= drain_to
                );
                if more {
                    self.request_flush();
                } else {
                    self.drain_to = None;
                    self.resolve_checkpoints(|| Ok(()));
                }
            }
            Err(e) => {
                self.queue.abort_flush();
                self.drain_to = None;
                if e.is_rejection() || !e.is_retryable() {
                    error!(error = %e, "batch failed");
                } else {
                    warn!(error = %e, queued = self.queue.len(), "batch not delivered, will retry");
                }
                self.emit(EngineEvent::SyncFailed {
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                    pending: self.queue.len(),
                });
                self.resolve_checkpoints(|| Err(copy_error(&e)));
            }
        }
    }

    fn resolve_checkpoints(&mut self, result: impl Fn() -> Result<()>) {
        for waiter in self.checkpoints.drain(..) {
            let _ = waiter.send(result());
        }
    }

    fn persist_queue(&mut self) {
        match self.queue.persist(self.store.as_ref()) {
            Ok(()) => self.samples_unsaved = false,
            Err(e) => error!(error = %e, "failed to persist sync queue"),
        }
    }

    fn persist_session(&self) {
        let store = self.store.as_ref();
        let result = match &self.state.manifest {
            Some(manifest) => save_json(store, MANIFEST_KEY, manifest)
                .and_then(|_| save_json(store, ACTIVE_STOP_KEY, &self.state.active_stop().map(|s| s.id))),
            None => store.remove(MANIFEST_KEY).and_then(|_| store.remove(ACTIVE_STOP_KEY)),
        };
        if let Err(e) = result {
            error!(error = %e, "failed to persist session");
        }
    }

    async fn shutdown(&mut self) {
        self.tracking.stop_all().await;
        self.persist_queue();
        self.resolve_checkpoints(|| Err(TrackerError::Other("engine shut down".to_string())));
    }

    fn snapshot(&self) -> EngineSnapshot {
        let manifest = self.state.manifest.clone();
        let buckets = self.state.buckets();
        let pending = manifest
            .as_ref()
            .map(|m| m.visiting_order().iter().map(|s| s.id).collect())
            .unwrap_or_default();

        EngineSnapshot {
            active: buckets.active.map(|s| s.id),
            pending,
            completed: buckets.completed.iter().map(|s| s.id).collect(),
            cancelled: buckets.cancelled.iter().map(|s| s.id).collect(),
            manifest,
            mode: self.tracking.mode(),
            timer: TimerReconciler::reconcile(&self.state.timer, Utc::now()),
            queued: self.queue.len(),
            queued_samples: self.queue.sample_count(),
            flushing: self.queue.is_flushing(),
            online: self.online,
            last_fix: self.tracking.last_fix().copied(),
        }
    }
}

/// Cloneable front end of a running [`Engine`]
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<EngineEvent>,
    optimizer: Arc<dyn RouteOptimizer>,
}

impl EngineHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply)).await?;
        response
            .await
            .map_err(|_| TrackerError::Other("engine dropped the request".to_string()))
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TrackerError::Other("engine is not running".to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn login(&self, manifest: Manifest) -> Result<EngineSnapshot> {
        self.request(|reply| Command::Login { manifest, reply }).await?
    }

    /// Push what is queued, then end the session
    pub async fn logout(&self) -> Result<()> {
        if let Err(e) = self.checkpoint().await {
            debug!(error = %e, "checkpoint before logout failed");
        }
        self.request(|reply| Command::Logout { reply }).await?
    }

    /// Start a stop, snapshotting a travel estimate from the last position
    pub async fn start_stop(&self, id: StopId) -> Result<()> {
        let estimate = self.estimate_for(id).await;
        self.request(|reply| Command::StartStop { id, estimate, reply }).await?
    }

    async fn estimate_for(&self, id: StopId) -> Option<Estimate> {
        let snapshot = self.snapshot().await.ok()?;
        let origin = snapshot.last_fix?.coordinate;
        let destination = snapshot.manifest?.stop(id)?.destination()?;

        match self.optimizer.estimate(origin, destination).await {
            Ok(estimate) => Some(estimate),
            Err(e) => {
                debug!(stop_id = id, error = %e, "no travel estimate");
                None
            }
        }
    }

    pub async fn complete_stop(&self, id: StopId) -> Result<()> {
        self.request(|reply| Command::CompleteStop { id, reply }).await?
    }

    pub async fn report_incident(&self, id: StopId, reason: IncidentReason, notes: Option<String>) -> Result<()> {
        self.request(|reply| Command::ReportIncident { id, reason, notes, reply }).await?
    }

    /// Reorder pending stops from the current position. `None` when there
    /// is no position yet or the optimizer is unavailable; the manifest
    /// order then stays in effect.
    pub async fn optimize_route(&self) -> Result<Option<RoutePlan>> {
        let snapshot = self.snapshot().await?;
        let manifest = snapshot.manifest.ok_or(TrackerError::NoSession)?;
        let Some(origin) = snapshot.last_fix.map(|f| f.coordinate) else {
            info!("no position fix yet, keeping manifest order");
            return Ok(None);
        };

        let Some(plan) = plan_route(self.optimizer.as_ref(), origin, &manifest).await else {
            return Ok(None);
        };
        let applied = plan.clone();
        self.request(|reply| Command::SetOptimizedOrder { plan, reply }).await??;
        Ok(Some(applied))
    }

    /// Flush everything queued and wait for the outcome
    pub async fn checkpoint(&self) -> Result<()> {
        self.request(|reply| Command::Checkpoint { reply }).await?
    }

    /// Ask for a flush without waiting for it
    pub async fn flush(&self) -> Result<()> {
        self.send(Command::Flush).await
    }

    pub async fn set_online(&self, online: bool) -> Result<()> {
        self.send(Command::SetOnline(online)).await
    }

    pub async fn suspend(&self) -> Result<()> {
        self.send(Command::Suspend).await
    }

    pub async fn resume(&self) -> Result<Option<TimerTick>> {
        self.request(|reply| Command::Resume { reply }).await
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
