// src/tracking/controller.rs
//! Owner of the single location subscription
//!
//! Journey and delivery tracking are two policies over one exclusive
//! resource: switching modes always stops the running subscription before
//! the next one starts.

use super::filter::{FilterConfig, PointFilter};
use super::platform::{LocationPlatform, LocationPolicy, PermissionStatus};
use super::sample::{EventType, TrackingSample};
use crate::delivery::{Estimate, StopId};
use crate::error::{Result, TrackerError};
use crate::gps::LocationFix;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    #[default]
    Off,
    Journey,
    Delivery,
}

impl fmt::Display for TrackingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TrackingMode::Off => "off",
            TrackingMode::Journey => "journey",
            TrackingMode::Delivery => "delivery",
        };
        f.write_str(label)
    }
}

pub struct TrackingController {
    platform: Box<dyn LocationPlatform>,
    sink: mpsc::Sender<LocationFix>,
    mode: TrackingMode,
    delivery_stop: Option<StopId>,
    journey_policy: LocationPolicy,
    delivery_policy: LocationPolicy,
    filter: PointFilter,
    last_fix: Option<LocationFix>,
}

impl TrackingController {
    /// `sink` is where the platform delivers raw fixes; the owner of the
    /// receiving end feeds them back through [`TrackingController::on_fix`].
    pub fn new(platform: Box<dyn LocationPlatform>, sink: mpsc::Sender<LocationFix>, filter: FilterConfig) -> Self {
        Self {
            platform,
            sink,
            mode: TrackingMode::Off,
            delivery_stop: None,
            journey_policy: LocationPolicy::journey(),
            delivery_policy: LocationPolicy::delivery(),
            filter: PointFilter::new(filter),
            last_fix: None,
        }
    }

    pub fn with_policies(mut self, journey: LocationPolicy, delivery: LocationPolicy) -> Self {
        self.journey_policy = journey;
        self.delivery_policy = delivery;
        self
    }

    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    pub fn delivery_stop(&self) -> Option<StopId> {
        self.delivery_stop
    }

    pub fn last_fix(&self) -> Option<&LocationFix> {
        self.last_fix.as_ref()
    }

    async fn ensure_permission(&mut self) -> Result<()> {
        let mut status = self.platform.permission_status().await;
        if status == PermissionStatus::NotDetermined {
            status = self.platform.request_permission().await;
        }
        match status {
            PermissionStatus::Granted => Ok(()),
            _ => Err(TrackerError::PermissionDenied),
        }
    }

    /// Permission failures leave every mode off.
    async fn start(&mut self, mode: TrackingMode, stop: Option<StopId>) -> Result<()> {
        if let Err(e) = self.ensure_permission().await {
            warn!(%mode, "location permission not granted");
            self.stop_all().await;
            return Err(e);
        }

        self.platform.stop_updates().await;
        self.mode = TrackingMode::Off;
        self.delivery_stop = None;

        let policy = match mode {
            TrackingMode::Delivery => self.delivery_policy,
            _ => self.journey_policy,
        };
        self.platform.start_updates(policy, self.sink.clone()).await?;

        self.mode = mode;
        self.delivery_stop = stop;
        info!(%mode, stop_id = ?stop, "tracking started");
        Ok(())
    }

    pub async fn start_journey(&mut self) -> Result<()> {
        if self.mode == TrackingMode::Journey && self.platform.is_updating() {
            return Ok(());
        }
        self.start(TrackingMode::Journey, None).await
    }

    pub async fn start_delivery(&mut self, stop: StopId) -> Result<()> {
        if self.mode == TrackingMode::Delivery && self.delivery_stop == Some(stop) && self.platform.is_updating() {
            return Ok(());
        }
        self.start(TrackingMode::Delivery, Some(stop)).await
    }

    pub async fn stop_journey(&mut self) {
        if self.mode == TrackingMode::Journey {
            self.stop_all().await;
        }
    }

    pub async fn stop_delivery(&mut self) {
        if self.mode == TrackingMode::Delivery {
            self.stop_all().await;
        }
    }

    pub async fn stop_all(&mut self) {
        self.platform.stop_updates().await;
        if self.mode != TrackingMode::Off {
            info!(mode = %self.mode, "tracking stopped");
        }
        self.mode = TrackingMode::Off;
        self.delivery_stop = None;
    }

    /// Notice a subscription that ended on its own, such as a receiver that
    /// was unplugged or a gpsd stream that closed. Tracking is left off;
    /// returns `true` when that happened.
    pub async fn check_subscription(&mut self) -> bool {
        if self.mode == TrackingMode::Off || self.platform.is_updating() {
            return false;
        }
        warn!(mode = %self.mode, "location updates ended unexpectedly");
        self.stop_all().await;
        true
    }

    /// Run a fix from the platform through the point filter.
    ///
    /// Fixes that arrive after tracking stopped are ignored.
    pub fn on_fix(&mut self, fix: LocationFix) -> Option<TrackingSample> {
        let event_type = match self.mode {
            TrackingMode::Off => return None,
            TrackingMode::Journey => EventType::Journey,
            TrackingMode::Delivery => EventType::DeliveryJourney,
        };

        if !fix.coordinate.is_valid() {
            debug!(coordinate = %fix.coordinate, "ignoring invalid fix");
            return None;
        }
        self.last_fix = Some(fix);

        let decision = self.filter.offer(fix.coordinate, fix.timestamp);
        debug!(?decision, "fix filtered");
        decision
            .is_retained()
            .then(|| TrackingSample::from_fix(&fix, event_type, self.delivery_stop))
    }

    /// Start/end marker at the last known position, outside the filter.
    pub fn lifecycle_sample(
        &self,
        event_type: EventType,
        stop: StopId,
        estimate: Option<&Estimate>,
        at: DateTime<Utc>,
    ) -> Option<TrackingSample> {
        let fix = self.last_fix?;
        let mut sample = TrackingSample::from_fix(&fix, event_type, Some(stop)).with_estimate(estimate);
        sample.timestamp = at;
        Some(sample)
    }

    /// Forget the session's filter history and last position.
    pub fn reset(&mut self) {
        self.filter.reset();
        self.last_fix = None;
    }
}
