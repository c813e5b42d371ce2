// src/route.rs
//! Visiting-order optimization and travel estimates
//!
//! The optimizer is a black box that may be unavailable (no network, quota
//! exhausted). Callers treat any error as "keep the manifest order".

use crate::delivery::{Estimate, Manifest, Stop, StopId};
use crate::error::{Result, TrackerError};
use crate::geo::{format_distance, Coordinate};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

pub const DIRECTIONS_URL: &str = "https://maps.googleapis.com/maps/api/directions/json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    pub order: Vec<StopId>,
    pub encoded_path: Option<String>,
}

#[async_trait]
pub trait RouteOptimizer: Send + Sync {
    /// Best visiting order for `stops` starting and ending at `origin`
    async fn optimize(&self, origin: Coordinate, stops: &[Stop]) -> Result<RoutePlan>;

    /// Travel distance and duration from `origin` to `destination`
    async fn estimate(&self, origin: Coordinate, destination: Coordinate) -> Result<Estimate>;
}

/// Pending stops with a usable coordinate, in manifest order
fn routable(manifest: &Manifest) -> Vec<Stop> {
    manifest
        .visiting_order()
        .into_iter()
        .filter(|s| s.destination().is_some())
        .cloned()
        .collect()
}

/// Ask the optimizer for a plan over the pending stops.
///
/// `None` means the manifest order stays as it is, either because there is
/// nothing to route or because the optimizer is unavailable.
pub async fn plan_route(optimizer: &dyn RouteOptimizer, origin: Coordinate, manifest: &Manifest) -> Option<RoutePlan> {
    let stops = routable(manifest);
    if stops.is_empty() {
        info!("no pending stops to optimize");
        return None;
    }

    match optimizer.optimize(origin, &stops).await {
        Ok(plan) => {
            info!(stops = plan.order.len(), "route optimized");
            Some(plan)
        }
        Err(e) => {
            warn!(error = %e, "route optimization unavailable, keeping manifest order");
            None
        }
    }
}

fn format_minutes(seconds: f64) -> String {
    let minutes = (seconds / 60.0).round().max(1.0) as u64;
    if minutes >= 60 {
        format!("{} h {} min", minutes / 60, minutes % 60)
    } else {
        format!("{} min", minutes)
    }
}

/// Offline ordering by straight-line distance from the origin
#[derive(Debug, Clone)]
pub struct ProximityOptimizer {
    pub average_speed_kmh: f64,
}

impl Default for ProximityOptimizer {
    fn default() -> Self {
        Self { average_speed_kmh: 30.0 }
    }
}

#[async_trait]
impl RouteOptimizer for ProximityOptimizer {
    async fn optimize(&self, origin: Coordinate, stops: &[Stop]) -> Result<RoutePlan> {
        let mut ranked: Vec<(f64, StopId)> = stops
            .iter()
            .map(|stop| {
                let distance = stop
                    .destination()
                    .map(|d| origin.distance_to(&d))
                    .unwrap_or(f64::INFINITY);
                (distance, stop.id)
            })
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

        Ok(RoutePlan {
            order: ranked.into_iter().map(|(_, id)| id).collect(),
            encoded_path: None,
        })
    }

    async fn estimate(&self, origin: Coordinate, destination: Coordinate) -> Result<Estimate> {
        let meters = origin.distance_to(&destination);
        let seconds = meters / (self.average_speed_kmh.max(1.0) / 3.6);
        Ok(Estimate {
            distance: format_distance(meters),
            duration: format_minutes(seconds),
        })
    }
}

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    routes: Vec<DirectionsRoute>,
}

#[derive(Debug, Deserialize)]
struct DirectionsRoute {
    #[serde(default)]
    waypoint_order: Vec<usize>,
    overview_polyline: Polyline,
    #[serde(default)]
    legs: Vec<Leg>,
}

#[derive(Debug, Deserialize)]
struct Polyline {
    points: String,
}

#[derive(Debug, Deserialize)]
struct Leg {
    distance: TextValue,
    duration: TextValue,
}

#[derive(Debug, Deserialize)]
struct TextValue {
    text: String,
}

impl DirectionsResponse {
    fn into_route(self) -> Result<DirectionsRoute> {
        if self.status != "OK" {
            return Err(TrackerError::Other(format!(
                "directions status {}: {}",
                self.status,
                self.error_message.unwrap_or_default()
            )));
        }
        self.routes
            .into_iter()
            .next()
            .ok_or_else(|| TrackerError::Parse("directions response without routes".to_string()))
    }
}

/// Map the optimized waypoint indices back onto the stops that were sent
fn plan_from_route(route: DirectionsRoute, stops: &[Stop]) -> Result<RoutePlan> {
    let order = route
        .waypoint_order
        .iter()
        .map(|&index| {
            stops
                .get(index)
                .map(|s| s.id)
                .ok_or_else(|| TrackerError::Parse(format!("waypoint index {} out of range", index)))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RoutePlan {
        order,
        encoded_path: Some(route.overview_polyline.points),
    })
}

/// Directions-API optimizer (`waypoints=optimize:true`, round trip)
pub struct DirectionsOptimizer {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl DirectionsOptimizer {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_endpoint(api_key, DIRECTIONS_URL.to_string())
    }

    pub fn with_endpoint(api_key: String, endpoint: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| TrackerError::Other(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, api_key, endpoint })
    }

    async fn fetch(&self, query: &[(&str, String)]) -> Result<DirectionsRoute> {
        let response: DirectionsResponse = self
            .client
            .get(&self.endpoint)
            .query(query)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response.into_route()
    }
}

#[async_trait]
impl RouteOptimizer for DirectionsOptimizer {
    async fn optimize(&self, origin: Coordinate, stops: &[Stop]) -> Result<RoutePlan> {
        let waypoints = stops
            .iter()
            .map(|s| s.client.gps_location.replace(' ', ""))
            .collect::<Vec<_>>()
            .join("|");

        let route = self
            .fetch(&[
                ("origin", origin.to_string()),
                ("destination", origin.to_string()),
                ("waypoints", format!("optimize:true|{}", waypoints)),
            ])
            .await?;
        plan_from_route(route, stops)
    }

    async fn estimate(&self, origin: Coordinate, destination: Coordinate) -> Result<Estimate> {
        let route = self
            .fetch(&[("origin", origin.to_string()), ("destination", destination.to_string())])
            .await?;
        let leg = route
            .legs
            .into_iter()
            .next()
            .ok_or_else(|| TrackerError::Parse("directions route without legs".to_string()))?;
        Ok(Estimate {
            distance: leg.distance.text,
            duration: leg.duration.text,
        })
    }
}
