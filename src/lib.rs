// src/lib.rs
//! Delivery Tracker Library
//!
//! Offline-first delivery state and location synchronization for drivers:
//! a manifest of stops worked through one at a time, background location
//! tracking from a GPS receiver, and a durable queue that reaches the
//! backend whenever the network allows.

pub mod config;
pub mod connectivity;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod geo;
pub mod gps;
pub mod route;
pub mod storage;
pub mod sync;
pub mod tracking;

// Re-export main types for convenience
pub use config::TrackerConfig;
pub use delivery::{DeliveryState, IncidentReason, Manifest, Stop, StopId, StopStatus};
pub use engine::{Engine, EngineConfig, EngineEvent, EngineHandle, EngineSnapshot};
pub use error::{Result, TrackerError};
pub use geo::Coordinate;
pub use gps::{GpsSource, LocationFix};
pub use tracking::TrackingMode;
