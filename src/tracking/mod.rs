// src/tracking/mod.rs
//! Background location tracking: platform seam, mode arbitration and the
//! retention filter

pub mod controller;
pub mod filter;
pub mod platform;
pub mod sample;

pub use controller::{TrackingController, TrackingMode};
pub use filter::{FilterConfig, FilterDecision, PointFilter};
pub use platform::{Accuracy, GpsPlatform, LocationPlatform, LocationPolicy, ManualPlatform, PermissionStatus};
pub use sample::{EventType, TrackingSample};
