// src/delivery/mod.rs
//! Stops, the delivery lifecycle, and the time-on-stop timer

pub mod machine;
pub mod model;
pub mod timer;

pub use machine::{reduce, Action, DeliveryState, Effect, Estimate, Transition};
pub use model::{Client, IncidentReason, Manifest, Stop, StopBuckets, StopId, StopStatus};
pub use timer::{format_elapsed, TimerReconciler, TimerState, TimerTick};
