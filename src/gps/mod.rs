// src/gps/mod.rs
//! Position receivers and their wire formats

pub mod data;
pub mod gpsd;
pub mod nmea;
pub mod source;

pub use data::LocationFix;
pub use source::{list_serial_ports, GpsSource};
