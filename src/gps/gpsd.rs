// src/gps/gpsd.rs
//! GPSD client implementation

use super::data::LocationFix;
use crate::error::{Result, TrackerError};
use crate::geo::Coordinate;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tracing::{debug, info};

/// The subset of a gpsd report the tracker reads
#[derive(Debug, Deserialize)]
struct GpsdReport {
    class: String,
    mode: Option<u8>,
    time: Option<DateTime<Utc>>,
    lat: Option<f64>,
    lon: Option<f64>,
    speed: Option<f64>,
    eph: Option<f64>,
    epx: Option<f64>,
    epy: Option<f64>,
    release: Option<String>,
}

/// Connect to a gpsd daemon and return a stream reader
pub async fn connect_gpsd(host: &str, port: u16) -> Result<BufReader<TcpStream>> {
    let mut stream = TcpStream::connect(format!("{}:{}", host, port))
        .await
        .map_err(|e| TrackerError::Connection(format!("Failed to connect to gpsd at {}:{}: {}", host, port, e)))?;

    // Send WATCH command to start receiving JSON data
    let watch_cmd = "?WATCH={\"enable\":true,\"json\":true}\n";
    stream
        .write_all(watch_cmd.as_bytes())
        .await
        .map_err(|e| TrackerError::Connection(format!("Failed to send WATCH command: {}", e)))?;

    Ok(BufReader::new(stream))
}

/// Parse a single line of gpsd JSON.
///
/// Only TPV reports with at least a 2D fix produce a [`LocationFix`]; every
/// other class is accepted and ignored.
pub fn parse_gpsd_json(line: &str, now: DateTime<Utc>) -> Result<Option<LocationFix>> {
    let report: GpsdReport = serde_json::from_str(line)
        .map_err(|e| TrackerError::Parse(format!("Failed to parse gpsd JSON: {}", e)))?;

    match report.class.as_str() {
        "TPV" => Ok(tpv_to_fix(&report, now)),
        "VERSION" => {
            if let Some(release) = &report.release {
                info!(release = %release, "connected to gpsd");
            }
            Ok(None)
        }
        other => {
            debug!(class = other, "ignoring gpsd report");
            Ok(None)
        }
    }
}

fn tpv_to_fix(report: &GpsdReport, now: DateTime<Utc>) -> Option<LocationFix> {
    if report.mode.unwrap_or(0) < 2 {
        return None;
    }

    let coordinate = Coordinate::new(report.lat?, report.lon?);
    if !coordinate.is_valid() {
        return None;
    }

    // Horizontal error: eph when present, else the larger of the axis errors
    let accuracy_m = report.eph.or(match (report.epx, report.epy) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    });

    Some(LocationFix {
        coordinate,
        timestamp: report.time.unwrap_or(now),
        accuracy_m,
        speed_kmh: report.speed.map(|s| s * 3.6),
    })
}
