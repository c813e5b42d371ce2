// src/gps/source.rs
//! Receivers the location subsystem reads fixes from

use super::{data::{FixAccumulator, LocationFix}, gpsd, nmea};
use crate::error::{Result, TrackerError};
use chrono::Utc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

/// GPS data source configuration
#[derive(Debug, Clone, PartialEq)]
pub enum GpsSource {
    Serial { port: String, baudrate: u32 },
    Gpsd { host: String, port: u16 },
}

impl GpsSource {
    pub fn describe(&self) -> String {
        match self {
            GpsSource::Serial { port, baudrate } => format!("serial {} @ {} baud", port, baudrate),
            GpsSource::Gpsd { host, port } => format!("gpsd {}:{}", host, port),
        }
    }

    /// Check that the receiver can be opened by this process.
    ///
    /// Only device nodes carry access rights; a gpsd socket is always allowed.
    pub fn check_access(&self) -> std::io::Result<()> {
        match self {
            GpsSource::Serial { port, .. } => std::fs::OpenOptions::new().read(true).open(port).map(|_| ()),
            GpsSource::Gpsd { .. } => Ok(()),
        }
    }

    /// Open the receiver and forward every fix until the stream ends or the
    /// receiving side is dropped.
    pub async fn stream_fixes(self, tx: mpsc::Sender<LocationFix>) -> Result<()> {
        match self {
            GpsSource::Serial { port, baudrate } => {
                info!(port = %port, baudrate, "opening serial receiver");
                let serial = tokio_serial::new(&port, baudrate)
                    .timeout(Duration::from_millis(1000))
                    .open_native_async()
                    .map_err(|e| TrackerError::Connection(format!("Failed to open serial port {}: {}", port, e)))?;

                let mut acc = FixAccumulator::new();
                forward_lines(BufReader::new(serial), &tx, |line| {
                    if nmea::parse_nmea_sentence(&mut acc, line) {
                        acc.take_fix(Utc::now())
                    } else {
                        None
                    }
                })
                .await
            }
            GpsSource::Gpsd { host, port } => {
                info!(host = %host, port, "connecting to gpsd");
                let reader = gpsd::connect_gpsd(&host, port).await?;

                forward_lines(reader, &tx, |line| match gpsd::parse_gpsd_json(line, Utc::now()) {
                    Ok(fix) => fix,
                    Err(e) => {
                        warn!(error = %e, "skipping gpsd line");
                        None
                    }
                })
                .await
            }
        }
    }
}

async fn forward_lines<R, F>(mut reader: R, tx: &mpsc::Sender<LocationFix>, mut parse: F) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&str) -> Option<LocationFix>,
{
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            info!("receiver stream ended");
            return Ok(());
        }

        // Line noise on serial links is not always valid UTF-8
        let line = String::from_utf8_lossy(&buf);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(fix) = parse(trimmed) {
            if tx.send(fix).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// List available serial ports
pub fn list_serial_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| TrackerError::Other(format!("Failed to list serial ports: {}", e)))?;

    Ok(ports
        .into_iter()
        .map(|port| format!("{} - {:?}", port.port_name, port.port_type))
        .collect())
}
