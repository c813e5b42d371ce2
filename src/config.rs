// src/config.rs
//! Configuration management
//!
//! Stored as JSON at `$HOME/.config/delivery-tracker/config.json`. Missing
//! sections and fields fall back to their defaults, so a config file only
//! needs the values that differ.

use crate::error::{Result, TrackerError};
use crate::gps::GpsSource;
use crate::sync::BatchPolicy;
use crate::tracking::{FilterConfig, LocationPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "delivery-tracker";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub source_type: String, // "serial", "gpsd"
    pub serial_port: Option<String>,
    pub serial_baudrate: Option<u32>,
    pub gpsd_host: Option<String>,
    pub gpsd_port: Option<u16>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            source_type: "gpsd".to_string(),
            serial_port: None,
            serial_baudrate: Some(9600),
            gpsd_host: Some("localhost".to_string()),
            gpsd_port: Some(2947),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub journey: LocationPolicy,
    pub delivery: LocationPolicy,
    pub filter: FilterConfig,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            journey: LocationPolicy::journey(),
            delivery: LocationPolicy::delivery(),
            filter: FilterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub check_interval_secs: u64,
    pub check_timeout_secs: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 15,
            check_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub api: ApiConfig,
    /// Durable store location; defaults to `$HOME/.local/share/delivery-tracker`
    pub data_dir: Option<PathBuf>,
    pub source: SourceConfig,
    pub tracking: TrackingConfig,
    pub sync: BatchPolicy,
    pub connectivity: ConnectivityConfig,
    /// Directions API key; without one routes are ordered by proximity
    pub route_api_key: Option<String>,
}

fn home_dir() -> Result<PathBuf> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| TrackerError::Other("HOME environment variable not set".to_string()))
}

impl TrackerConfig {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| TrackerError::Other(format!("Failed to read config file: {}", e)))?;

        serde_json::from_str(&contents)
            .map_err(|e| TrackerError::Other(format!("Failed to parse config file: {}", e)))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TrackerError::Other(format!("Failed to create config directory: {}", e)))?;
        }

        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| TrackerError::Other(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)
            .map_err(|e| TrackerError::Other(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(home_dir()?.join(".config").join(APP_DIR).join("config.json"))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(home_dir()?.join(".local").join("share").join(APP_DIR)),
        }
    }

    /// Receiver described by the source section
    pub fn gps_source(&self) -> Result<GpsSource> {
        match self.source.source_type.as_str() {
            "serial" => {
                let port = self
                    .source
                    .serial_port
                    .clone()
                    .ok_or_else(|| TrackerError::Other("Serial source needs serial_port".to_string()))?;
                Ok(GpsSource::Serial {
                    port,
                    baudrate: self.source.serial_baudrate.unwrap_or(9600),
                })
            }
            "gpsd" => Ok(GpsSource::Gpsd {
                host: self.source.gpsd_host.clone().unwrap_or_else(|| "localhost".to_string()),
                port: self.source.gpsd_port.unwrap_or(2947),
            }),
            other => Err(TrackerError::Other(format!("Unknown source type: {}", other))),
        }
    }

    /// Update serial port settings
    pub fn update_serial(&mut self, port: String, baudrate: u32) {
        self.source.source_type = "serial".to_string();
        self.source.serial_port = Some(port);
        self.source.serial_baudrate = Some(baudrate);
    }

    /// Update gpsd settings
    pub fn update_gpsd(&mut self, host: String, port: u16) {
        self.source.source_type = "gpsd".to_string();
        self.source.gpsd_host = Some(host);
        self.source.gpsd_port = Some(port);
    }

    /// Update backend settings
    pub fn update_api(&mut self, base_url: String, token: Option<String>) {
        self.api.base_url = base_url;
        self.api.token = token;
    }
}
