// src/error.rs
//! Error types for the delivery tracker

use crate::delivery::StopId;
use std::fmt;

pub type Result<T> = std::result::Result<T, TrackerError>;

#[derive(Debug)]
pub enum TrackerError {
    Io(std::io::Error),
    Serial(tokio_serial::Error),
    Json(serde_json::Error),
    Http(reqwest::Error),
    Connection(String),
    Parse(String),
    /// Location access was refused; tracking stays off.
    PermissionDenied,
    /// No route to the backend. Sync is deferred, nothing is lost.
    NetworkUnavailable,
    /// The backend answered but refused the batch.
    RemoteRejected { status: u16, detail: String },
    /// A transition that the current state does not allow.
    InvariantViolation(String),
    AlreadyActive { active: StopId },
    StopNotFound(StopId),
    NoSession,
    Other(String),
}

impl TrackerError {
    /// Whether the failed operation may succeed later without user action.
    ///
    /// Network and remote failures keep the queue intact for the next cycle;
    /// local rejections never reach the network and are not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrackerError::NetworkUnavailable
                | TrackerError::RemoteRejected { .. }
                | TrackerError::Http(_)
                | TrackerError::Connection(_)
        )
    }

    /// Local state errors: the action was rejected before any network call.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            TrackerError::InvariantViolation(_)
                | TrackerError::AlreadyActive { .. }
                | TrackerError::StopNotFound(_)
                | TrackerError::NoSession
        )
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::Io(e) => write!(f, "IO error: {}", e),
            TrackerError::Serial(e) => write!(f, "Serial error: {}", e),
            TrackerError::Json(e) => write!(f, "JSON error: {}", e),
            TrackerError::Http(e) => write!(f, "HTTP error: {}", e),
            TrackerError::Connection(msg) => write!(f, "Connection error: {}", msg),
            TrackerError::Parse(msg) => write!(f, "Parse error: {}", msg),
            TrackerError::PermissionDenied => write!(f, "Location permission denied"),
            TrackerError::NetworkUnavailable => write!(f, "Network unavailable"),
            TrackerError::RemoteRejected { status, detail } => {
                write!(f, "Remote rejected batch (HTTP {}): {}", status, detail)
            }
            TrackerError::InvariantViolation(msg) => write!(f, "Invalid transition: {}", msg),
            TrackerError::AlreadyActive { active } => {
                write!(f, "Stop {} is already in progress", active)
            }
            TrackerError::StopNotFound(id) => write!(f, "Stop {} not found in manifest", id),
            TrackerError::NoSession => write!(f, "No manifest loaded"),
            TrackerError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for TrackerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrackerError::Io(e) => Some(e),
            TrackerError::Serial(e) => Some(e),
            TrackerError::Json(e) => Some(e),
            TrackerError::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(error: std::io::Error) -> Self {
        TrackerError::Io(error)
    }
}

impl From<tokio_serial::Error> for TrackerError {
    fn from(error: tokio_serial::Error) -> Self {
        TrackerError::Serial(error)
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(error: serde_json::Error) -> Self {
        TrackerError::Json(error)
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() || error.is_timeout() {
            TrackerError::NetworkUnavailable
        } else {
            TrackerError::Http(error)
        }
    }
}

impl From<anyhow::Error> for TrackerError {
    fn from(error: anyhow::Error) -> Self {
        TrackerError::Other(error.to_string())
    }
}
