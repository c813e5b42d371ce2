// src/connectivity.rs
//! Online/offline signal for the sync queue
//!
//! Reachability is checked with a plain TCP connect to the backend host.
//! Only transitions are published.

use crate::error::{Result, TrackerError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Minimum gap between two "gone offline" notices
pub const OFFLINE_NOTICE_GAP_SECS: i64 = 10;

#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    target: String,
    interval: Duration,
    timeout: Duration,
}

impl ConnectivityMonitor {
    pub fn new(target: String, interval: Duration, timeout: Duration) -> Self {
        Self { target, interval, timeout }
    }

    /// Check the host and port of an HTTP(S) base URL
    pub fn for_base_url(base_url: &str, interval: Duration, timeout: Duration) -> Result<Self> {
        let url = reqwest::Url::parse(base_url)
            .map_err(|e| TrackerError::Parse(format!("bad API URL {:?}: {}", base_url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| TrackerError::Parse(format!("API URL {:?} has no host", base_url)))?;
        let port = url.port_or_known_default().unwrap_or(443);
        Ok(Self::new(format!("{}:{}", host, port), interval, timeout))
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn check(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(target = %self.target, error = %e, "reachability check failed");
                false
            }
            Err(_) => {
                debug!(target = %self.target, "reachability check timed out");
                false
            }
        }
    }

    /// Check forever, publishing each change on the returned channel.
    /// The first result is published as well.
    pub fn spawn(self) -> (watch::Receiver<bool>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            let mut first = true;
            loop {
                ticker.tick().await;
                let online = self.check().await;
                if first || online != *tx.borrow() {
                    info!(target = %self.target, online, "connectivity changed");
                    if tx.send(online).is_err() {
                        break;
                    }
                    first = false;
                }
            }
        });

        (rx, task)
    }
}

/// Rate-limits the offline notice raised on online→offline transitions
#[derive(Debug, Clone, Default)]
pub struct OfflineNotifier {
    last_notice: Option<DateTime<Utc>>,
}

impl OfflineNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a transition at `now` should be announced
    pub fn should_notify(&mut self, now: DateTime<Utc>) -> bool {
        let due = self
            .last_notice
            .map_or(true, |last| now.signed_duration_since(last) > ChronoDuration::seconds(OFFLINE_NOTICE_GAP_SECS));
        if due {
            self.last_notice = Some(now);
        }
        due
    }
}
