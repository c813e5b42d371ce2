// src/sync/remote.rs
//! Backend endpoint that accepts queued mutations

use super::mutation::PendingMutation;
use crate::error::{Result, TrackerError};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

const BATCH_PATH: &str = "/deliveries/events/log/batch";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepts or refuses an ordered batch as a whole.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    async fn send_batch(&self, batch: Vec<PendingMutation>) -> Result<()>;
}

pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TrackerError::Other(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn batch_url(&self) -> String {
        format!("{}{}", self.base_url, BATCH_PATH)
    }
}

/// Pull `detail` out of an error body, falling back to the raw text.
fn rejection_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value.get("detail").map(|detail| match detail.as_str() {
                Some(text) => text.to_string(),
                None => detail.to_string(),
            })
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl RemoteEndpoint for HttpRemote {
    async fn send_batch(&self, batch: Vec<PendingMutation>) -> Result<()> {
        let url = self.batch_url();
        debug!(url = %url, entries = batch.len(), "sending batch");

        let mut request = self.client.post(&url).json(&batch);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let mut detail = rejection_detail(&body);
        if detail.is_empty() {
            detail = format!("HTTP {}", status);
        }
        warn!(status = status.as_u16(), detail = %detail, "batch rejected");

        Err(TrackerError::RemoteRejected {
            status: status.as_u16(),
            detail,
        })
    }
}
