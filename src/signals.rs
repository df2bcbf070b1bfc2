//! Signal provider boundary.
//!
//! News parsing, indicator computation and AI prompting all live in a
//! separate service; this side only consumes fused snapshots over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::types::SignalSnapshot;

#[async_trait]
pub trait SignalProvider: Send + Sync {
    /// Current candidate trades with attached technicals, AI opinion and
    /// market headlines. An empty vec means nothing new this cycle.
    async fn snapshots(&self) -> anyhow::Result<Vec<SignalSnapshot>>;
}

/// HTTP client for the signal service.
pub struct SignalServiceClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotsResponse {
    snapshots: Vec<SignalSnapshot>,
}

impl SignalServiceClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SignalProvider for SignalServiceClient {
    async fn snapshots(&self) -> anyhow::Result<Vec<SignalSnapshot>> {
        let url = format!("{}/v1/signals", self.base_url);
        debug!("Fetching signal snapshots from {}", url);

        let response = self.client.get(&url).send().await?;
        if response.status().is_success() {
            let data: SnapshotsResponse = response.json().await?;
            debug!("Received {} snapshots", data.snapshots.len());
            Ok(data.snapshots)
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(anyhow::anyhow!("Signal fetch failed: {} - {}", status, text))
        }
    }
}
