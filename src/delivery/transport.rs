//! HTTP transport seam for webhook deliveries.
//!
//! The worker's retry/fatal policy is tested against fakes; production uses
//! reqwest with a bounded per-request timeout.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

/// What came back from the destination, success or not. Non-2xx statuses are
/// a response, not a transport error.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// POST the JSON body to the destination. Errors only on transport
    /// failure (connect, timeout, TLS); any HTTP response is returned as-is.
    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
        sent_at: &str,
    ) -> Result<TransportResponse>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
        sent_at: &str,
    ) -> Result<TransportResponse> {
        let response = self
            .client
            .post(url)
            .header("X-Timestamp", sent_at)
            .json(body)
            .send()
            .await
            .context("Failed to send webhook request")?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .context("Failed to read webhook response body")?;

        Ok(TransportResponse { status, body })
    }
}
