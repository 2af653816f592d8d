//! Outbound transport seam.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{SecurityError, SecurityResult};
use crate::pipeline::context::SignedRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// Raw response body.
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends requests that have been through the whole pipeline.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Where requests go; used for audit records.
    fn endpoint(&self) -> &str;

    async fn send(&self, request: &SignedRequest) -> SecurityResult<TransportResponse>;
}

/// JSON-over-HTTPS transport posting to a single endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> SecurityResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SecurityError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, request: &SignedRequest) -> SecurityResult<TransportResponse> {
        let mut builder = self.client.post(&self.endpoint).json(&request.body()?);
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder
            .send()
            .await
            .map_err(|e| SecurityError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| SecurityError::Transport(e.to_string()))?;
        tracing::debug!(endpoint = %self.endpoint, status, bytes = body.len(), "Request sent");
        Ok(TransportResponse { status, body })
    }
}
