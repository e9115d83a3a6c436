//! `DeliveryTransport` trait and the HTTP implementation.
//!
//! The connector never talks to the network directly; it hands a JSON body
//! and an [`EndpointKind`] to a transport.  `HttpTransport` POSTs to the
//! URLs from [`DeliveryConfig`].  An endpoint without a URL fails every send
//! with [`DeliveryError::NotConfigured`], which the connector treats like
//! any other failed attempt.

use async_trait::async_trait;
use thiserror::Error;

use crate::config::DeliveryConfig;

use super::payload::EndpointKind;

// ---------------------------------------------------------------------------
// DeliveryError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeliveryError {
    /// HTTP transport or connection error.
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// The service answered with a non-2xx status.
    #[error("automation service returned HTTP {0}")]
    Status(u16),

    /// The request did not complete within the configured timeout.
    #[error("delivery request timed out")]
    Timeout,

    /// No URL is configured for this endpoint.
    #[error("no URL configured for the {0} endpoint")]
    NotConfigured(EndpointKind),

    /// The payload failed validation before it was queued.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Shutdown interrupted the task before it reached a terminal state.
    #[error("delivery cancelled by shutdown")]
    Cancelled,

    /// The connector worker is no longer running.
    #[error("delivery connector is closed")]
    Closed,
}

impl DeliveryError {
    /// Short machine-friendly name used in escalation logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::Request(_) => "request",
            DeliveryError::Status(_) => "status",
            DeliveryError::Timeout => "timeout",
            DeliveryError::NotConfigured(_) => "not_configured",
            DeliveryError::InvalidPayload(_) => "invalid_payload",
            DeliveryError::Cancelled => "cancelled",
            DeliveryError::Closed => "closed",
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeliveryError::Timeout
        } else {
            DeliveryError::Request(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// DeliveryTransport trait
// ---------------------------------------------------------------------------

/// One attempt to hand a body to the automation service.
///
/// Implementors are shared between concurrently running delivery tasks as
/// `Arc<dyn DeliveryTransport>`.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn send(&self, endpoint: EndpointKind, body: &serde_json::Value)
        -> Result<(), DeliveryError>;
}

// ---------------------------------------------------------------------------
// HttpTransport
// ---------------------------------------------------------------------------

/// POSTs JSON bodies with a pooled `reqwest::Client`.  Any 2xx status
/// (including the service's usual `202 Accepted`) counts as delivered.
pub struct HttpTransport {
    client: reqwest::Client,
    sensor_url: Option<String>,
    command_url: Option<String>,
}

impl HttpTransport {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            sensor_url: non_empty(config.sensor_endpoint.as_deref()),
            command_url: non_empty(config.command_endpoint.as_deref()),
        }
    }

    /// URL for `endpoint`, if one is configured.
    pub fn url(&self, endpoint: EndpointKind) -> Option<&str> {
        match endpoint {
            EndpointKind::SensorData => self.sensor_url.as_deref(),
            EndpointKind::Command => self.command_url.as_deref(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.sensor_url.is_some() && self.command_url.is_some()
    }
}

fn non_empty(url: Option<&str>) -> Option<String> {
    url.map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn send(
        &self,
        endpoint: EndpointKind,
        body: &serde_json::Value,
    ) -> Result<(), DeliveryError> {
        let url = self
            .url(endpoint)
            .ok_or(DeliveryError::NotConfigured(endpoint))?;

        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status(status.as_u16()))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
