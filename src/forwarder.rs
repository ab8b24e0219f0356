//! Webhook delivery: one HTTP POST per artifact.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ConfigError, DeliveryError};

/// Correlates the two deliveries belonging to one inbound message.
pub const MESSAGE_ID_HEADER: &str = "x-relay-message-id";
/// Names the artifact carried by a delivery.
pub const ARTIFACT_HEADER: &str = "x-relay-artifact";

/// Longest rejection body kept for logging.
const MAX_LOGGED_BODY: usize = 200;

/// Which rendering of the message a delivery carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Raw,
    Structured,
}

impl ArtifactKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Raw => "text/plain; charset=utf-8",
            Self::Structured => "application/json",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Structured => "structured",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One artifact addressed to one destination.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub message_id: Uuid,
    pub kind: ArtifactKind,
    pub destination: Url,
    pub payload: Bytes,
    pub content_type: String,
}

impl DeliveryRequest {
    pub fn new(message_id: Uuid, kind: ArtifactKind, destination: Url, payload: Bytes) -> Self {
        Self {
            message_id,
            kind,
            destination,
            payload,
            content_type: kind.content_type().to_string(),
        }
    }
}

/// Result of delivering one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    pub kind: ArtifactKind,
    pub success: bool,
    /// HTTP status, when the destination answered at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DeliveryError>,
    pub attempts: u32,
}

impl DeliveryOutcome {
    pub fn delivered(kind: ArtifactKind, status: u16) -> Self {
        Self {
            kind,
            success: true,
            status: Some(status),
            error: None,
            attempts: 1,
        }
    }

    pub fn failed(kind: ArtifactKind, error: DeliveryError) -> Self {
        let status = match &error {
            DeliveryError::Rejected { status } => Some(*status),
            DeliveryError::Transport { .. } => None,
        };
        Self {
            kind,
            success: false,
            status,
            error: Some(error),
            attempts: 1,
        }
    }

    pub fn from_result(kind: ArtifactKind, result: Result<u16, DeliveryError>) -> Self {
        match result {
            Ok(status) => Self::delivered(kind, status),
            Err(e) => Self::failed(kind, e),
        }
    }
}

/// Sends a [`DeliveryRequest`] somewhere and reports what happened.
///
/// Expected failures are values in the outcome, never errors or panics.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: DeliveryRequest) -> DeliveryOutcome;
}

/// [`Forwarder`] that POSTs over HTTP with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    token: Option<SecretString>,
}

impl HttpForwarder {
    /// Build a forwarder whose every request is bounded by `timeout`.
    pub fn new(timeout: Duration, token: Option<SecretString>) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mail-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "http client".into(),
                message: e.to_string(),
            })?;
        Ok(Self::with_client(client, token))
    }

    pub fn with_client(client: reqwest::Client, token: Option<SecretString>) -> Self {
        Self { client, token }
    }

    /// Perform exactly one POST and classify the result.
    pub async fn post(
        &self,
        destination: &Url,
        payload: Bytes,
        content_type: &str,
    ) -> Result<u16, DeliveryError> {
        self.send(destination, payload, content_type, &[]).await
    }

    async fn send(
        &self,
        destination: &Url,
        payload: Bytes,
        content_type: &str,
        extra_headers: &[(&str, String)],
    ) -> Result<u16, DeliveryError> {
        let mut builder = self
            .client
            .post(destination.clone())
            .header(CONTENT_TYPE, content_type)
            .body(payload);
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token.expose_secret()));
        }
        for (name, value) in extra_headers {
            builder = builder.header(*name, value.as_str());
        }

        let response = builder.send().await.map_err(|e| DeliveryError::Transport {
            timed_out: e.is_timeout(),
            reason: e.without_url().to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            status = status.as_u16(),
            body = %body.chars().take(MAX_LOGGED_BODY).collect::<String>(),
            "Webhook rejected delivery"
        );
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, request: DeliveryRequest) -> DeliveryOutcome {
        let bytes = request.payload.len();
        let headers = [
            (MESSAGE_ID_HEADER, request.message_id.to_string()),
            (ARTIFACT_HEADER, request.kind.label().to_string()),
        ];
        let result = self
            .send(
                &request.destination,
                request.payload,
                &request.content_type,
                &headers,
            )
            .await;

        match &result {
            Ok(status) => debug!(
                message_id = %request.message_id,
                artifact = %request.kind,
                status,
                bytes,
                "Artifact delivered"
            ),
            Err(e) => warn!(
                message_id = %request.message_id,
                artifact = %request.kind,
                error = %e,
                "Artifact delivery failed"
            ),
        }

        DeliveryOutcome::from_result(request.kind, result)
    }
}
