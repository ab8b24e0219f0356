//! Per-message orchestration: decode, structure, fan out to the webhook.
//!
//! The two deliveries are independent. One failing never prevents the other
//! from being attempted, and each outcome is reported on its own.

pub mod retry;
pub mod state;

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Serialize;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

pub use retry::RetryPolicy;
pub use state::{RelayStage, StageTracker, StageTransition};

use crate::config::RelayConfig;
use crate::decoder::StreamDecoder;
use crate::error::{ConfigError, RelayError};
use crate::forwarder::{ArtifactKind, DeliveryOutcome, DeliveryRequest, Forwarder, HttpForwarder};
use crate::stream::RawMessageStream;
use crate::structurer::MessageStructurer;

/// SMTP envelope addresses supplied by the delivering host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

/// One email handed over by the mail-routing host.
pub struct InboundMessage {
    pub id: Uuid,
    pub envelope: Envelope,
    pub raw: RawMessageStream,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(raw: RawMessageStream) -> Self {
        Self {
            id: Uuid::new_v4(),
            envelope: Envelope::default(),
            raw,
            received_at: Utc::now(),
        }
    }

    pub fn with_envelope(mut self, envelope: Envelope) -> Self {
        self.envelope = envelope;
        self
    }
}

/// Terminal account of one relay.
#[derive(Debug, Clone, Serialize)]
pub struct RelayReport {
    pub message_id: Uuid,
    pub envelope: Envelope,
    pub state: RelayStage,
    /// False when malformed UTF-8 was replaced with U+FFFD in the raw
    /// artifact. Absent when decoding never finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_lossless: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<DeliveryOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<DeliveryOutcome>,
    /// Why the pipeline aborted, for `failed` reports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RelayError>,
    pub transitions: Vec<StageTransition>,
    pub received_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RelayReport {
    pub fn is_success(&self) -> bool {
        self.state == RelayStage::Completed
    }

    pub fn outcome(&self, kind: ArtifactKind) -> Option<&DeliveryOutcome> {
        match kind {
            ArtifactKind::Raw => self.raw.as_ref(),
            ArtifactKind::Structured => self.structured.as_ref(),
        }
    }
}

/// Terminal stage for a pair of delivery outcomes.
pub fn terminal_stage(raw: &DeliveryOutcome, structured: &DeliveryOutcome) -> RelayStage {
    match (raw.success, structured.success) {
        (true, true) => RelayStage::Completed,
        (false, false) => RelayStage::DeliveryFailed,
        _ => RelayStage::PartiallyFailed,
    }
}

/// Sequences decoder, structurer and forwarder for one message at a time.
///
/// Holds no per-message state, so one instance can serve any number of
/// concurrent relays.
pub struct RelayOrchestrator {
    decoder: StreamDecoder,
    structurer: MessageStructurer,
    forwarder: Arc<dyn Forwarder>,
    destination: Url,
    retry: RetryPolicy,
}

impl RelayOrchestrator {
    pub fn new(
        decoder: StreamDecoder,
        structurer: MessageStructurer,
        forwarder: Arc<dyn Forwarder>,
        destination: Url,
    ) -> Self {
        Self {
            decoder,
            structurer,
            forwarder,
            destination,
            retry: RetryPolicy::none(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Wire up the production pipeline: `reqwest` delivery and the
    /// `mail-parser` backend.
    pub fn from_config(config: &RelayConfig) -> Result<Self, ConfigError> {
        let forwarder = HttpForwarder::new(config.http_timeout, config.webhook_token.clone())?;
        Ok(Self::new(
            StreamDecoder::new(config.decoder_options()),
            MessageStructurer::default(),
            Arc::new(forwarder),
            config.webhook_url.clone(),
        )
        .with_retry(config.retry))
    }

    /// Relay one message to its terminal state. Never panics on expected
    /// failures; every failure is in the returned report.
    pub async fn relay(&self, inbound: InboundMessage) -> RelayReport {
        let span = info_span!("relay", message_id = %inbound.id);
        self.relay_inner(inbound).instrument(span).await
    }

    async fn relay_inner(&self, inbound: InboundMessage) -> RelayReport {
        let InboundMessage {
            id,
            envelope,
            raw,
            received_at,
        } = inbound;
        let mut tracker = StageTracker::new();

        info!(
            from = envelope.from.as_deref().unwrap_or("-"),
            to = envelope.to.as_deref().unwrap_or("-"),
            "Relaying inbound message"
        );

        // `raw` moves into the decoder and is released there on every path.
        let text = match self.decoder.decode(raw).await {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failed to decode inbound message");
                return Self::abort(id, envelope, received_at, tracker, e.into());
            }
        };
        tracker.advance(RelayStage::Decoded);
        let lossless = text.is_lossless();
        if !lossless {
            warn!(bytes = text.len(), "Malformed UTF-8 replaced in raw artifact");
        }

        let structured = match self.structurer.structure_text(&text).await {
            Ok(structured) => structured,
            Err(e) => {
                error!(error = %e, "Failed to structure inbound message");
                return Self::abort(id, envelope, received_at, tracker, e.into());
            }
        };
        tracker.advance(RelayStage::Structured);
        tracker.advance(RelayStage::Forwarding);

        let raw_request = DeliveryRequest::new(
            id,
            ArtifactKind::Raw,
            self.destination.clone(),
            Bytes::from(text.into_text()),
        );
        let structured_request = DeliveryRequest::new(
            id,
            ArtifactKind::Structured,
            self.destination.clone(),
            Bytes::from(structured.into_json()),
        );

        let (raw_outcome, structured_outcome) = tokio::join!(
            self.deliver(raw_request),
            self.deliver(structured_request)
        );

        let state = terminal_stage(&raw_outcome, &structured_outcome);
        tracker.advance(state);
        match state {
            RelayStage::Completed => info!(lossless, "Message forwarded (raw + structured)"),
            RelayStage::PartiallyFailed => warn!(
                raw_ok = raw_outcome.success,
                structured_ok = structured_outcome.success,
                "Message partially forwarded"
            ),
            _ => error!("Message could not be forwarded"),
        }

        RelayReport {
            message_id: id,
            envelope,
            state,
            raw_lossless: Some(lossless),
            raw: Some(raw_outcome),
            structured: Some(structured_outcome),
            error: None,
            transitions: tracker.into_transitions(),
            received_at,
            finished_at: Utc::now(),
        }
    }

    async fn deliver(&self, request: DeliveryRequest) -> DeliveryOutcome {
        self.retry
            .run(|| self.forwarder.forward(request.clone()))
            .await
    }

    fn abort(
        id: Uuid,
        envelope: Envelope,
        received_at: DateTime<Utc>,
        mut tracker: StageTracker,
        error: RelayError,
    ) -> RelayReport {
        tracker.advance(RelayStage::Failed);
        RelayReport {
            message_id: id,
            envelope,
            state: RelayStage::Failed,
            raw_lossless: None,
            raw: None,
            structured: None,
            error: Some(error),
            transitions: tracker.into_transitions(),
            received_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::{DecodeError, DeliveryError};
    use crate::stream;

    const SAMPLE: &str = "From: sender@example.com\r\n\
To: recipient@example.com\r\n\
Subject: Foo is not bar\r\n\
Content-Type: text/plain\r\n\
\r\n\
Hello, fun fact that foo is not bar\r\n";

    /// Records requests and answers per artifact kind.
    struct StubForwarder {
        raw: Result<u16, DeliveryError>,
        structured: Result<u16, DeliveryError>,
        seen: Mutex<Vec<DeliveryRequest>>,
    }

    impl StubForwarder {
        fn new(raw: Result<u16, DeliveryError>, structured: Result<u16, DeliveryError>) -> Arc<Self> {
            Arc::new(Self {
                raw,
                structured,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Forwarder for StubForwarder {
        async fn forward(&self, request: DeliveryRequest) -> DeliveryOutcome {
            let result = match request.kind {
                ArtifactKind::Raw => self.raw.clone(),
                ArtifactKind::Structured => self.structured.clone(),
            };
            let kind = request.kind;
            self.seen.lock().unwrap().push(request);
            DeliveryOutcome::from_result(kind, result)
        }
    }

    fn orchestrator(forwarder: Arc<StubForwarder>) -> RelayOrchestrator {
        RelayOrchestrator::new(
            StreamDecoder::default(),
            MessageStructurer::default(),
            forwarder,
            Url::parse("http://hooks.example.com/inbound").unwrap(),
        )
    }

    fn refused() -> DeliveryError {
        DeliveryError::Transport {
            reason: "connection refused".into(),
            timed_out: false,
        }
    }

    #[tokio::test]
    async fn both_deliveries_succeed() {
        let forwarder = StubForwarder::new(Ok(200), Ok(202));
        let report = orchestrator(Arc::clone(&forwarder))
            .relay(InboundMessage::new(stream::from_bytes(SAMPLE)))
            .await;

        assert_eq!(report.state, RelayStage::Completed);
        assert!(report.is_success());
        assert_eq!(report.outcome(ArtifactKind::Raw).unwrap().status, Some(200));
        assert_eq!(report.outcome(ArtifactKind::Structured).unwrap().status, Some(202));
        assert!(report.error.is_none());
        assert_eq!(report.raw_lossless, Some(true));

        let seen = forwarder.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let raw = seen.iter().find(|r| r.kind == ArtifactKind::Raw).unwrap();
        let json = seen.iter().find(|r| r.kind == ArtifactKind::Structured).unwrap();
        assert_eq!(&raw.payload[..], SAMPLE.as_bytes());
        assert_eq!(raw.content_type, "text/plain; charset=utf-8");
        assert_eq!(json.content_type, "application/json");
        assert_eq!(raw.message_id, json.message_id);
        assert_eq!(raw.message_id, report.message_id);

        let body: serde_json::Value = serde_json::from_slice(&json.payload).unwrap();
        assert_eq!(body["headers"]["from"], "sender@example.com");
        assert_eq!(body["headers"]["subject"], "Foo is not bar");
    }

    #[tokio::test]
    async fn structured_failure_keeps_raw_outcome() {
        let forwarder = StubForwarder::new(Ok(200), Err(DeliveryError::Rejected { status: 500 }));
        let report = orchestrator(forwarder)
            .relay(InboundMessage::new(stream::from_bytes(SAMPLE)))
            .await;

        assert_eq!(report.state, RelayStage::PartiallyFailed);
        let raw = report.raw.as_ref().unwrap();
        assert!(raw.success);
        assert_eq!(raw.status, Some(200));
        let structured = report.structured.as_ref().unwrap();
        assert_eq!(structured.error, Some(DeliveryError::Rejected { status: 500 }));
    }

    #[tokio::test]
    async fn raw_failure_keeps_structured_outcome() {
        let forwarder = StubForwarder::new(Err(refused()), Ok(200));
        let report = orchestrator(forwarder)
            .relay(InboundMessage::new(stream::from_bytes(SAMPLE)))
            .await;

        assert_eq!(report.state, RelayStage::PartiallyFailed);
        assert!(report.structured.as_ref().unwrap().success);
        assert!(matches!(
            report.raw.as_ref().unwrap().error,
            Some(DeliveryError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn both_failures_are_delivery_failed_not_failed() {
        let forwarder = StubForwarder::new(Err(refused()), Err(DeliveryError::Rejected { status: 503 }));
        let report = orchestrator(forwarder)
            .relay(InboundMessage::new(stream::from_bytes(SAMPLE)))
            .await;

        assert_eq!(report.state, RelayStage::DeliveryFailed);
        assert!(report.error.is_none());
        assert!(report.raw.is_some() && report.structured.is_some());
    }

    #[tokio::test]
    async fn decode_failure_aborts_without_forwarding() {
        let forwarder = StubForwarder::new(Ok(200), Ok(200));
        let source = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"From: a")),
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "host went away")),
        ]);
        let report = orchestrator(Arc::clone(&forwarder))
            .relay(InboundMessage::new(Box::pin(source)))
            .await;

        assert_eq!(report.state, RelayStage::Failed);
        assert!(matches!(
            report.error,
            Some(RelayError::Decode(DecodeError::Read { .. }))
        ));
        assert!(report.raw.is_none() && report.structured.is_none());
        assert!(report.raw_lossless.is_none());
        assert!(forwarder.seen.lock().unwrap().is_empty());
        assert_eq!(report.transitions.last().unwrap().to, RelayStage::Failed);
    }

    #[tokio::test]
    async fn structure_failure_aborts_without_forwarding() {
        let forwarder = StubForwarder::new(Ok(200), Ok(200));
        let report = orchestrator(Arc::clone(&forwarder))
            .relay(InboundMessage::new(stream::from_bytes("   \r\n")))
            .await;

        assert_eq!(report.state, RelayStage::Failed);
        assert_eq!(report.error.as_ref().map(RelayError::kind), Some("structure"));
        assert!(forwarder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn replaced_bytes_are_flagged_in_report() {
        let forwarder = StubForwarder::new(Ok(200), Ok(200));
        let mut bytes = SAMPLE.as_bytes().to_vec();
        bytes.extend_from_slice(b"bad byte: \xff\r\n");
        let report = orchestrator(Arc::clone(&forwarder))
            .relay(InboundMessage::new(stream::from_bytes(bytes)))
            .await;

        assert_eq!(report.state, RelayStage::Completed);
        assert_eq!(report.raw_lossless, Some(false));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["raw_lossless"], false);

        let seen = forwarder.seen.lock().unwrap();
        let raw = seen.iter().find(|r| r.kind == ArtifactKind::Raw).unwrap();
        assert!(std::str::from_utf8(&raw.payload).unwrap().contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn retries_apply_per_artifact() {
        let forwarder = StubForwarder::new(Ok(200), Err(DeliveryError::Rejected { status: 502 }));
        let report = orchestrator(Arc::clone(&forwarder))
            .with_retry(RetryPolicy {
                max_attempts: 3,
                initial_backoff: std::time::Duration::from_millis(1),
                max_backoff: std::time::Duration::from_millis(2),
            })
            .relay(InboundMessage::new(stream::from_bytes(SAMPLE)))
            .await;

        assert_eq!(report.raw.as_ref().unwrap().attempts, 1);
        assert_eq!(report.structured.as_ref().unwrap().attempts, 3);
        assert_eq!(forwarder.seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn report_serializes_state_and_outcomes() {
        let forwarder = StubForwarder::new(Ok(200), Err(DeliveryError::Rejected { status: 500 }));
        let report = orchestrator(forwarder)
            .relay(
                InboundMessage::new(stream::from_bytes(SAMPLE)).with_envelope(Envelope {
                    from: Some("bounce@example.com".into()),
                    to: Some("inbox@example.com".into()),
                }),
            )
            .await;

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "partially_failed");
        assert_eq!(json["envelope"]["from"], "bounce@example.com");
        assert_eq!(json["raw"]["success"], true);
        assert_eq!(json["structured"]["error"]["kind"], "rejected");
        assert_eq!(json["transitions"].as_array().unwrap().len(), 4);
    }
}
