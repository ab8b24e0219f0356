//! HTTP ingest surface for the mail-routing host.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::{DecodeError, RelayError};
use crate::relay::{Envelope, InboundMessage, RelayOrchestrator, RelayReport, RelayStage};
use crate::stream;

/// SMTP `MAIL FROM`, as seen by the delivering host.
pub const ENVELOPE_FROM_HEADER: &str = "x-envelope-from";
/// SMTP `RCPT TO`, as seen by the delivering host.
pub const ENVELOPE_TO_HEADER: &str = "x-envelope-to";

/// State shared across handlers.
#[derive(Clone)]
pub struct IngestState {
    pub orchestrator: Arc<RelayOrchestrator>,
    /// One permit per relay allowed in flight.
    pub permits: Arc<Semaphore>,
}

/// Build the Axum router for message ingest and health. Message size is
/// capped by the orchestrator's decoder, not by a body-limit layer.
pub fn ingest_routes(orchestrator: Arc<RelayOrchestrator>, max_concurrent: usize) -> Router {
    let state = IngestState {
        orchestrator,
        permits: Arc::new(Semaphore::new(max_concurrent)),
    };

    Router::new()
        .route("/health", get(health))
        .route("/messages", post(ingest_message))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "mail-relay"
    }))
}

// ── Ingest ──────────────────────────────────────────────────────────────

async fn ingest_message(
    State(state): State<IngestState>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Ok(_permit) = Arc::clone(&state.permits).try_acquire_owned() else {
        warn!("Ingest at capacity, refusing message");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "relay at capacity, retry later" })),
        )
            .into_response();
    };

    let envelope = Envelope {
        from: header_str(&headers, ENVELOPE_FROM_HEADER),
        to: header_str(&headers, ENVELOPE_TO_HEADER),
    };
    let inbound =
        InboundMessage::new(stream::from_fallible(body.into_data_stream())).with_envelope(envelope);

    let report = state.orchestrator.relay(inbound).await;
    (status_for(&report), Json(report)).into_response()
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// HTTP status answering the host for a finished relay.
pub fn status_for(report: &RelayReport) -> StatusCode {
    match report.state {
        RelayStage::Completed => StatusCode::OK,
        RelayStage::PartiallyFailed | RelayStage::DeliveryFailed => StatusCode::BAD_GATEWAY,
        _ => match &report.error {
            Some(RelayError::Decode(DecodeError::TooLarge { .. })) => StatusCode::PAYLOAD_TOO_LARGE,
            Some(RelayError::Decode(_)) => StatusCode::BAD_REQUEST,
            Some(RelayError::Structure(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}
