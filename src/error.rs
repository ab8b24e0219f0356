//! Error types for the relay.

use std::time::Duration;

use serde::Serialize;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// The inbound byte stream could not be fully read or decoded.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("Stream read failed after {offset} bytes: {reason}")]
    Read { offset: usize, reason: String },

    #[error("Stream read timed out after {offset} bytes (waited {timeout:?})")]
    Timeout { offset: usize, timeout: Duration },

    #[error("Message exceeds the {limit} byte limit")]
    TooLarge { limit: usize },

    #[error("Malformed UTF-8 at byte offset {offset}")]
    Malformed { offset: usize },
}

/// The structural MIME parse failed.
///
/// Parser internals never escape; callers only see these categories.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StructureError {
    #[error("Parser {parser} could not parse message: {reason}")]
    Unparseable { parser: String, reason: String },

    #[error("Parser {parser} panicked")]
    ParserPanicked { parser: String },

    #[error("Failed to serialize structured artifact: {0}")]
    Serialize(String),

    #[error("Failed to buffer input: {0}")]
    Input(#[from] DecodeError),
}

/// A single webhook POST did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryError {
    /// The destination could not be reached.
    #[error("Destination unreachable: {reason}")]
    Transport { reason: String, timed_out: bool },

    /// The destination answered with a non-2xx status.
    #[error("Destination rejected delivery with HTTP {status}")]
    Rejected { status: u16 },
}

impl DeliveryError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Rejected { status } => *status == 429 || *status >= 500,
        }
    }
}

/// A failure that aborts the relay before anything can be forwarded.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Structure failed: {0}")]
    Structure(#[from] StructureError),
}

impl RelayError {
    /// Stable category label, used in reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Structure(_) => "structure",
        }
    }
}

impl Serialize for RelayError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut s = serializer.serialize_struct("RelayError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_server_errors_are_retryable() {
        let transport = DeliveryError::Transport {
            reason: "connection refused".into(),
            timed_out: false,
        };
        assert!(transport.is_retryable());
        assert!(DeliveryError::Rejected { status: 503 }.is_retryable());
        assert!(DeliveryError::Rejected { status: 429 }.is_retryable());
        assert!(!DeliveryError::Rejected { status: 400 }.is_retryable());
        assert!(!DeliveryError::Rejected { status: 404 }.is_retryable());
    }

    #[test]
    fn delivery_error_serializes_with_kind_tag() {
        let json = serde_json::to_value(DeliveryError::Rejected { status: 500 }).unwrap();
        assert_eq!(json["kind"], "rejected");
        assert_eq!(json["status"], 500);

        let json = serde_json::to_value(DeliveryError::Transport {
            reason: "dns".into(),
            timed_out: true,
        })
        .unwrap();
        assert_eq!(json["kind"], "transport");
        assert_eq!(json["timed_out"], true);
    }

    #[test]
    fn relay_error_serializes_kind_and_message() {
        let err = RelayError::from(DecodeError::TooLarge { limit: 10 });
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "decode");
        assert_eq!(json["message"], "Decode failed: Message exceeds the 10 byte limit");
    }

    #[test]
    fn structure_error_serializes_as_structure_kind() {
        let err = RelayError::from(StructureError::ParserPanicked {
            parser: "mail-parser".into(),
        });
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "structure");
        assert_eq!(json["message"], "Structure failed: Parser mail-parser panicked");
    }
}
