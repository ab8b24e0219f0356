//! Structured (JSON) rendering of an inbound message.
//!
//! MIME grammar is delegated to a [`MimeParser`]; this module runs it off the
//! async executor, turns every way it can fail into a [`StructureError`], and
//! serializes the tree to canonical JSON.

pub mod artifact;
pub mod parser;

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

pub use artifact::{Attachment, BodyPart, HeaderValue, Mailbox, ParsedEmail};
pub use parser::{MailParserBackend, MimeParser, ParseFailure};

use crate::decoder::{StreamDecoder, TextArtifact};
use crate::error::StructureError;
use crate::stream::RawMessageStream;

/// A parsed message plus its JSON serialization.
#[derive(Debug, Clone)]
pub struct StructuredArtifact {
    email: ParsedEmail,
    json: String,
}

impl StructuredArtifact {
    pub fn email(&self) -> &ParsedEmail {
        &self.email
    }

    pub fn json(&self) -> &str {
        &self.json
    }

    pub fn into_json(self) -> String {
        self.json
    }
}

/// Produces [`StructuredArtifact`]s through a pluggable [`MimeParser`].
#[derive(Clone)]
pub struct MessageStructurer {
    parser: Arc<dyn MimeParser>,
}

impl Default for MessageStructurer {
    fn default() -> Self {
        Self::new(Arc::new(MailParserBackend))
    }
}

impl MessageStructurer {
    pub fn new(parser: Arc<dyn MimeParser>) -> Self {
        Self { parser }
    }

    /// Structure a message from its raw bytes.
    pub async fn structure(&self, source: Bytes) -> Result<StructuredArtifact, StructureError> {
        let parser = Arc::clone(&self.parser);
        let parser_name = parser.name().to_string();

        let parsed = tokio::task::spawn_blocking(move || parser.parse(&source))
            .await
            .map_err(|e| {
                if e.is_panic() {
                    StructureError::ParserPanicked {
                        parser: parser_name.clone(),
                    }
                } else {
                    StructureError::Unparseable {
                        parser: parser_name.clone(),
                        reason: "parser task was cancelled".into(),
                    }
                }
            })?;

        let email = parsed.map_err(|e| {
            warn!(parser = %parser_name, error = %e, "MIME parse failed");
            StructureError::Unparseable {
                parser: parser_name.clone(),
                reason: e.to_string(),
            }
        })?;

        let json =
            serde_json::to_string(&email).map_err(|e| StructureError::Serialize(e.to_string()))?;
        debug!(
            parser = %parser_name,
            json_bytes = json.len(),
            attachments = email.attachments.len(),
            "Message structured"
        );

        Ok(StructuredArtifact { email, json })
    }

    /// Structure a message that has already been decoded. The parser sees the
    /// original bytes, not the decoded text, so non-UTF-8 bodies survive.
    pub async fn structure_text(
        &self,
        text: &TextArtifact,
    ) -> Result<StructuredArtifact, StructureError> {
        self.structure(text.source().clone()).await
    }

    /// Consume `stream` once with `decoder`, then structure the result.
    pub async fn structure_stream(
        &self,
        decoder: &StreamDecoder,
        stream: RawMessageStream,
    ) -> Result<StructuredArtifact, StructureError> {
        let text = decoder.decode(stream).await?;
        self.structure_text(&text).await
    }
}
