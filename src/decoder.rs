//! Incremental UTF-8 decoding of an inbound message stream.
//!
//! The stream is read once, chunk by chunk. An `encoding_rs` decoder carries
//! any partial multi-byte sequence from one chunk into the next, so chunk
//! boundaries never have to line up with character boundaries.

use std::str::FromStr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use encoding_rs::{CoderResult, Decoder, DecoderResult, UTF_8};
use futures::StreamExt;
use tracing::debug;

use crate::error::DecodeError;
use crate::stream::RawMessageStream;

/// What to do with invalid or truncated UTF-8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// Substitute U+FFFD for each malformed sequence.
    #[default]
    Replace,
    /// Fail with [`DecodeError::Malformed`].
    Strict,
}

impl FromStr for MalformedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "strict" => Ok(Self::Strict),
            other => Err(format!("expected 'replace' or 'strict', got '{other}'")),
        }
    }
}

/// Limits and policy applied while decoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderOptions {
    pub policy: MalformedPolicy,
    /// Upper bound on the wait for any single chunk.
    pub read_timeout: Option<Duration>,
    /// Upper bound on total message size.
    pub max_bytes: Option<usize>,
}

/// The decoded text of a message, together with the bytes it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextArtifact {
    text: String,
    source: Bytes,
    had_replacements: bool,
}

impl TextArtifact {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The original bytes, exactly as read from the stream.
    pub fn source(&self) -> &Bytes {
        &self.source
    }

    /// Size of the original message in bytes.
    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// True when no replacement characters were substituted.
    pub fn is_lossless(&self) -> bool {
        !self.had_replacements
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

/// Reads a [`RawMessageStream`] to completion and decodes it as UTF-8.
#[derive(Debug, Clone, Default)]
pub struct StreamDecoder {
    options: DecoderOptions,
}

impl StreamDecoder {
    pub fn new(options: DecoderOptions) -> Self {
        Self { options }
    }

    /// Consume `stream` and produce its [`TextArtifact`].
    ///
    /// The stream is owned by this call and dropped before it returns,
    /// whichever way it returns.
    pub async fn decode(&self, mut stream: RawMessageStream) -> Result<TextArtifact, DecodeError> {
        // No BOM sniffing: the text must stay faithful to the source bytes.
        let mut decoder = UTF_8.new_decoder_without_bom_handling();
        let mut text = String::new();
        let mut source = BytesMut::new();
        let mut had_replacements = false;
        let mut chunks = 0usize;

        loop {
            let next = match self.options.read_timeout {
                Some(timeout) => tokio::time::timeout(timeout, stream.next())
                    .await
                    .map_err(|_| DecodeError::Timeout {
                        offset: source.len(),
                        timeout,
                    })?,
                None => stream.next().await,
            };

            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| DecodeError::Read {
                offset: source.len(),
                reason: e.to_string(),
            })?;
            chunks += 1;

            if chunk.is_empty() {
                continue;
            }
            if let Some(limit) = self.options.max_bytes
                && source.len() + chunk.len() > limit
            {
                return Err(DecodeError::TooLarge { limit });
            }

            had_replacements |= self.feed(&mut decoder, &chunk, source.len(), false, &mut text)?;
            source.extend_from_slice(&chunk);
        }

        // Flush whatever partial sequence the decoder is still holding.
        had_replacements |= self.feed(&mut decoder, &[], source.len(), true, &mut text)?;

        debug!(
            bytes = source.len(),
            chunks,
            lossless = !had_replacements,
            "Message stream decoded"
        );

        Ok(TextArtifact {
            text,
            source: source.freeze(),
            had_replacements,
        })
    }

    /// Push one chunk through the decoder. `offset` is the stream position of
    /// the first byte of `chunk`. Returns whether replacements were made.
    fn feed(
        &self,
        decoder: &mut Decoder,
        chunk: &[u8],
        offset: usize,
        last: bool,
        text: &mut String,
    ) -> Result<bool, DecodeError> {
        reserve_for(decoder, chunk.len(), text);

        match self.options.policy {
            MalformedPolicy::Replace => {
                let mut remaining = chunk;
                let mut replaced = false;
                loop {
                    let (result, read, had_errors) =
                        decoder.decode_to_string(remaining, text, last);
                    replaced |= had_errors;
                    remaining = &remaining[read..];
                    match result {
                        CoderResult::InputEmpty => return Ok(replaced),
                        CoderResult::OutputFull => reserve_for(decoder, remaining.len(), text),
                    }
                }
            }
            MalformedPolicy::Strict => {
                let mut consumed = 0usize;
                loop {
                    let (result, read) = decoder
                        .decode_to_string_without_replacement(&chunk[consumed..], text, last);
                    consumed += read;
                    match result {
                        DecoderResult::InputEmpty => return Ok(false),
                        DecoderResult::OutputFull => {
                            reserve_for(decoder, chunk.len() - consumed, text)
                        }
                        DecoderResult::Malformed(bad, after) => {
                            // The bad sequence may have started in an earlier chunk.
                            let end = offset + consumed;
                            return Err(DecodeError::Malformed {
                                offset: end.saturating_sub(usize::from(bad) + usize::from(after)),
                            });
                        }
                    }
                }
            }
        }
    }
}

fn reserve_for(decoder: &Decoder, input_len: usize, text: &mut String) {
    // The bound only overflows for absurd lengths; fall back to a generous guess.
    let needed = decoder
        .max_utf8_buffer_length(input_len)
        .unwrap_or(input_len.saturating_mul(3))
        .max(4);
    text.reserve(needed);
}
