//! The MIME parsing seam and its `mail-parser` backed implementation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use mail_parser::{Message, MessageParser, MessagePart, MimeHeaders, PartType};

use super::artifact::{Attachment, BodyPart, ParsedEmail, extract_mailboxes};

/// Nested `message/rfc822` parts deeper than this are not expanded.
const MAX_PART_DEPTH: usize = 32;

/// A parser's own description of why it gave up.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ParseFailure(pub String);

impl ParseFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Black-box MIME decomposition: raw message bytes in, structured tree out.
///
/// Implementations should be pure functions of their input. They run on a
/// blocking worker thread, so they may be CPU heavy.
pub trait MimeParser: Send + Sync {
    fn name(&self) -> &str;

    fn parse(&self, raw: &[u8]) -> Result<ParsedEmail, ParseFailure>;
}

/// [`MimeParser`] backed by the `mail-parser` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct MailParserBackend;

impl MimeParser for MailParserBackend {
    fn name(&self) -> &str {
        "mail-parser"
    }

    fn parse(&self, raw: &[u8]) -> Result<ParsedEmail, ParseFailure> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(ParseFailure::new("message is empty"));
        }

        let message = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| ParseFailure::new("no message structure found"))?;

        let mut email = ParsedEmail::default();
        for (name, value) in message.headers_raw() {
            email.insert_header(name, value);
        }

        email.from = extract_mailboxes(message.from()).into_iter().next();
        email.to = extract_mailboxes(message.to());
        email.cc = extract_mailboxes(message.cc());
        email.bcc = extract_mailboxes(message.bcc());
        email.reply_to = extract_mailboxes(message.reply_to());
        email.subject = message.subject().map(str::to_string);
        email.message_id = message.message_id().map(str::to_string);
        email.in_reply_to = email.header("in-reply-to").map(str::to_string);
        email.date = message.date().map(|d| d.to_rfc3339());
        email.text = message.body_text(0).map(|t| t.into_owned());
        email.html = message.body_html(0).map(|h| h.into_owned());
        email.parts = build_part(&message, 0, 0).into_iter().collect();
        email.attachments = message.attachments().map(to_attachment).collect();

        Ok(email)
    }
}

/// Build the tree rooted at part `index` of `message`.
fn build_part(message: &Message<'_>, index: usize, depth: usize) -> Option<BodyPart> {
    let part = message.parts.get(index)?;
    let mut node = BodyPart {
        content_type: content_type_of(part),
        content: None,
        size: part.contents().len(),
        parts: Vec::new(),
    };

    match &part.body {
        PartType::Text(text) | PartType::Html(text) => {
            node.content = Some(text.to_string());
        }
        PartType::Multipart(children) => {
            if depth < MAX_PART_DEPTH {
                node.parts = children
                    .iter()
                    .filter_map(|&child| build_part(message, child as usize, depth + 1))
                    .collect();
            }
        }
        PartType::Message(nested) => {
            if depth < MAX_PART_DEPTH {
                node.parts = build_part(nested, 0, depth + 1).into_iter().collect();
            }
        }
        PartType::Binary(_) | PartType::InlineBinary(_) => {}
    }

    Some(node)
}

fn content_type_of(part: &MessagePart<'_>) -> String {
    match part.content_type() {
        Some(ct) => match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub).to_ascii_lowercase(),
            None => ct.ctype().to_ascii_lowercase(),
        },
        None => "text/plain".to_string(),
    }
}

fn to_attachment(part: &MessagePart<'_>) -> Attachment {
    let contents = part.contents();
    Attachment {
        filename: part.attachment_name().map(str::to_string),
        mime_type: content_type_of(part),
        disposition: part
            .content_disposition()
            .map(|d| d.ctype().to_ascii_lowercase()),
        content_id: part.content_id().map(str::to_string),
        size: contents.len(),
        content: STANDARD.encode(contents),
    }
}
