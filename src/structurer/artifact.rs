//! The structured form of an email: headers, mailboxes, body parts and
//! attachments. Serialized field names are camelCase and form a stable
//! schema for webhook consumers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A header field's value. Repeated fields (`Received`, for one) collect
/// into a list in order of appearance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multiple(Vec<String>),
}

impl HeaderValue {
    /// The first occurrence.
    pub fn first(&self) -> &str {
        match self {
            Self::Single(v) => v,
            Self::Multiple(vs) => vs.first().map(String::as_str).unwrap_or_default(),
        }
    }

    fn push(&mut self, value: String) {
        match self {
            Self::Single(existing) => {
                let first = std::mem::take(existing);
                *self = Self::Multiple(vec![first, value]);
            }
            Self::Multiple(vs) => vs.push(value),
        }
    }
}

/// A display name plus address, as found in From/To/Cc.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// One node of the MIME tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyPart {
    pub content_type: String,
    /// Decoded text for text parts; binary content lives in `attachments`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub size: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<BodyPart>,
}

/// A named binary blob carried by the message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    pub size: usize,
    /// Standard base64.
    pub content: String,
}

/// Parser output: the full structured tree of one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedEmail {
    /// Lower-cased field name → unfolded, trimmed value(s).
    pub headers: BTreeMap<String, HeaderValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Mailbox>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<Mailbox>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<Mailbox>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<Mailbox>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reply_to: Vec<Mailbox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    /// RFC 3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<BodyPart>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl ParsedEmail {
    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(HeaderValue::first)
    }

    /// Record one raw header occurrence.
    pub fn insert_header(&mut self, name: &str, raw_value: &str) {
        let key = name.trim().to_ascii_lowercase();
        if key.is_empty() {
            return;
        }
        let value = unfold(raw_value);
        match self.headers.get_mut(&key) {
            Some(existing) => existing.push(value),
            None => {
                self.headers.insert(key, HeaderValue::Single(value));
            }
        }
    }
}

/// Undo RFC 5322 folding: each line break plus its leading whitespace
/// collapses to one space, and the ends are trimmed.
pub fn unfold(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, line) in raw.split('\n').enumerate() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if i == 0 {
            out.push_str(line);
            continue;
        }
        let continuation = line.trim_start_matches([' ', '\t']);
        if continuation.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(continuation);
    }
    out.trim().to_string()
}

/// Extract mailboxes from an optional `mail_parser` address field.
///
/// Groups are flattened into their members.
pub fn extract_mailboxes(addr: Option<&mail_parser::Address>) -> Vec<Mailbox> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    let to_mailbox = |a: &mail_parser::Addr| Mailbox {
        name: a.name.as_ref().map(|s| s.to_string()),
        address: a.address.as_ref().map(|s| s.to_string()),
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs.iter().map(to_mailbox).collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().map(to_mailbox))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfold_joins_continuation_lines() {
        let raw = " by mx.example.com with ESMTPS;\r\n        Tue, 16 Jul 2024 06:32:06 -0700\r\n";
        assert_eq!(
            unfold(raw),
            "by mx.example.com with ESMTPS; Tue, 16 Jul 2024 06:32:06 -0700"
        );
    }

    #[test]
    fn unfold_plain_value_is_trimmed() {
        assert_eq!(unfold(" sender@example.com\r\n"), "sender@example.com");
        assert_eq!(unfold(""), "");
    }

    #[test]
    fn repeated_headers_become_a_list() {
        let mut email = ParsedEmail::default();
        email.insert_header("Received", " from a\r\n");
        email.insert_header("received", " from b\r\n");
        email.insert_header("RECEIVED", " from c\r\n");
        email.insert_header("Subject", " Hi\r\n");

        assert_eq!(
            email.headers["received"],
            HeaderValue::Multiple(vec!["from a".into(), "from b".into(), "from c".into()])
        );
        assert_eq!(email.header("Received"), Some("from a"));
        assert_eq!(email.header("subject"), Some("Hi"));
        assert_eq!(email.header("x-missing"), None);
    }

    #[test]
    fn header_values_serialize_as_string_or_array() {
        let mut email = ParsedEmail::default();
        email.insert_header("From", "sender@example.com");
        email.insert_header("Received", "one");
        email.insert_header("Received", "two");

        let json = serde_json::to_value(&email).unwrap();
        assert_eq!(json["headers"]["from"], "sender@example.com");
        assert_eq!(json["headers"]["received"], serde_json::json!(["one", "two"]));
        assert_eq!(json["attachments"], serde_json::json!([]));
        assert!(json.get("to").is_none());
    }

    #[test]
    fn parsed_email_deserializes_from_its_own_json() {
        let mut email = ParsedEmail {
            subject: Some("Re: plan".into()),
            reply_to: vec![Mailbox {
                name: Some("Alice".into()),
                address: Some("alice@example.com".into()),
            }],
            ..Default::default()
        };
        email.insert_header("Subject", "Re: plan");

        let json = serde_json::to_string(&email).unwrap();
        assert!(json.contains("\"replyTo\""));
        let back: ParsedEmail = serde_json::from_str(&json).unwrap();
        assert_eq!(back, email);
    }
}
