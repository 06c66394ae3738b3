//! Common types for mailcatch

use chrono::{DateTime, FixedOffset, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// SMTP envelope of the transaction in progress.
///
/// Owned by exactly one session. Resets replace the whole value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Domain given with HELO/EHLO
    pub helo_domain: Option<String>,
    /// Reverse path; `Some("")` for the null sender `<>`
    pub mail_from: Option<String>,
    /// Forward paths in arrival order, duplicates kept
    pub rcpt_to: Vec<String>,
}

impl Envelope {
    /// Envelope for a connection that has greeted but has no transaction
    pub fn greeted(domain: impl Into<String>) -> Self {
        Self {
            helo_domain: Some(domain.into()),
            ..Self::default()
        }
    }

    /// Drop the transaction but keep the greeting
    pub fn reset_transaction(&self) -> Self {
        Self {
            helo_domain: self.helo_domain.clone(),
            ..Self::default()
        }
    }
}

/// One header field with every value it was given
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderField {
    name: String,
    values: Vec<String>,
}

/// Message headers.
///
/// Keeps arrival order and the casing of the first occurrence of each name;
/// lookups ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<HeaderField>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `name`
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .fields
            .iter_mut()
            .find(|f| f.name.eq_ignore_ascii_case(&name))
        {
            Some(field) => field.values.push(value),
            None => self.fields.push(HeaderField {
                name,
                values: vec![value],
            }),
        }
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    /// All values for `name`, in arrival order
    pub fn get_all(&self, name: &str) -> &[String] {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.values.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        !self.get_all(name).is_empty()
    }

    /// Iterate `(name, values)` in arrival order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.fields
            .iter()
            .map(|f| (f.name.as_str(), f.values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for field in &self.fields {
            map.serialize_entry(&field.name, &field.values)?;
        }
        map.end()
    }
}

/// A decoded attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    /// Full Content-Type header value, parameters included
    pub content_type: String,
    /// Content-ID without angle brackets, for `cid:` references
    pub content_id: Option<String>,
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            content_id: None,
            content,
        }
    }

    pub fn with_content_id(mut self, content_id: &str) -> Self {
        let id = content_id.trim().trim_start_matches('<').trim_end_matches('>');
        self.content_id = (!id.is_empty()).then(|| id.to_string());
        self
    }

    /// Size in bytes, always the length of the content
    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// Media type without parameters, lowercased
    pub fn media_type(&self) -> String {
        self.content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }

    pub fn is_image(&self) -> bool {
        self.media_type().starts_with("image/")
    }
}

/// A parsed message. Built once per DATA transaction and never mutated.
#[derive(Debug, Clone)]
pub struct Email {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    /// Date header, or the receipt time when missing or unparseable
    pub date: DateTime<FixedOffset>,
    pub message_id: Option<String>,
    pub headers: Headers,
    pub body: String,
    pub html_body: String,
    pub attachments: Vec<Attachment>,
    /// Exact dot-unstuffed wire bytes
    pub raw: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl Email {
    /// True when neither a text/plain nor a text/html part was recognized
    pub fn has_no_text(&self) -> bool {
        self.body.is_empty() && self.html_body.is_empty()
    }
}
