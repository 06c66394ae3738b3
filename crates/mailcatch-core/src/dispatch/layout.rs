//! Storage path layout
//!
//! Every object of a message lives under
//! `{folder}/{year}/{month}/{unique_id}/`. The layout is a pure function of
//! the message and the folder, so every sink writing the same message uses
//! the same keys.

use std::collections::HashSet;

use mailcatch_common::types::{Attachment, Email};
use sha2::{Digest, Sha256};

/// Placeholder used when a message has no Message-ID
pub const NO_MESSAGE_ID: &str = "no-id";

const MAX_ID_LEN: usize = 50;

/// Paths of one message inside one folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLayout {
    folder: String,
    year: String,
    month: String,
    unique_id: String,
    eml_filename: String,
    attachment_names: Vec<String>,
}

impl MessageLayout {
    pub fn new(email: &Email, folder: &str) -> Self {
        Self {
            folder: folder.trim_matches('/').to_string(),
            year: email.date.format("%Y").to_string(),
            month: email.date.format("%m").to_string(),
            unique_id: unique_id(email),
            eml_filename: eml_filename(email),
            attachment_names: stored_names(&email.attachments),
        }
    }

    /// `{year}/{month}/{unique_id}`, the part below the folder
    fn dated_directory(&self) -> String {
        format!("{}/{}/{}", self.year, self.month, self.unique_id)
    }

    pub fn directory(&self) -> String {
        format!("{}/{}", self.folder, self.dated_directory())
    }

    pub fn eml_path(&self) -> String {
        format!("{}/{}", self.directory(), self.eml_filename)
    }

    /// JSON sidecar, named after the `.eml`
    pub fn sidecar_path(&self) -> String {
        let stem = self
            .eml_filename
            .strip_suffix(".eml")
            .unwrap_or(&self.eml_filename);
        format!("{}/{}.json", self.directory(), stem)
    }

    /// Stored names of the message's attachments, in attachment order
    pub fn attachment_names(&self) -> &[String] {
        &self.attachment_names
    }

    /// Path of a stored attachment, `name` taken from [`attachment_names`]
    ///
    /// [`attachment_names`]: MessageLayout::attachment_names
    pub fn attachment_path(&self, name: &str) -> String {
        format!("{}/{}", self.directory(), name)
    }

    /// Public URL of a stored attachment.
    ///
    /// `folder_url` serves this folder directly; otherwise the folder is
    /// appended to `base_url`. An empty base yields the bare storage path.
    pub fn public_url(&self, folder_url: Option<&str>, base_url: &str, name: &str) -> String {
        let file = encode_url_segment(name);
        match folder_url {
            Some(url) => format!("{}/{}/{}", url, self.dated_directory(), file),
            None if base_url.is_empty() => format!("{}/{}", self.directory(), file),
            None => format!(
                "{}/{}/{}",
                base_url.trim_end_matches('/'),
                self.directory(),
                file
            ),
        }
    }
}

/// Microsecond receipt timestamp, suffixed with a Message-ID hash when present
pub fn unique_id(email: &Email) -> String {
    let stamp = email.received_at.format("%Y%m%d_%H%M%S%.6f").to_string();
    match &email.message_id {
        Some(id) => {
            let digest = hex::encode(Sha256::digest(id.as_bytes()));
            format!("{}_{}", stamp, &digest[..8])
        }
        None => stamp,
    }
}

/// `{second timestamp}_{sanitized message id}.eml`
pub fn eml_filename(email: &Email) -> String {
    let id = email
        .message_id
        .as_deref()
        .map(sanitize_message_id)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| NO_MESSAGE_ID.to_string());
    format!("{}_{}.eml", email.received_at.format("%Y%m%d_%H%M%S"), id)
}

/// Make a Message-ID safe for a file name, bounded to 50 characters
pub fn sanitize_message_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.trim().chars() {
        match c {
            '<' | '>' => {}
            '@' => out.push_str("_at_"),
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+' | '=') => out.push(c),
            _ => out.push('_'),
        }
    }
    out.chars().take(MAX_ID_LEN).collect()
}

/// Path-safe attachment names, unique within the message ignoring case.
/// Repeats get a counter before the extension: `image.png`, `image_2.png`.
pub fn stored_names(attachments: &[Attachment]) -> Vec<String> {
    let mut taken = HashSet::new();
    attachments
        .iter()
        .map(|att| {
            let name = sanitize_filename(&att.filename);
            let mut candidate = name.clone();
            let mut counter = 1;
            while !taken.insert(candidate.to_lowercase()) {
                counter += 1;
                candidate = numbered(&name, counter);
            }
            candidate
        })
        .collect()
}

fn numbered(name: &str, counter: usize) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &name[..dot], counter, &name[dot..]),
        _ => format!("{}_{}", name, counter),
    }
}

/// Make an attachment name usable as the last path segment
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.replace("..", "_");
    let cleaned = cleaned
        .trim_start_matches(|c: char| c == '.' || c.is_whitespace())
        .trim_end();

    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned.to_string()
    }
}

fn encode_url_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
