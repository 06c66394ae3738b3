//! Webhook and sidecar payload

use chrono::{DateTime, FixedOffset, Utc};
use mailcatch_common::types::{Email, Headers};
use serde::Serialize;

use super::layout::MessageLayout;

/// Attachment metadata; content is never inlined
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRecord {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    /// Storage path of the attachment within the folder layout
    pub s3_path: String,
}

/// JSON document posted to webhooks and written next to stored messages
#[derive(Debug, Clone, Serialize)]
pub struct EmailPayload {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub date: DateTime<FixedOffset>,
    /// Empty when the message carried no Message-ID
    pub message_id: String,
    pub body: String,
    pub html_body: String,
    pub markdown: String,
    pub headers: Headers,
    pub attachments: Vec<AttachmentRecord>,
    pub timestamp: DateTime<Utc>,
    pub eml_path: String,
}

impl EmailPayload {
    pub fn build(email: &Email, layout: &MessageLayout, markdown: String) -> Self {
        let attachments = email
            .attachments
            .iter()
            .zip(layout.attachment_names())
            .map(|(a, name)| AttachmentRecord {
                filename: name.clone(),
                content_type: a.content_type.clone(),
                size: a.size(),
                s3_path: layout.attachment_path(name),
            })
            .collect();

        Self {
            from: email.from.clone(),
            to: email.to.clone(),
            subject: email.subject.clone(),
            date: email.date,
            message_id: email.message_id.clone().unwrap_or_default(),
            body: email.body.clone(),
            html_body: email.html_body.clone(),
            markdown,
            headers: email.headers.clone(),
            attachments,
            timestamp: Utc::now(),
            eml_path: layout.eml_path(),
        }
    }

    /// Same payload, stamped with the current time
    pub fn stamped(&self) -> Self {
        Self {
            timestamp: Utc::now(),
            ..self.clone()
        }
    }
}
