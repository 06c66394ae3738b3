//! Message processing: parse, route, dispatch

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use mailcatch_common::types::Envelope;
use tracing::{debug, info};

use crate::dispatch::Dispatcher;
use crate::mime::parse_message;
use crate::routing::RouteTable;
use crate::smtp::MessageHandler;

/// Runs every completed DATA transaction through the pipeline
pub struct MailProcessor {
    routes: RouteTable,
    dispatcher: Dispatcher,
}

impl MailProcessor {
    pub fn new(routes: RouteTable, dispatcher: Dispatcher) -> Self {
        Self { routes, dispatcher }
    }
}

#[async_trait]
impl MessageHandler for MailProcessor {
    /// Fails when the message cannot be parsed, or when every action of the
    /// matched rules failed. An unmatched message is dropped successfully.
    async fn handle_message(&self, envelope: &Envelope, raw: Vec<u8>) -> Result<()> {
        let email = parse_message(raw, envelope, Utc::now()).context("Failed to parse message")?;

        if email.has_no_text() {
            debug!("Message has no text part");
        }

        let rules = self.routes.matching(&email);
        if rules.is_empty() {
            info!(
                from = %email.from,
                to = ?email.to,
                subject = %email.subject,
                "No route matched, message dropped"
            );
            return Ok(());
        }

        let report = self.dispatcher.dispatch(&email, &rules).await;
        info!(
            rules = rules.len(),
            succeeded = report.succeeded,
            failed = report.failed,
            attachments = email.attachments.len(),
            "Message dispatched"
        );

        if report.all_failed() {
            return Err(anyhow!("all {} actions failed", report.failed));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{EmailPayload, MessageLayout, Sinks, WebhookSender};
    use crate::routing::WebhookTarget;
    use mailcatch_common::config::{ActionConfig, ActionKind, RouteCondition, RouteConfig};
    use mailcatch_storage::{FileStorage, LocalStorage};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct Unreachable;

    #[async_trait]
    impl WebhookSender for Unreachable {
        async fn send(&self, _target: &WebhookTarget, _payload: &EmailPayload) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
    }

    fn route(name: &str, recipient: &str, kinds: &[ActionKind]) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            condition: RouteCondition {
                recipient_pattern: Some(recipient.to_string()),
                ..RouteCondition::default()
            },
            actions: kinds
                .iter()
                .map(|kind| ActionConfig {
                    kind: *kind,
                    config: HashMap::from([("url".to_string(), "http://127.0.0.1:9".to_string())]),
                    enabled: true,
                })
                .collect(),
            enabled: true,
        }
    }

    fn processor(storage: Arc<LocalStorage>, routes: &[RouteConfig]) -> MailProcessor {
        let sinks = Sinks {
            local: Some(storage),
            s3: None,
            webhook: Arc::new(Unreachable),
        };
        MailProcessor::new(
            RouteTable::compile(routes).unwrap(),
            Dispatcher::new(sinks, ""),
        )
    }

    fn envelope() -> Envelope {
        Envelope {
            helo_domain: Some("client.test".into()),
            mail_from: Some("sender@example.com".into()),
            rcpt_to: vec!["capture@test.com".into()],
        }
    }

    const MESSAGE: &[u8] = b"From: sender@example.com\r\n\
To: capture@test.com\r\n\
Subject: Test\r\n\
Message-Id: <123@example.com>\r\n\
\r\n\
Body text\r\n";

    #[tokio::test]
    async fn test_stored_eml_is_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::from_path(dir.path()).unwrap());
        let processor = processor(
            storage.clone(),
            &[route("capture", "capture@.*", &[ActionKind::Webhook, ActionKind::StoreLocal])],
        );

        processor
            .handle_message(&envelope(), MESSAGE.to_vec())
            .await
            .unwrap();

        let mut stored = Vec::new();
        let mut pending = vec![dir.path().to_path_buf()];
        while let Some(path) = pending.pop() {
            for entry in std::fs::read_dir(path).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.extension().map_or(false, |e| e == "eml") {
                    stored.push(std::fs::read(path).unwrap());
                }
            }
        }
        assert_eq!(stored, vec![MESSAGE.to_vec()]);
    }

    #[tokio::test]
    async fn test_unmatched_message_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::from_path(dir.path()).unwrap());
        let processor = processor(
            storage,
            &[route("other", "^other@", &[ActionKind::StoreLocal])],
        );

        processor
            .handle_message(&envelope(), MESSAGE.to_vec())
            .await
            .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_all_actions_failing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::from_path(dir.path()).unwrap());
        let processor = processor(
            storage,
            &[route("hook", "capture@", &[ActionKind::Webhook])],
        );

        assert!(processor
            .handle_message(&envelope(), MESSAGE.to_vec())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unparseable_message_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalStorage::from_path(dir.path()).unwrap());
        let processor = processor(
            storage.clone(),
            &[route("capture", "capture@", &[ActionKind::StoreLocal])],
        );

        assert!(processor.handle_message(&envelope(), b"\r\n\r\n".to_vec()).await.is_err());

        let email = parse_message(MESSAGE.to_vec(), &envelope(), Utc::now()).unwrap();
        let layout = MessageLayout::new(&email, "default");
        assert!(!storage.exists(&layout.eml_path()).await.unwrap());
    }
}
