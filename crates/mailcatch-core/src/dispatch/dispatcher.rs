//! Rule action execution

use std::sync::Arc;

use anyhow::{anyhow, Result};
use mailcatch_common::types::Email;
use mailcatch_storage::FileStorage;
use tracing::{debug, info, warn};

use super::layout::MessageLayout;
use super::payload::EmailPayload;
use super::webhook::WebhookSender;
use crate::markdown::{AttachmentLink, MarkdownRenderer};
use crate::routing::{Action, CompiledRule, StoreTarget, WebhookTarget, DEFAULT_FOLDER};

/// Sinks available to actions. A missing backend fails its actions.
#[derive(Clone)]
pub struct Sinks {
    pub local: Option<Arc<dyn FileStorage>>,
    pub s3: Option<Arc<dyn FileStorage>>,
    pub webhook: Arc<dyn WebhookSender>,
}

/// Outcome counts of one dispatch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed
    }

    /// True when actions ran and none of them succeeded
    pub fn all_failed(&self) -> bool {
        self.attempted() > 0 && self.succeeded == 0
    }
}

/// Executes the actions of matched rules
pub struct Dispatcher {
    sinks: Sinks,
    renderer: MarkdownRenderer,
    public_base_url: String,
}

impl Dispatcher {
    pub fn new(sinks: Sinks, public_base_url: impl Into<String>) -> Self {
        Self {
            sinks,
            renderer: MarkdownRenderer::new(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Run every action of every rule, in order. Failures are logged and
    /// counted; they never stop later actions.
    pub async fn dispatch(&self, email: &Email, rules: &[&CompiledRule]) -> DispatchReport {
        let mut report = DispatchReport::default();

        for rule in rules {
            for action in &rule.actions {
                let result = match action {
                    Action::StoreLocal(target) => {
                        self.store(self.sinks.local.as_deref(), target, email).await
                    }
                    Action::StoreS3(target) => {
                        self.store(self.sinks.s3.as_deref(), target, email).await
                    }
                    Action::Webhook(target) => self.notify(rule, target, email).await,
                };

                match result {
                    Ok(()) => {
                        report.succeeded += 1;
                        debug!(rule = %rule.name, action = action.kind().as_str(), "Action completed");
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            rule = %rule.name,
                            action = action.kind().as_str(),
                            error = %format!("{:#}", e),
                            "Action failed"
                        );
                    }
                }
            }
        }

        report
    }

    /// Write the raw message, its attachments and the JSON sidecar
    async fn store(
        &self,
        sink: Option<&dyn FileStorage>,
        target: &StoreTarget,
        email: &Email,
    ) -> Result<()> {
        let sink = sink.ok_or_else(|| anyhow!("storage backend is not enabled"))?;
        let layout = MessageLayout::new(email, &target.folder);

        let location = sink
            .store_document(&layout.eml_path(), &email.raw, "message/rfc822")
            .await?;

        for (attachment, name) in email.attachments.iter().zip(layout.attachment_names()) {
            let path = layout.attachment_path(name);
            if let Err(e) = sink
                .store_document(&path, &attachment.content, &attachment.content_type)
                .await
            {
                warn!(
                    backend = sink.backend(),
                    path = %path,
                    error_code = e.code(),
                    error = %e,
                    "Failed to store attachment"
                );
            }
        }

        let payload = self.payload(email, &layout, target.public_url.as_deref());
        let sidecar = serde_json::to_vec_pretty(&payload)?;
        sink.store_document(&layout.sidecar_path(), &sidecar, "application/json")
            .await?;

        info!(
            backend = sink.backend(),
            location = %location,
            attachments = email.attachments.len(),
            "Stored message"
        );
        Ok(())
    }

    async fn notify(&self, rule: &CompiledRule, target: &WebhookTarget, email: &Email) -> Result<()> {
        let (folder, public_url) = webhook_folder(rule, target);
        let layout = MessageLayout::new(email, folder);
        let payload = self.payload(email, &layout, public_url);
        self.sinks.webhook.send(target, &payload).await
    }

    fn payload(&self, email: &Email, layout: &MessageLayout, folder_url: Option<&str>) -> EmailPayload {
        let links: Vec<AttachmentLink> = layout
            .attachment_names()
            .iter()
            .map(|name| AttachmentLink {
                name: name.clone(),
                url: layout.public_url(folder_url, &self.public_base_url, name),
            })
            .collect();
        let markdown = self.renderer.render(email, &links);
        EmailPayload::build(email, layout, markdown)
    }
}

/// Folder a webhook payload points into: its own, else the first store
/// action of the rule, else the default folder.
fn webhook_folder<'a>(rule: &'a CompiledRule, target: &'a WebhookTarget) -> (&'a str, Option<&'a str>) {
    let stores = || rule.actions.iter().filter_map(Action::store_target);

    match target.folder.as_deref() {
        Some(folder) => {
            let public_url = stores()
                .find(|s| s.folder == folder)
                .and_then(|s| s.public_url.as_deref());
            (folder, public_url)
        }
        None => match stores().next() {
            Some(store) => (store.folder.as_str(), store.public_url.as_deref()),
            None => (DEFAULT_FOLDER, None),
        },
    }
}
