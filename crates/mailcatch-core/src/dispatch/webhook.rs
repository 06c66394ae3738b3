//! Webhook delivery

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use mailcatch_common::config::WebhookConfig;
use reqwest::Client;
use sha2::Sha256;
use tracing::{debug, warn};

use super::payload::EmailPayload;
use crate::routing::WebhookTarget;

type HmacSha256 = Hmac<Sha256>;

/// Signature header carrying `sha256={hex hmac of body}`
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Delivers payloads to webhook targets
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send(&self, target: &WebhookTarget, payload: &EmailPayload) -> Result<()>;
}

/// HTTP webhook client with bounded retries
#[derive(Debug, Clone)]
pub struct WebhookClient {
    http_client: Client,
    max_retries: u32,
    initial_backoff: Duration,
}

impl WebhookClient {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            http_client,
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
        })
    }

    async fn attempt(&self, target: &WebhookTarget, body: &[u8]) -> Result<()> {
        let mut request = self
            .http_client
            .request(target.method.clone(), &target.url)
            .header("Content-Type", "application/json");

        for (name, value) in &target.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        if let Some(ref secret) = target.secret {
            request = request.header(SIGNATURE_HEADER, sign(secret, body)?);
        }

        let response = request.body(body.to_vec()).send().await?;

        if !response.status().is_success() {
            return Err(anyhow!("Webhook returned status {}", response.status()));
        }

        Ok(())
    }

    fn backoff(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

#[async_trait]
impl WebhookSender for WebhookClient {
    async fn send(&self, target: &WebhookTarget, payload: &EmailPayload) -> Result<()> {
        let body = serde_json::to_vec(&payload.stamped())?;

        let mut retry = 0;
        loop {
            match self.attempt(target, &body).await {
                Ok(()) => {
                    debug!(url = %target.url, retries = retry, "Webhook delivered");
                    return Ok(());
                }
                Err(e) if retry < self.max_retries => {
                    retry += 1;
                    let delay = self.backoff(retry);
                    warn!(
                        url = %target.url,
                        error = %e,
                        retry = retry,
                        delay_ms = delay.as_millis() as u64,
                        "Webhook attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "webhook {} failed after {} attempts",
                        target.url,
                        retry + 1
                    )))
                }
            }
        }
    }
}

/// `sha256={hex}` HMAC of `body`
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("Invalid HMAC key: {}", e))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
