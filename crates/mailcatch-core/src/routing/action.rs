//! Typed route actions

use anyhow::{anyhow, Result};
use mailcatch_common::config::{ActionConfig, ActionKind};
use reqwest::Method;

/// Folder used when an action names none
pub const DEFAULT_FOLDER: &str = "default";

/// Where a store action writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTarget {
    pub folder: String,
    /// Public URL that serves this folder; overrides the global base URL
    pub public_url: Option<String>,
}

/// Where and how a webhook action delivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookTarget {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    /// HMAC-SHA256 key for the `X-Webhook-Signature` header
    pub secret: Option<String>,
    /// Folder used to compute storage paths in the payload
    pub folder: Option<String>,
}

/// A compiled route action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    StoreLocal(StoreTarget),
    StoreS3(StoreTarget),
    Webhook(WebhookTarget),
}

impl Action {
    pub fn from_config(config: &ActionConfig) -> Result<Self> {
        match config.kind {
            ActionKind::StoreLocal => Ok(Action::StoreLocal(StoreTarget::from_config(config))),
            ActionKind::StoreS3 => Ok(Action::StoreS3(StoreTarget::from_config(config))),
            ActionKind::Webhook => Ok(Action::Webhook(WebhookTarget::from_config(config)?)),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::StoreLocal(_) => ActionKind::StoreLocal,
            Action::StoreS3(_) => ActionKind::StoreS3,
            Action::Webhook(_) => ActionKind::Webhook,
        }
    }

    /// Store target, if this is a store action
    pub fn store_target(&self) -> Option<&StoreTarget> {
        match self {
            Action::StoreLocal(target) | Action::StoreS3(target) => Some(target),
            Action::Webhook(_) => None,
        }
    }
}

impl StoreTarget {
    fn from_config(config: &ActionConfig) -> Self {
        Self {
            folder: config.option("folder").unwrap_or(DEFAULT_FOLDER).to_string(),
            public_url: config
                .option("public_url")
                .map(|u| u.trim_end_matches('/').to_string()),
        }
    }
}

impl WebhookTarget {
    fn from_config(config: &ActionConfig) -> Result<Self> {
        let url = config
            .option("url")
            .ok_or_else(|| anyhow!("webhook action requires a url"))?
            .to_string();

        let method = match config.option("method") {
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| anyhow!("invalid webhook method: {}", m))?,
            None => Method::POST,
        };

        Ok(Self {
            url,
            method,
            headers: config.option("headers").map(parse_headers).unwrap_or_default(),
            secret: config.option("secret").map(str::to_string),
            folder: config.option("folder").map(str::to_string),
        })
    }
}

/// Parse `"Name: value, Other: value"` into header pairs
pub fn parse_headers(list: &str) -> Vec<(String, String)> {
    list.split(',')
        .filter_map(|pair| {
            let (name, value) = pair.split_once(':')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}
