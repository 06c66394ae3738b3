//! Configuration for mailcatch
//!
//! The configuration is read once at startup and is immutable afterwards.
//! Files may be YAML or TOML (chosen by extension) and every key can be
//! overridden through `MAILCATCH__SECTION__KEY` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV: &str = "MAILCATCH_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// SMTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage backends
    #[serde(default)]
    pub storage: StorageConfig,

    /// Outbound webhook delivery
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Markdown rendering
    #[serde(default)]
    pub markdown: MarkdownConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Ordered routing rules
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname used in the greeting and EHLO reply
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Listening ports
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,

    /// Maximum accepted message size in bytes (advertised with SIZE)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Per-read idle timeout; no timeout when unset
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// How long in-flight sessions may run after shutdown is requested
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// TLS configuration
    #[serde(default)]
    pub tls: TlsConfig,

    /// Rate limiting (accepted for compatibility, not enforced)
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            bind_address: default_bind_address(),
            ports: default_ports(),
            max_message_size: default_max_message_size(),
            idle_timeout_secs: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
            tls: TlsConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_ports() -> Vec<u16> {
    vec![25]
}

fn default_max_message_size() -> usize {
    100 * 1024 * 1024
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Offer STARTTLS and serve implicit TLS ports
    #[serde(default)]
    pub enabled: bool,

    /// Path to certificate chain (PEM)
    pub cert_path: Option<PathBuf>,

    /// Path to private key (PEM)
    pub key_path: Option<PathBuf>,

    /// Ports that perform the TLS handshake before the greeting
    #[serde(default = "default_implicit_tls_ports")]
    pub implicit_tls_ports: Vec<u16>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: None,
            key_path: None,
            implicit_tls_ports: default_implicit_tls_ports(),
        }
    }
}

fn default_implicit_tls_ports() -> Vec<u16> {
    vec![465]
}

/// Rate limit configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub max_emails_per_minute: u32,
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local filesystem backend
    #[serde(default)]
    pub local: LocalStorageConfig,

    /// S3-compatible object storage backend
    #[serde(default)]
    pub s3: S3Config,
}

/// Local filesystem storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base directory for stored files
    #[serde(default = "default_storage_directory")]
    pub directory: PathBuf,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_storage_directory(),
        }
    }
}

fn default_storage_directory() -> PathBuf {
    PathBuf::from("./emails")
}

/// S3 configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub enabled: bool,

    /// Endpoint host, optionally with port (e.g. "s3.amazonaws.com", "minio:9000")
    #[serde(default)]
    pub endpoint: String,

    /// Bucket name
    #[serde(default)]
    pub bucket: String,

    /// Region used for request signing
    #[serde(default = "default_s3_region")]
    pub region: String,

    /// Access key ID
    #[serde(default)]
    pub access_key: String,

    /// Secret access key
    #[serde(default)]
    pub secret_key: String,

    /// Use https when talking to the endpoint
    #[serde(default = "default_true")]
    pub use_ssl: bool,

    /// Prefix prepended to every object key
    #[serde(default)]
    pub path_prefix: String,

    /// Gzip `.eml` and `.json` objects on upload
    #[serde(default = "default_true")]
    pub compress: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            bucket: String::new(),
            region: default_s3_region(),
            access_key: String::new(),
            secret_key: String::new(),
            use_ssl: true,
            path_prefix: String::new(),
            compress: true,
        }
    }
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

/// Webhook delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, doubled on each following retry
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_webhook_timeout(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_webhook_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_user_agent() -> String {
    format!("mailcatch/{}", env!("CARGO_PKG_VERSION"))
}

/// Markdown rendering configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkdownConfig {
    /// Base URL under which stored attachments are publicly reachable
    #[serde(default)]
    pub public_base_url: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// A named routing rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,

    #[serde(default)]
    pub condition: RouteCondition,

    #[serde(default)]
    pub actions: Vec<ActionConfig>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Regular expressions a message must satisfy; absent or empty means "any"
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteCondition {
    pub recipient_pattern: Option<String>,
    pub sender_pattern: Option<String>,
    pub subject_pattern: Option<String>,
}

/// Action kinds understood by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    StoreLocal,
    StoreS3,
    Webhook,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::StoreLocal => "store_local",
            ActionKind::StoreS3 => "store_s3",
            ActionKind::Webhook => "webhook",
        }
    }
}

/// One action of a route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(rename = "type")]
    pub kind: ActionKind,

    /// String-keyed options (folder, url, method, headers, secret, public_url)
    #[serde(default)]
    pub config: HashMap<String, String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ActionConfig {
    /// Look up a non-empty option value
    pub fn option(&self, key: &str) -> Option<&str> {
        self.config
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a file, applying environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let builder = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(
                ::config::Environment::with_prefix("MAILCATCH")
                    .separator("__")
                    .try_parsing(true),
            );

        Self::build(builder)
    }

    /// Parse configuration from an in-memory document
    pub fn parse(content: &str, format: ::config::FileFormat) -> Result<Self> {
        let builder =
            ::config::Config::builder().add_source(::config::File::from_str(content, format));
        Self::build(builder)
    }

    fn build(
        builder: ::config::ConfigBuilder<::config::builder::DefaultState>,
    ) -> Result<Self> {
        let mut config: Config = builder.build()?.try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an explicit path, `MAILCATCH_CONFIG`, or the
    /// default locations
    pub fn load(explicit: Option<PathBuf>) -> Result<Self> {
        if let Some(path) = explicit.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from)) {
            return Self::from_file(&path);
        }

        let paths = [
            PathBuf::from("./config.yaml"),
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/mailcatch/config.yaml"),
            PathBuf::from("/etc/mailcatch/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(Error::Config("No configuration file found".to_string()))
    }

    /// Check cross-field constraints and fill derived defaults
    pub fn validate(&mut self) -> Result<()> {
        if self.server.ports.is_empty() {
            return Err(Error::Validation("server.ports must not be empty".into()));
        }

        if self.server.hostname.trim().is_empty() {
            self.server.hostname = default_hostname();
        }

        let tls = &self.server.tls;
        if tls.enabled && (tls.cert_path.is_none() || tls.key_path.is_none()) {
            return Err(Error::Validation(
                "server.tls requires cert_path and key_path when enabled".into(),
            ));
        }

        let local = &self.storage.local;
        let s3 = &self.storage.s3;
        if !local.enabled && !s3.enabled {
            return Err(Error::Validation(
                "at least one storage backend must be enabled".into(),
            ));
        }
        if s3.enabled && (s3.endpoint.is_empty() || s3.bucket.is_empty()) {
            return Err(Error::Validation(
                "storage.s3 requires endpoint and bucket".into(),
            ));
        }
        if local.enabled && local.directory.as_os_str().is_empty() {
            return Err(Error::Validation("storage.local requires a directory".into()));
        }

        let mut names = HashSet::new();
        for route in &self.routes {
            if route.name.trim().is_empty() {
                return Err(Error::Validation("route name must not be empty".into()));
            }
            if !names.insert(route.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate route name: {}",
                    route.name
                )));
            }
            if route.actions.is_empty() {
                return Err(Error::Validation(format!(
                    "route {} has no actions",
                    route.name
                )));
            }

            for action in route.actions.iter().filter(|a| a.enabled) {
                match action.kind {
                    ActionKind::Webhook if action.option("url").is_none() => {
                        return Err(Error::Validation(format!(
                            "route {}: webhook action requires a url",
                            route.name
                        )));
                    }
                    ActionKind::StoreS3 if !s3.enabled => {
                        return Err(Error::Validation(format!(
                            "route {}: store_s3 action requires storage.s3 to be enabled",
                            route.name
                        )));
                    }
                    ActionKind::StoreLocal if !local.enabled => {
                        return Err(Error::Validation(format!(
                            "route {}: store_local action requires storage.local to be enabled",
                            route.name
                        )));
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }
}
