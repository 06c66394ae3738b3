//! mailcatch Core - SMTP capture pipeline
//!
//! This crate provides the capture pipeline for mailcatch: SMTP sessions and
//! listeners, MIME parsing, Markdown rendering, routing and action dispatch.

pub mod dispatch;
pub mod markdown;
pub mod mime;
pub mod processor;
pub mod routing;
pub mod smtp;

pub use dispatch::{Dispatcher, Sinks, WebhookClient};
pub use markdown::MarkdownRenderer;
pub use processor::MailProcessor;
pub use routing::RouteTable;
pub use smtp::{create_tls_acceptor, MessageHandler, SmtpServer};
