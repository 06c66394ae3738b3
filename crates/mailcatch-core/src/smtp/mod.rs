//! SMTP server module

mod handler;
mod server;
mod session;
mod tls;

use async_trait::async_trait;
use mailcatch_common::types::Envelope;

pub use handler::{SessionContext, SmtpHandler};
pub use server::{BoundServer, SmtpServer};
pub use session::{DataOutcome, Reply, Session, SessionConfig, SessionState, Step};
pub use tls::{acceptor_from_resolver, create_tls_acceptor, StaticCertResolver};

/// Receives every completed DATA transaction.
///
/// An error turns into a 554 reply; the session stays open.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, envelope: &Envelope, raw: Vec<u8>) -> anyhow::Result<()>;
}
