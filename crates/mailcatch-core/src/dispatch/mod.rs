//! Action dispatch
//!
//! Executes the actions of every matched rule. Each action is isolated: a
//! failing store or webhook is logged and counted, never propagated to its
//! siblings.

pub mod dispatcher;
pub mod layout;
pub mod payload;
pub mod webhook;

pub use dispatcher::{DispatchReport, Dispatcher, Sinks};
pub use layout::MessageLayout;
pub use payload::{AttachmentRecord, EmailPayload};
pub use webhook::{WebhookClient, WebhookSender};
