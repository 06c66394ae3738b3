//! Routing engine
//!
//! Route rules are compiled once at startup into a read-only [`RouteTable`]
//! shared by every session. Every matching rule fires, in configuration
//! order.

pub mod action;
pub mod engine;

pub use action::{Action, StoreTarget, WebhookTarget, DEFAULT_FOLDER};
pub use engine::{CompiledRule, Pattern, RouteTable};
