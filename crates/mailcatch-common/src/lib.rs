//! mailcatch Common - Shared types and configuration
//!
//! This crate provides the configuration model, the error type and the
//! message data model shared by the storage, core and server crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
