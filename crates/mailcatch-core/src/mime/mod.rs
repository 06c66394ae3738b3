//! MIME message parsing
//!
//! Turns the raw octets of a DATA transaction into an [`Email`]. Decoding
//! is done by `mail_parser`; this module decides what the capture service
//! keeps. Parsing favours availability: only a broken top-level header
//! block or a multipart declaration without a boundary is fatal.
//!
//! [`Email`]: mailcatch_common::types::Email

pub mod classify;
pub mod header;
pub mod parser;

pub use parser::parse_message;

use thiserror::Error;

/// Hard parse failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty message")]
    EmptyMessage,

    #[error("malformed header line: {line:?}")]
    MalformedHeader { line: String },

    #[error("multipart message without boundary")]
    MissingBoundary,

    #[error("message structure could not be read")]
    Unreadable,
}
