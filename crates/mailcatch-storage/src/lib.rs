//! mailcatch Storage - storage sinks
//!
//! Captured messages are written through the [`FileStorage`] trait, backed
//! either by the local filesystem or by an S3-compatible object store.

pub mod compress;
pub mod file;
pub mod s3;

pub use file::{FileStorage, LocalStorage};
pub use s3::ObjectStorage;
