//! Gzip for stored documents

use flate2::write::GzEncoder;
use flate2::Compression;
use mailcatch_common::{Error, Result};
use std::io::Write;

/// `Content-Encoding` of compressed objects
pub const GZIP: &str = "gzip";

/// Raw messages and JSON documents are compressed; attachments keep their
/// own encoding unless they are one of those types.
pub fn should_compress(path: &str, content_type: &str) -> bool {
    path.ends_with(".eml")
        || path.ends_with(".json")
        || content_type == "message/rfc822"
        || content_type == "application/json"
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| Error::Storage(format!("Failed to compress data: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Storage(format!("Failed to finish gzip stream: {}", e)))
}
