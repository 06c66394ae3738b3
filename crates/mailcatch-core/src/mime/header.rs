//! Top-level header block checks
//!
//! `mail_parser` accepts nearly anything. These checks run first so that a
//! message whose header block is not a header block is rejected instead of
//! being captured as an empty shell.

use super::ParseError;

/// The header block of a message: everything before the first empty line,
/// or the whole input when there is none.
pub fn header_block(raw: &[u8]) -> &[u8] {
    let mut start = 0;
    while start < raw.len() {
        let end = raw[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(raw.len(), |p| start + p);
        let line = &raw[start..end];
        if line.is_empty() || line == b"\r" {
            return &raw[..start];
        }
        start = end + 1;
    }
    raw
}

/// Every line must be a `name: value` field or the continuation of one
pub fn check_header_block(block: &[u8]) -> Result<(), ParseError> {
    let text = String::from_utf8_lossy(block);
    let mut seen_field = false;

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        let valid = if line.starts_with(' ') || line.starts_with('\t') {
            seen_field
        } else {
            line.split_once(':').is_some_and(|(name, _)| is_field_name(name))
        };

        if !valid {
            return Err(ParseError::MalformedHeader {
                line: line.to_string(),
            });
        }
        seen_field = true;
    }

    Ok(())
}

/// Printable ASCII without spaces or colons; trailing whitespace before the
/// colon is tolerated
fn is_field_name(name: &str) -> bool {
    let name = name.trim_end();
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic() && b != b':')
}
