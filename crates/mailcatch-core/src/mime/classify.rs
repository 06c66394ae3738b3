//! Attachment classification
//!
//! A part is an attachment when the first matching entry of [`CLASSIFIERS`]
//! accepts it. The order is significant and each predicate can be tested on
//! its own.

/// What the classifiers see of a part
#[derive(Debug, Clone, Copy)]
pub struct PartInfo<'a> {
    /// Lowercased `type/subtype`
    pub media_type: &'a str,
    /// Lowercased disposition type, if the part declared one
    pub disposition: Option<&'a str>,
    /// Filename from the disposition or the Content-Type `name` parameter
    pub filename: Option<&'a str>,
}

/// One attachment predicate
#[derive(Debug)]
pub struct Classifier {
    pub name: &'static str,
    pub matches: fn(&PartInfo<'_>) -> bool,
    /// Filename used when the part carries none
    pub default_filename: Option<&'static str>,
}

/// Attachment predicates in priority order
pub const CLASSIFIERS: &[Classifier] = &[
    Classifier {
        name: "declared",
        matches: is_declared_attachment,
        default_filename: None,
    },
    Classifier {
        name: "application",
        matches: is_application,
        default_filename: None,
    },
    Classifier {
        name: "image",
        matches: is_image,
        default_filename: None,
    },
    Classifier {
        name: "forwarded",
        matches: is_forwarded_message,
        default_filename: Some("forwarded_email.eml"),
    },
];

/// `Content-Disposition: attachment` with a filename
pub fn is_declared_attachment(part: &PartInfo<'_>) -> bool {
    part.disposition == Some("attachment") && part.filename.is_some()
}

/// Any `application/*` except `application/text`
pub fn is_application(part: &PartInfo<'_>) -> bool {
    part.media_type.starts_with("application/") && part.media_type != "application/text"
}

pub fn is_image(part: &PartInfo<'_>) -> bool {
    part.media_type.starts_with("image/")
}

/// A nested forwarded message
pub fn is_forwarded_message(part: &PartInfo<'_>) -> bool {
    part.media_type == "message/rfc822"
}

/// First classifier accepting the part
pub fn classify(part: &PartInfo<'_>) -> Option<&'static Classifier> {
    CLASSIFIERS.iter().find(|c| (c.matches)(part))
}

/// File extension for a media type, `.bin` when unknown
pub fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "application/pdf" => ".pdf",
        "application/msword" => ".doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => ".docx",
        "application/vnd.ms-excel" => ".xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => ".xlsx",
        "application/zip" => ".zip",
        "application/x-rar-compressed" => ".rar",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "text/plain" => ".txt",
        "text/html" => ".html",
        "message/rfc822" => ".eml",
        _ => ".bin",
    }
}

/// Name for the `index`-th attachment (1-based) when the part has none
pub fn generated_filename(index: usize, media_type: &str) -> String {
    format!("attachment_{}{}", index, extension_for(media_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part<'a>(
        media_type: &'a str,
        disposition: Option<&'a str>,
        filename: Option<&'a str>,
    ) -> PartInfo<'a> {
        PartInfo {
            media_type,
            disposition,
            filename,
        }
    }

    #[test]
    fn test_declared_attachment_needs_filename() {
        assert!(is_declared_attachment(&part(
            "text/plain",
            Some("attachment"),
            Some("notes.txt")
        )));
        assert!(!is_declared_attachment(&part("text/plain", Some("attachment"), None)));
        assert!(!is_declared_attachment(&part("text/plain", Some("inline"), Some("a.txt"))));
    }

    #[test]
    fn test_application_excludes_application_text() {
        assert!(is_application(&part("application/pdf", None, None)));
        assert!(!is_application(&part("application/text", None, None)));
        assert!(!is_application(&part("text/plain", None, None)));
    }

    #[test]
    fn test_priority_order() {
        let c = classify(&part("image/png", Some("attachment"), Some("a.png"))).unwrap();
        assert_eq!(c.name, "declared");

        let c = classify(&part("image/png", Some("inline"), None)).unwrap();
        assert_eq!(c.name, "image");

        let c = classify(&part("message/rfc822", None, None)).unwrap();
        assert_eq!(c.name, "forwarded");
        assert_eq!(c.default_filename, Some("forwarded_email.eml"));

        assert!(classify(&part("text/html", None, None)).is_none());
        assert!(classify(&part("text/plain", Some("inline"), Some("x.txt"))).is_none());
    }

    #[test]
    fn test_generated_filenames() {
        assert_eq!(generated_filename(1, "application/pdf"), "attachment_1.pdf");
        assert_eq!(generated_filename(2, "image/jpeg"), "attachment_2.jpg");
        assert_eq!(
            generated_filename(3, "application/x-unknown"),
            "attachment_3.bin"
        );
    }
}
