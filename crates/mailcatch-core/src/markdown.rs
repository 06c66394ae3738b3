//! HTML to Markdown rendering
//!
//! A fixed set of tag rewrites, not an HTML parser. Anything outside the
//! supported subset is stripped and only its text survives.

use mailcatch_common::types::{Attachment, Email};
use regex::{Captures, Regex};

/// Stored name and public URL of one attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentLink {
    pub name: String,
    pub url: String,
}

/// Renders captured messages as Markdown documents
#[derive(Debug)]
pub struct MarkdownRenderer {
    comment: Regex,
    script_style: Regex,
    img: Regex,
    img_src: Regex,
    img_alt: Regex,
    heading: Regex,
    bold: Regex,
    italic: Regex,
    anchor: Regex,
    list: Regex,
    list_item_open: Regex,
    list_item_close: Regex,
    paragraph: Regex,
    line_break: Regex,
    div: Regex,
    any_tag: Regex,
    trailing_space: Regex,
    blank_lines: Regex,
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("markdown rewrite pattern is valid")
}

impl Default for MarkdownRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkdownRenderer {
    pub fn new() -> Self {
        Self {
            comment: compile(r"(?s)<!--.*?-->"),
            script_style: compile(r"(?is)<(script|style|head)\b[^>]*>.*?</(?:script|style|head)\s*>"),
            img: compile(r"(?is)<img\b[^>]*>"),
            img_src: compile(r#"(?is)\bsrc\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#),
            img_alt: compile(r#"(?is)\balt\s*=\s*(?:"([^"]*)"|'([^']*)')"#),
            heading: compile(r"(?is)<h([1-6])\b[^>]*>(.*?)</h[1-6]\s*>"),
            bold: compile(r"(?is)<(?:strong|b)(?:\s[^>]*)?>(.*?)</(?:strong|b)\s*>"),
            italic: compile(r"(?is)<(?:em|i)(?:\s[^>]*)?>(.*?)</(?:em|i)\s*>"),
            anchor: compile(
                r#"(?is)<a\s[^>]*?href\s*=\s*(?:"([^"]*)"|'([^']*)')[^>]*>(.*?)</a\s*>"#,
            ),
            list: compile(r"(?is)</?(?:ul|ol)(?:\s[^>]*)?>"),
            list_item_open: compile(r"(?is)<li(?:\s[^>]*)?>"),
            list_item_close: compile(r"(?is)</li\s*>"),
            paragraph: compile(r"(?is)</?p(?:\s[^>]*)?>"),
            line_break: compile(r"(?is)<br\s*/?>"),
            div: compile(r"(?is)</?div(?:\s[^>]*)?>"),
            any_tag: compile(r"(?s)<[^>]+>"),
            trailing_space: compile(r"[ \t]+\n"),
            blank_lines: compile(r"\n{3,}"),
        }
    }

    /// Render the whole document: header block, body, attachment list.
    ///
    /// `links` holds one entry per attachment, in attachment order.
    pub fn render(&self, email: &Email, links: &[AttachmentLink]) -> String {
        let mut doc = String::from("# Email\n\n");
        doc.push_str(&format!("**From:** {}\n", email.from));
        doc.push_str(&format!("**To:** {}\n", email.to.join(", ")));
        doc.push_str(&format!("**Subject:** {}\n", email.subject));
        doc.push_str(&format!(
            "**Date:** {}\n",
            email.date.format("%Y-%m-%d %H:%M:%S")
        ));
        if let Some(id) = &email.message_id {
            doc.push_str(&format!("**Message-ID:** {}\n", id));
        }
        doc.push_str("\n---\n\n");

        if !email.html_body.is_empty() {
            doc.push_str(&self.html_to_markdown(&email.html_body, &email.attachments, links));
        } else {
            doc.push_str(&email.body);
        }

        let listed: Vec<(&Attachment, &AttachmentLink)> = email
            .attachments
            .iter()
            .zip(links)
            .filter(|(a, _)| !a.is_image())
            .collect();
        if !listed.is_empty() {
            doc.push_str("\n\n## Attachments\n\n");
            for (att, link) in listed {
                doc.push_str(&format!(
                    "- [{}]({}) ({}, {})\n",
                    link.name,
                    link.url,
                    att.media_type(),
                    format_size(att.size())
                ));
            }
        }

        self.normalize(&doc)
    }

    /// Convert an HTML fragment using the supported tag subset
    pub fn html_to_markdown(
        &self,
        html: &str,
        attachments: &[Attachment],
        links: &[AttachmentLink],
    ) -> String {
        let text = self.comment.replace_all(html, "");
        let text = self.script_style.replace_all(&text, "");
        let text = self
            .img
            .replace_all(&text, |caps: &Captures<'_>| self.rewrite_image(&caps[0], attachments, links));

        let text = self.heading.replace_all(&text, |caps: &Captures<'_>| {
            let level = caps[1].parse::<usize>().unwrap_or(1);
            format!("\n{} {}\n", "#".repeat(level), caps[2].trim())
        });
        let text = self.bold.replace_all(&text, "**${1}**");
        let text = self.italic.replace_all(&text, "*${1}*");
        let text = self.anchor.replace_all(&text, |caps: &Captures<'_>| {
            let href = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            format!("[{}]({})", caps[3].trim(), href)
        });
        let text = self.list.replace_all(&text, "\n");
        let text = self.list_item_open.replace_all(&text, "\n- ");
        let text = self.list_item_close.replace_all(&text, "");
        let text = self.paragraph.replace_all(&text, "\n\n");
        let text = self.line_break.replace_all(&text, "\n");
        let text = self.div.replace_all(&text, "\n");
        let text = self.any_tag.replace_all(&text, "");

        self.normalize(&decode_entities(&text))
    }

    /// Inline image rewrite. Images referring to an image attachment point
    /// at its public URL; remote images are kept; everything else is dropped.
    fn rewrite_image(
        &self,
        tag: &str,
        attachments: &[Attachment],
        links: &[AttachmentLink],
    ) -> String {
        let Some(src) = self.img_src.captures(tag).and_then(|caps| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_string())
        }) else {
            return String::new();
        };

        let referenced = find_referenced_attachment(&src, attachments)
            .filter(|&i| attachments[i].is_image())
            .and_then(|i| links.get(i));
        if let Some(link) = referenced {
            return format!("![{}]({})", link.name, link.url);
        }

        let lower = src.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let alt = self
                .img_alt
                .captures(tag)
                .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
                .map(|m| m.as_str().trim().to_string())
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| "Image".to_string());
            return format!("![{}]({})", alt, src);
        }

        String::new()
    }

    /// Collapse blank-line runs and strip trailing whitespace per line
    fn normalize(&self, text: &str) -> String {
        let text = text.replace("\r\n", "\n");
        let text = self.trailing_space.replace_all(&text, "\n");
        let text = self.blank_lines.replace_all(&text, "\n\n");
        text.trim().to_string()
    }
}

/// Index of the attachment an image source refers to.
///
/// `cid:` references match the Content-ID, else a filename equal to the
/// whole id or to its part before `@`. Other sources match on their last
/// path segment.
fn find_referenced_attachment(src: &str, attachments: &[Attachment]) -> Option<usize> {
    let cid = src
        .get(..4)
        .filter(|scheme| scheme.eq_ignore_ascii_case("cid:"))
        .map(|_| src[4..].trim_matches(|c| c == '<' || c == '>'));

    if let Some(cid) = cid {
        if cid.is_empty() {
            return None;
        }
        let local = cid.split('@').next().unwrap_or(cid);
        return attachments
            .iter()
            .position(|att| att.content_id.as_deref() == Some(cid))
            .or_else(|| {
                attachments
                    .iter()
                    .position(|att| att.filename == cid || att.filename == local)
            });
    }

    let segment = src.rsplit('/').next().unwrap_or(src);
    attachments
        .iter()
        .position(|att| !att.filename.is_empty() && att.filename == segment)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Human-readable size in binary units with one decimal
pub fn format_size(bytes: usize) -> String {
    const UNIT: f64 = 1024.0;
    let size = bytes as f64;

    if size < UNIT {
        format!("{} B", bytes)
    } else if size < UNIT * UNIT {
        format!("{:.1} KB", size / UNIT)
    } else if size < UNIT * UNIT * UNIT {
        format!("{:.1} MB", size / (UNIT * UNIT))
    } else {
        format!("{:.1} GB", size / (UNIT * UNIT * UNIT))
    }
}
