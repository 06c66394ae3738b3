//! Message parser

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use mail_parser::{
    Addr, Address, ContentType, Header, HeaderName, HeaderValue, MessageParser, MessagePart,
    MimeHeaders, PartType,
};
use mailcatch_common::types::{Attachment, Email, Envelope, Headers};
use tracing::{debug, warn};

use super::classify::{classify, generated_filename, PartInfo};
use super::header::{check_header_block, header_block};
use super::ParseError;

/// Parse a captured message.
///
/// `envelope` supplies `from`/`to` when the headers carry none and
/// `received_at` replaces a missing or unparseable `Date`.
pub fn parse_message(
    raw: Vec<u8>,
    envelope: &Envelope,
    received_at: DateTime<Utc>,
) -> Result<Email, ParseError> {
    let parsed = read_message(&raw, envelope)?;

    Ok(Email {
        from: parsed.from,
        to: parsed.to,
        subject: parsed.subject,
        date: parsed.date.unwrap_or_else(|| received_at.into()),
        message_id: parsed.message_id,
        headers: parsed.headers,
        body: parsed.walker.body.unwrap_or_default(),
        html_body: parsed.walker.html_body.unwrap_or_default(),
        attachments: parsed.walker.attachments,
        raw,
        received_at,
    })
}

/// Everything taken from the message, owned so the raw bytes can move on
struct ParsedMessage {
    from: String,
    to: Vec<String>,
    subject: String,
    date: Option<DateTime<FixedOffset>>,
    message_id: Option<String>,
    headers: Headers,
    walker: PartWalker,
}

fn read_message(raw: &[u8], envelope: &Envelope) -> Result<ParsedMessage, ParseError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::EmptyMessage);
    }
    check_header_block(header_block(raw))?;

    let message = MessageParser::default()
        .parse(raw)
        .ok_or(ParseError::Unreadable)?;

    let root = message.parts.first().ok_or(ParseError::Unreadable)?;
    if let Some(ct) = root.content_type() {
        if ct.ctype().eq_ignore_ascii_case("multipart") && ct.attribute("boundary").is_none() {
            return Err(ParseError::MissingBoundary);
        }
    }

    let mut headers = Headers::new();
    for header in &root.headers {
        if let Some(name) = field_name(raw, header) {
            headers.append(name, header_text(raw, header));
        }
    }

    let from = message
        .from()
        .and_then(|address| addrs(address).into_iter().find_map(Addr::address))
        .map(str::to_string)
        .unwrap_or_else(|| envelope.mail_from.clone().unwrap_or_default());

    let header_to: Vec<String> = root
        .headers
        .iter()
        .filter(|h| matches!(h.name, HeaderName::To))
        .filter_map(|h| match &h.value {
            HeaderValue::Address(address) => Some(address),
            _ => None,
        })
        .flat_map(addrs)
        .filter_map(|a| a.address().map(str::to_string))
        .collect();
    let to = if header_to.is_empty() {
        envelope.rcpt_to.clone()
    } else {
        header_to
    };

    let subject = message.subject().unwrap_or_default().trim().to_string();

    let date = message.date().and_then(|d| {
        let converted = to_chrono(d);
        if converted.is_none() {
            debug!(date = ?headers.get("Date"), "Unparseable Date header");
        }
        converted
    });

    let message_id = headers
        .get("Message-ID")
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let mut walker = PartWalker::default();
    for part in &message.parts {
        walker.visit(raw, part);
    }

    Ok(ParsedMessage {
        from,
        to,
        subject,
        date,
        message_id,
        headers,
        walker,
    })
}

/// Accumulates text bodies and attachments over the flattened part list
#[derive(Default)]
struct PartWalker {
    body: Option<String>,
    html_body: Option<String>,
    attachments: Vec<Attachment>,
}

impl PartWalker {
    fn visit(&mut self, raw: &[u8], part: &MessagePart<'_>) {
        if let PartType::Multipart(_) = part.body {
            return;
        }

        let media_type = part
            .content_type()
            .and_then(media_type_of)
            .unwrap_or_else(|| "text/plain".to_string());

        if media_type.starts_with("multipart/") {
            warn!(media_type = %media_type, "Nested multipart without boundary, skipping");
            return;
        }

        let disposition = part
            .content_disposition()
            .map(|d| d.ctype().to_ascii_lowercase());
        let filename = part
            .attachment_name()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string);

        let info = PartInfo {
            media_type: &media_type,
            disposition: disposition.as_deref(),
            filename: filename.as_deref(),
        };

        if let Some(classifier) = classify(&info) {
            let content = part.contents().to_vec();
            let name = filename
                .or_else(|| classifier.default_filename.map(str::to_string))
                .unwrap_or_else(|| generated_filename(self.attachments.len() + 1, &media_type));
            let content_type = part
                .headers
                .iter()
                .find(|h| matches!(h.name, HeaderName::ContentType))
                .map(|h| raw_value(raw, h))
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| media_type.clone());

            debug!(
                filename = %name,
                content_type = %content_type,
                size = content.len(),
                rule = classifier.name,
                "Found attachment"
            );

            let mut attachment = Attachment::new(name, content_type, content);
            if let Some(id) = part.content_id() {
                attachment = attachment.with_content_id(id);
            }
            self.attachments.push(attachment);
            return;
        }

        match media_type.as_str() {
            "text/plain" => {
                if self.body.is_some() {
                    debug!("Replacing earlier text/plain part");
                }
                self.body = Some(part_text(part));
            }
            "text/html" => {
                if self.html_body.is_some() {
                    debug!("Replacing earlier text/html part");
                }
                self.html_body = Some(part_text(part));
            }
            other => debug!(media_type = %other, "Ignoring non-text inline part"),
        }
    }
}

/// Lowercased `type/subtype`; `None` for a malformed type
fn media_type_of(ct: &ContentType<'_>) -> Option<String> {
    let subtype = ct.subtype()?;
    Some(format!("{}/{}", ct.ctype(), subtype).to_ascii_lowercase())
}

/// Decoded text of a part, charset already applied
fn part_text(part: &MessagePart<'_>) -> String {
    match &part.body {
        PartType::Text(text) | PartType::Html(text) => text.to_string(),
        _ => String::from_utf8_lossy(part.contents()).into_owned(),
    }
}

/// Every mailbox of an address header, group members included
fn addrs<'a, 'x>(address: &'a Address<'x>) -> Vec<&'a Addr<'x>> {
    match address {
        Address::List(list) => list.iter().collect(),
        Address::Group(groups) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
    }
}

/// Field name as written on the wire
fn field_name<'a>(raw: &'a [u8], header: &Header<'_>) -> Option<&'a str> {
    let bytes = raw.get(header.offset_field..header.offset_start)?;
    let name = std::str::from_utf8(bytes).ok()?;
    let name = name.trim().trim_end_matches(':').trim_end();
    (!name.is_empty()).then_some(name)
}

/// Unfolded raw value of a header
fn raw_value(raw: &[u8], header: &Header<'_>) -> String {
    let Some(bytes) = raw.get(header.offset_start..header.offset_end) else {
        return String::new();
    };
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Header value for the header map. Values with encoded words take the
/// decoded form; everything else keeps the wire text, so structured values
/// such as `<id@host>` survive unchanged.
fn header_text(raw: &[u8], header: &Header<'_>) -> String {
    let wire = raw_value(raw, header);
    if !wire.contains("=?") {
        return wire;
    }

    match &header.value {
        HeaderValue::Text(text) => text.trim().to_string(),
        HeaderValue::TextList(list) => list.join(", "),
        HeaderValue::Address(address) => addrs(address)
            .into_iter()
            .map(|a| match (a.name(), a.address()) {
                (Some(name), Some(email)) => format!("{} <{}>", name, email),
                (None, Some(email)) => email.to_string(),
                (Some(name), None) => name.to_string(),
                (None, None) => String::new(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        _ => wire,
    }
}

fn to_chrono(date: &mail_parser::DateTime) -> Option<DateTime<FixedOffset>> {
    let offset_secs = (date.tz_hour as i32 * 3600) + (date.tz_minute as i32 * 60);
    let offset = if date.tz_before_gmt {
        FixedOffset::west_opt(offset_secs)
    } else {
        FixedOffset::east_opt(offset_secs)
    }?;

    let naive = NaiveDate::from_ymd_opt(date.year as i32, date.month as u32, date.day as u32)?
        .and_hms_opt(date.hour as u32, date.minute as u32, date.second as u32)?;
    offset.from_local_datetime(&naive).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use pretty_assertions::assert_eq;

    fn envelope() -> Envelope {
        Envelope {
            helo_domain: Some("client.test".into()),
            mail_from: Some("bounce@envelope.test".into()),
            rcpt_to: vec!["rcpt@envelope.test".into()],
        }
    }

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap()
    }

    fn parse(raw: &str) -> Result<Email, ParseError> {
        parse_message(raw.as_bytes().to_vec(), &envelope(), received())
    }

    fn text(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).trim_end().to_string()
    }

    #[test]
    fn test_simple_message() {
        let email = parse(
            "From: sender@example.com\nTo: r@example.com\nSubject: Test\n\
             Date: Mon, 02 Jan 2006 15:04:05 -0700\nMessage-Id: <123@example.com>\n\nBody text",
        )
        .unwrap();

        assert_eq!(email.from, "sender@example.com");
        assert_eq!(email.to, vec!["r@example.com"]);
        assert_eq!(email.subject, "Test");
        assert_eq!(email.message_id.as_deref(), Some("<123@example.com>"));
        assert!(email.body.contains("Body text"));
        assert!(email.html_body.is_empty());
        assert!(email.attachments.is_empty());
        assert_eq!(email.date.year(), 2006);
        assert_eq!(email.date.hour(), 15);
        assert_eq!(email.date.offset().local_minus_utc(), -7 * 3600);
    }

    #[test]
    fn test_header_names_keep_wire_casing() {
        let email = parse("Message-Id: <a@b>\r\nX-Custom-TAG: one\r\n\r\nhi").unwrap();
        let names: Vec<&str> = email.headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Message-Id", "X-Custom-TAG"]);
        assert_eq!(email.headers.get("message-id"), Some("<a@b>"));
    }

    #[test]
    fn test_raw_bytes_preserved() {
        let raw = "Subject: x\r\n\r\nline one\r\n.leading dot kept\r\n";
        let email = parse(raw).unwrap();
        assert_eq!(email.raw, raw.as_bytes());
    }

    #[test]
    fn test_multipart_with_attachment() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "To: b@example.com\r\n",
            "Subject: With attachment\r\n",
            "Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n",
            "\r\n",
            "preamble\r\n",
            "--XYZ\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "Hello there\r\n",
            "--XYZ\r\n",
            "Content-Type: text/plain\r\n",
            "Content-Disposition: attachment; filename=\"test.txt\"\r\n",
            "\r\n",
            "file contents\r\n",
            "--XYZ--\r\n",
            "epilogue\r\n",
        );

        let email = parse(raw).unwrap();
        assert_eq!(email.body.trim_end(), "Hello there");
        assert_eq!(email.attachments.len(), 1);

        let att = &email.attachments[0];
        assert_eq!(att.filename, "test.txt");
        assert_eq!(text(&att.content), "file contents");
        assert_eq!(att.size(), att.content.len());
        assert_eq!(att.content_type, "text/plain");
    }

    #[test]
    fn test_nested_alternative_and_generated_names() {
        let raw = concat!(
            "Subject: nested\r\n",
            "Content-Type: multipart/mixed; boundary=outer\r\n",
            "\r\n",
            "--outer\r\n",
            "Content-Type: multipart/alternative; boundary=inner\r\n",
            "\r\n",
            "--inner\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "Content-Transfer-Encoding: quoted-printable\r\n",
            "\r\n",
            "caf=C3=A9\r\n",
            "--inner\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>caf&eacute;</p>\r\n",
            "--inner--\r\n",
            "--outer\r\n",
            "Content-Type: application/pdf\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "JVBERi0x\r\n",
            "--outer\r\n",
            "Content-Type: image/png\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "Content-ID: <logo@mail.test>\r\n",
            "\r\n",
            "iVBORw==\r\n",
            "--outer--\r\n",
        );

        let email = parse(raw).unwrap();
        assert_eq!(email.body.trim_end(), "café");
        assert_eq!(email.html_body.trim_end(), "<p>caf&eacute;</p>");

        let names: Vec<&str> = email.attachments.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, vec!["attachment_1.pdf", "attachment_2.png"]);
        assert_eq!(email.attachments[0].content, b"%PDF-1");
        assert_eq!(email.attachments[1].content, [0x89, b'P', b'N', b'G']);
        assert_eq!(email.attachments[1].content_id.as_deref(), Some("logo@mail.test"));
    }

    #[test]
    fn test_forwarded_message_part() {
        let raw = concat!(
            "Content-Type: multipart/mixed; boundary=b\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "see below\r\n",
            "--b\r\n",
            "Content-Type: message/rfc822\r\n",
            "\r\n",
            "Subject: inner\r\n\r\ninner body\r\n",
            "--b--\r\n",
        );

        let email = parse(raw).unwrap();
        assert_eq!(email.body.trim_end(), "see below");
        assert_eq!(email.attachments.len(), 1);
        assert_eq!(email.attachments[0].filename, "forwarded_email.eml");
        assert!(email.attachments[0].content.starts_with(b"Subject: inner\r\n\r\ninner body"));
    }

    #[test]
    fn test_last_text_part_wins() {
        let raw = concat!(
            "Content-Type: multipart/mixed; boundary=b\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n\r\nfirst\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n\r\nsecond\r\n",
            "--b--\r\n",
        );
        assert_eq!(parse(raw).unwrap().body.trim_end(), "second");
    }

    #[test]
    fn test_multipart_without_boundary_fails() {
        let raw = "Content-Type: multipart/mixed\r\n\r\nbody\r\n";
        assert_eq!(parse(raw).unwrap_err(), ParseError::MissingBoundary);
    }

    #[test]
    fn test_nested_multipart_without_boundary_is_skipped() {
        let raw = concat!(
            "Content-Type: multipart/mixed; boundary=b\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: multipart/alternative\r\n\r\nlost\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n\r\nkept\r\n",
            "--b--\r\n",
        );
        let email = parse(raw).unwrap();
        assert_eq!(email.body.trim_end(), "kept");
        assert!(email.attachments.is_empty());
    }

    #[test]
    fn test_hard_failures() {
        assert_eq!(parse("").unwrap_err(), ParseError::EmptyMessage);
        assert_eq!(parse(" \r\n").unwrap_err(), ParseError::EmptyMessage);
        assert!(matches!(
            parse("not a header line\r\n\r\nbody"),
            Err(ParseError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_bad_date_falls_back_to_receipt_time() {
        let email = parse("Date: yesterday-ish\r\nSubject: x\r\n\r\nhi").unwrap();
        assert_eq!(email.date, received());

        let email = parse("Subject: x\r\n\r\nhi").unwrap();
        assert_eq!(email.date, received());
    }

    #[test]
    fn test_date_with_comment() {
        let email = parse("Date: Tue, 1 Jul 2003 10:52:37 +0200 (CEST)\r\n\r\nhi").unwrap();
        assert_eq!(email.date.month(), 7);
        assert_eq!(email.date.offset().local_minus_utc(), 2 * 3600);
    }

    #[test]
    fn test_envelope_fallback() {
        let email = parse("Subject: no addresses\r\n\r\nhi").unwrap();
        assert_eq!(email.from, "bounce@envelope.test");
        assert_eq!(email.to, vec!["rcpt@envelope.test"]);

        let email = parse("To: undisclosed-recipients:;\r\n\r\nhi").unwrap();
        assert_eq!(email.to, vec!["rcpt@envelope.test"]);
    }

    #[test]
    fn test_address_list() {
        let email = parse(
            "From: \"Sender, Team\" <team@example.com>\r\n\
             To: \"Doe, Jane\" <jane@example.com>, bob@example.com\r\nTo: <c@example.com>\r\n\r\nhi",
        )
        .unwrap();
        assert_eq!(email.from, "team@example.com");
        assert_eq!(
            email.to,
            vec!["jane@example.com", "bob@example.com", "c@example.com"]
        );
    }

    #[test]
    fn test_encoded_headers() {
        let email = parse(
            "Subject: =?windows-1252?Q?Price_=80100?=\r\nX-Note: =?UTF-8?B?VGVzdA==?=\r\n\r\nhi",
        )
        .unwrap();
        assert_eq!(email.subject, "Price €100");
        assert_eq!(email.headers.get("Subject"), Some("Price €100"));
        assert_eq!(email.headers.get("x-note"), Some("Test"));
    }

    #[test]
    fn test_body_charset() {
        let email = parse(
            "Content-Type: text/plain; charset=windows-1252\r\n\
             Content-Transfer-Encoding: quoted-printable\r\n\r\n=80 5 =96 caf=E9",
        )
        .unwrap();
        assert_eq!(email.body.trim_end(), "€ 5 – café");
    }

    #[test]
    fn test_rfc2231_filename() {
        let raw = concat!(
            "Content-Type: multipart/mixed; boundary=b\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: application/pdf\r\n",
            "Content-Disposition: attachment; filename*=UTF-8''r%C3%A9sum%C3%A9.pdf\r\n",
            "\r\n",
            "%PDF\r\n",
            "--b--\r\n",
        );
        let email = parse(raw).unwrap();
        assert_eq!(email.attachments[0].filename, "résumé.pdf");
    }

    #[test]
    fn test_malformed_content_type_is_text() {
        let email = parse("Content-Type: nonsense\r\n\r\nplain body").unwrap();
        assert_eq!(email.body, "plain body");
        assert!(email.attachments.is_empty());
    }

    #[test]
    fn test_single_part_attachment() {
        let email = parse(
            "Content-Type: application/zip; name=\"bundle.zip\"\r\n\
             Content-Transfer-Encoding: base64\r\n\r\nUEsDBA==\r\n",
        )
        .unwrap();
        assert!(email.has_no_text());
        assert_eq!(email.attachments[0].filename, "bundle.zip");
        assert_eq!(email.attachments[0].content_type, "application/zip; name=\"bundle.zip\"");
        assert_eq!(email.attachments[0].content, b"PK\x03\x04");
    }
}
