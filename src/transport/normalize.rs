//! Turn protocol-level fetch results into [`NormalizedMessage`]s.

use chrono::{DateTime, Utc};
use mail_parser::{Message, MessageParser};

use super::response::{EnvelopeAddress, FetchedItem};
use crate::error::TransportError;
use crate::model::NormalizedMessage;

/// Build a normalized message for `account_id` from one fetched item.
///
/// Envelope fields win; any that are empty are filled from the headers of
/// the fetched payload. Fails only when the server returned neither.
pub fn normalize(account_id: i64, item: FetchedItem) -> Result<NormalizedMessage, TransportError> {
    let parsed = item
        .body
        .as_deref()
        .and_then(|raw| MessageParser::default().parse(raw));

    if item.envelope.is_none() && parsed.is_none() {
        return Err(TransportError::Fetch(format!(
            "UID {} returned neither envelope nor a parsable body",
            item.uid
        )));
    }

    let envelope = item.envelope.as_ref();

    let subject = envelope
        .and_then(|e| e.subject.as_deref())
        .filter(|s| !s.is_empty())
        .map(decode_header_text)
        .or_else(|| parsed.as_ref().and_then(|p| p.subject()).map(str::to_string))
        .unwrap_or_default();

    let from = envelope
        .and_then(|e| first_address(&e.from))
        .or_else(|| parsed.as_ref().and_then(|p| header_address(p, Header::From)))
        .unwrap_or_default();

    let to = envelope
        .and_then(|e| first_address(&e.to))
        .or_else(|| parsed.as_ref().and_then(|p| header_address(p, Header::To)))
        .unwrap_or_default();

    let received_at = item
        .internal_date
        .as_deref()
        .and_then(parse_internal_date)
        .unwrap_or_else(Utc::now);

    let body = parsed.as_ref().and_then(extract_text);
    drop(parsed);

    Ok(NormalizedMessage {
        message_id: format!("{account_id}-{}", item.uid),
        subject,
        from,
        to,
        received_at,
        body,
        raw: item.body,
    })
}

enum Header {
    From,
    To,
}

fn first_address(list: &[EnvelopeAddress]) -> Option<String> {
    list.first().map(EnvelopeAddress::address).filter(|a| !a.is_empty())
}

fn header_address(parsed: &Message<'_>, header: Header) -> Option<String> {
    let list = match header {
        Header::From => parsed.from(),
        Header::To => parsed.to(),
    }?;
    list.first()
        .and_then(|a| a.address())
        .map(str::to_string)
        .filter(|a| !a.is_empty())
}

/// Decode RFC 2047 encoded-words. Undecodable input comes back unchanged.
fn decode_header_text(raw: &str) -> String {
    if !raw.contains("=?") {
        return raw.to_string();
    }
    let wrapped = format!("Subject: {raw}\r\n\r\n");
    MessageParser::default()
        .parse(wrapped.as_bytes())
        .and_then(|m| m.subject().map(str::to_string))
        .unwrap_or_else(|| raw.to_string())
}

/// `INTERNALDATE` is `dd-Mon-yyyy hh:mm:ss +zzzz`, day possibly space-padded.
fn parse_internal_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Readable text of a parsed message: plain part, else stripped HTML.
fn extract_text(parsed: &Message<'_>) -> Option<String> {
    if let Some(text) = parsed.body_text(0) {
        return Some(text.into_owned());
    }
    parsed.body_html(0).map(|html| strip_html(&html))
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::response::Envelope;

    fn addr(mailbox: &str, host: &str) -> EnvelopeAddress {
        EnvelopeAddress {
            name: None,
            mailbox: Some(mailbox.into()),
            host: Some(host.into()),
        }
    }

    #[test]
    fn envelope_fields_are_preferred() {
        let item = FetchedItem {
            uid: 42,
            internal_date: Some("17-Jul-2026 02:44:25 -0700".into()),
            envelope: Some(Envelope {
                date: None,
                subject: Some("alert - ops".into()),
                from: vec![addr("alice", "example.com")],
                to: vec![addr("inbox", "example.org"), addr("cc", "example.org")],
            }),
            body: Some(b"From: other@x.com\r\nSubject: ignored\r\n\r\nbody text\r\n".to_vec()),
        };
        let msg = normalize(7, item).unwrap();
        assert_eq!(msg.message_id, "7-42");
        assert_eq!(msg.subject, "alert - ops");
        assert_eq!(msg.from, "alice@example.com");
        assert_eq!(msg.to, "inbox@example.org");
        assert_eq!(msg.received_at.to_rfc3339(), "2026-07-17T09:44:25+00:00");
        assert_eq!(msg.body.as_deref().map(str::trim), Some("body text"));
        assert!(msg.raw.is_some());
    }

    #[test]
    fn missing_envelope_falls_back_to_headers() {
        let item = FetchedItem {
            uid: 3,
            internal_date: None,
            envelope: None,
            body: Some(
                b"From: Bob <bob@example.com>\r\nTo: ops@example.org\r\nSubject: disk - storage\r\n\r\nfull\r\n"
                    .to_vec(),
            ),
        };
        let msg = normalize(1, item).unwrap();
        assert_eq!(msg.subject, "disk - storage");
        assert_eq!(msg.from, "bob@example.com");
        assert_eq!(msg.to, "ops@example.org");
    }

    #[test]
    fn empty_envelope_subject_falls_back_to_headers() {
        let item = FetchedItem {
            uid: 4,
            internal_date: None,
            envelope: Some(Envelope {
                subject: Some(String::new()),
                ..Default::default()
            }),
            body: Some(b"Subject: from body - team\r\n\r\nx\r\n".to_vec()),
        };
        assert_eq!(normalize(1, item).unwrap().subject, "from body - team");
    }

    #[test]
    fn encoded_subject_is_decoded() {
        let item = FetchedItem {
            uid: 5,
            internal_date: None,
            // "报警 - 张三"
            envelope: Some(Envelope {
                subject: Some("=?UTF-8?B?5oql6K2mIC0g5byg5LiJ?=".into()),
                ..Default::default()
            }),
            body: None,
        };
        let msg = normalize(1, item).unwrap();
        assert_eq!(msg.subject, "报警 - 张三");
        assert!(msg.body.is_none());
    }

    #[test]
    fn nothing_usable_is_an_error() {
        let item = FetchedItem {
            uid: 9,
            ..Default::default()
        };
        assert!(matches!(normalize(1, item), Err(TransportError::Fetch(_))));
    }

    #[test]
    fn html_only_body_has_no_markup() {
        let item = FetchedItem {
            uid: 6,
            internal_date: None,
            envelope: None,
            body: Some(
                b"Subject: x - y\r\nContent-Type: text/html\r\n\r\n<p>Hello <b>there</b></p>\r\n".to_vec(),
            ),
        };
        let body = normalize(1, item).unwrap().body.unwrap();
        assert!(body.contains("Hello"));
        assert!(!body.contains("<p>"));
    }

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<div><b>Bold</b> and <i>italic</i></div>"), "Bold and italic");
        assert_eq!(strip_html("No HTML here"), "No HTML here");
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn internal_date_with_padded_day() {
        assert!(parse_internal_date(" 7-Jul-2026 10:00:00 +0000").is_some());
        assert!(parse_internal_date("not a date").is_none());
    }
}
