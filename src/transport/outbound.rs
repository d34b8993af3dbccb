//! Compose the RFC 5322 payload for a forwarded message.

use lettre::Message;
use lettre::message::header::{Header, HeaderName, HeaderValue, Headers};
use lettre::message::{Mailbox, SinglePart};

use crate::config::ForwardMode;
use crate::error::DeliveryError;
use crate::model::NormalizedMessage;

/// Marker header stamped on everything the dispatcher sends.
pub const FORWARDED_BY: &str = "Mail-Dispatcher-System";

/// Body used when the source message had no readable text.
pub const EMPTY_BODY_PLACEHOLDER: &str = "(no message content)";

macro_rules! text_header {
    ($(#[$doc:meta])* $ty:ident, $name:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $ty(pub String);

        impl Header for $ty {
            fn name() -> HeaderName {
                HeaderName::new_from_ascii_str($name)
            }

            fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
                Ok(Self(s.to_string()))
            }

            fn display(&self) -> HeaderValue {
                HeaderValue::new(Self::name(), header_value(&self.0))
            }
        }
    };
}

text_header!(ResentFrom, "Resent-From");
text_header!(ResentTo, "Resent-To");
text_header!(
    /// Identifies mail re-sent by the dispatcher.
    XForwardedBy,
    "X-Forwarded-By"
);
text_header!(
    /// Sender of the message before it was forwarded.
    OriginalFrom,
    "Original-From"
);

/// A message on its way to a forward target.
#[derive(Debug, Clone, Copy)]
pub struct Outbound<'a> {
    pub message: &'a NormalizedMessage,
    pub mode: ForwardMode,
}

/// Build the bytes handed to the submission server.
///
/// `sender` is the forwarding account's login; `to` the target address.
pub fn compose(outbound: &Outbound<'_>, sender: &str, to: &str) -> Result<Vec<u8>, DeliveryError> {
    match (outbound.mode, outbound.message.raw.as_deref()) {
        (ForwardMode::Raw, Some(raw)) => Ok(resend_raw(raw, sender, to)),
        _ => rebuild(outbound.message, sender, to),
    }
}

fn rebuild(message: &NormalizedMessage, sender: &str, to: &str) -> Result<Vec<u8>, DeliveryError> {
    let mut builder = Message::builder()
        .from(mailbox(sender)?)
        .to(mailbox(to)?)
        .subject(header_value(&message.subject))
        .date_now()
        .header(ResentFrom(sender.to_string()))
        .header(ResentTo(to.to_string()))
        .header(XForwardedBy(FORWARDED_BY.to_string()));
    if !message.from.is_empty() {
        builder = builder.header(OriginalFrom(message.from.clone()));
    }

    let body = message
        .body
        .as_deref()
        .filter(|b| !b.trim().is_empty())
        .unwrap_or(EMPTY_BODY_PLACEHOLDER);

    let email = builder
        .singlepart(SinglePart::plain(body.to_string()))
        .map_err(|e| DeliveryError::Build(format!("Failed to build email: {e}")))?;
    Ok(email.formatted())
}

fn resend_raw(raw: &[u8], sender: &str, to: &str) -> Vec<u8> {
    let mut headers = Headers::new();
    headers.set(ResentFrom(sender.to_string()));
    headers.set(ResentTo(to.to_string()));
    headers.set(XForwardedBy(FORWARDED_BY.to_string()));
    let prefix = headers.to_string();

    let mut out = Vec::with_capacity(prefix.len() + raw.len());
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(raw);
    out
}

fn mailbox(address: &str) -> Result<Mailbox, DeliveryError> {
    address.parse().map_err(|e| DeliveryError::InvalidAddress {
        address: address.to_string(),
        reason: format!("{e}"),
    })
}

/// Header values must stay on one line.
fn header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn message(body: Option<&str>, raw: Option<&[u8]>) -> NormalizedMessage {
        NormalizedMessage {
            message_id: "1-9".into(),
            subject: "报警 - 张三".into(),
            from: "alice@example.com".into(),
            to: "ops@example.com".into(),
            received_at: Utc::now(),
            raw: raw.map(<[u8]>::to_vec),
            body: body.map(str::to_string),
        }
    }

    fn header_block(payload: &[u8]) -> String {
        let text = String::from_utf8_lossy(payload).into_owned();
        text.split("\r\n\r\n").next().unwrap_or_default().to_string()
    }

    #[test]
    fn rebuild_has_forwarding_headers_in_order() {
        let msg = message(Some("disk full"), None);
        let payload = compose(
            &Outbound { message: &msg, mode: ForwardMode::Rebuild },
            "bot@example.com",
            "zhangsan@example.com",
        )
        .unwrap();
        let headers = header_block(&payload);
        let names: Vec<&str> = headers
            .lines()
            .filter_map(|l| l.split_once(':').map(|(n, _)| n))
            .collect();
        for name in [
            "From",
            "To",
            "Subject",
            "Date",
            "Resent-From",
            "Resent-To",
            "X-Forwarded-By",
            "Original-From",
            "MIME-Version",
            "Content-Type",
        ] {
            assert!(names.contains(&name), "missing {name} in {names:?}");
        }
        let position = |name: &str| names.iter().position(|n| *n == name).unwrap();
        assert!(position("From") < position("Resent-From"));
        assert!(position("Resent-From") < position("X-Forwarded-By"));
        assert!(headers.contains("X-Forwarded-By: Mail-Dispatcher-System"));
        assert!(headers.contains("Original-From: alice@example.com"));
        assert!(!headers.contains("报警"));
    }

    #[test]
    fn rebuilt_message_parses_back() {
        let msg = message(Some("disk full"), None);
        let payload = compose(
            &Outbound { message: &msg, mode: ForwardMode::Rebuild },
            "bot@example.com",
            "zhangsan@example.com",
        )
        .unwrap();
        let parsed = mail_parser::MessageParser::default().parse(&payload).unwrap();
        assert_eq!(parsed.subject(), Some("报警 - 张三"));
        assert_eq!(parsed.body_text(0).as_deref().map(str::trim), Some("disk full"));
    }

    #[test]
    fn empty_body_gets_placeholder() {
        let msg = message(Some("   "), None);
        let payload = compose(
            &Outbound { message: &msg, mode: ForwardMode::Rebuild },
            "bot@example.com",
            "t@example.com",
        )
        .unwrap();
        let parsed = mail_parser::MessageParser::default().parse(&payload).unwrap();
        assert_eq!(
            parsed.body_text(0).as_deref().map(str::trim),
            Some(EMPTY_BODY_PLACEHOLDER)
        );
    }

    #[test]
    fn no_original_from_when_sender_unknown() {
        let mut msg = message(None, None);
        msg.from.clear();
        let payload = compose(
            &Outbound { message: &msg, mode: ForwardMode::Rebuild },
            "bot@example.com",
            "t@example.com",
        )
        .unwrap();
        assert!(!header_block(&payload).contains("Original-From"));
    }

    #[test]
    fn raw_mode_prepends_resent_headers() {
        let raw = b"From: alice@example.com\r\nSubject: a - b\r\n\r\nbody\r\n";
        let msg = message(None, Some(raw));
        let payload = compose(
            &Outbound { message: &msg, mode: ForwardMode::Raw },
            "bot@example.com",
            "t@example.com",
        )
        .unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(text.starts_with("Resent-From: bot@example.com\r\nResent-To: t@example.com\r\n"));
        assert!(text.ends_with("From: alice@example.com\r\nSubject: a - b\r\n\r\nbody\r\n"));
        // Exactly one header/body separator.
        assert_eq!(text.matches("\r\n\r\n").count(), 1);
    }

    #[test]
    fn raw_mode_without_payload_rebuilds() {
        let msg = message(Some("x"), None);
        let payload = compose(
            &Outbound { message: &msg, mode: ForwardMode::Raw },
            "bot@example.com",
            "t@example.com",
        )
        .unwrap();
        let parsed = mail_parser::MessageParser::default().parse(&payload).unwrap();
        assert_eq!(parsed.subject(), Some("报警 - 张三"));
        assert!(!String::from_utf8_lossy(&payload).starts_with("Resent-From"));
    }

    #[test]
    fn header_injection_is_flattened() {
        let mut msg = message(Some("x"), None);
        msg.subject = "hello\r\nBcc: evil@example.com".into();
        let payload = compose(
            &Outbound { message: &msg, mode: ForwardMode::Rebuild },
            "bot@example.com",
            "t@example.com",
        )
        .unwrap();
        let headers = header_block(&payload);
        assert!(!headers.lines().any(|l| l.starts_with("Bcc:")));
    }

    #[test]
    fn non_ascii_body_survives_transfer_encoding() {
        let msg = message(Some("磁盘已满，请处理"), None);
        let payload = compose(
            &Outbound { message: &msg, mode: ForwardMode::Rebuild },
            "bot@example.com",
            "t@example.com",
        )
        .unwrap();
        assert!(payload.is_ascii());
        let parsed = mail_parser::MessageParser::default().parse(&payload).unwrap();
        assert_eq!(
            parsed.body_text(0).as_deref().map(str::trim),
            Some("磁盘已满，请处理")
        );
    }

    #[test]
    fn invalid_target_address_is_rejected() {
        let msg = message(Some("x"), None);
        let err = compose(
            &Outbound { message: &msg, mode: ForwardMode::Rebuild },
            "bot@example.com",
            "not an address",
        )
        .unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidAddress { .. }));
    }
}
