//! IMAP response parsing for the handful of responses the dispatcher reads:
//! tagged status lines, `SEARCH`, and `FETCH` with `UID`, `INTERNALDATE`,
//! `ENVELOPE` and `BODY[]`.
//!
//! Responses arrive as complete byte buffers (literals already inlined by
//! the framing layer) and are parsed into a small value tree.

use crate::error::TransportError;

/// Largest literal a server may announce. Anything bigger is a protocol error.
pub const MAX_LITERAL: usize = 64 * 1024 * 1024;

/// A parsed IMAP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Atom(String),
    /// Quoted string or literal.
    Bytes(Vec<u8>),
    Nil,
    List(Vec<Value>),
}

impl Value {
    fn as_text(&self) -> Option<String> {
        match self {
            Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            Value::Atom(a) => Some(a.clone()),
            _ => None,
        }
    }
}

/// Completion status of a tagged response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

/// One address from an ENVELOPE address list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnvelopeAddress {
    pub name: Option<String>,
    pub mailbox: Option<String>,
    pub host: Option<String>,
}

impl EnvelopeAddress {
    /// `mailbox@host`, or whichever half is present.
    pub fn address(&self) -> String {
        match (&self.mailbox, &self.host) {
            (Some(m), Some(h)) => format!("{m}@{h}"),
            (Some(m), None) => m.clone(),
            (None, Some(h)) => h.clone(),
            (None, None) => String::new(),
        }
    }
}

/// The fields of an ENVELOPE the dispatcher uses. Strings are still
/// transfer-encoded (RFC 2047) at this point.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<EnvelopeAddress>,
    pub to: Vec<EnvelopeAddress>,
}

/// Protocol-level data for one fetched message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchedItem {
    pub uid: u32,
    pub internal_date: Option<String>,
    pub envelope: Option<Envelope>,
    pub body: Option<Vec<u8>>,
}

/// Split a tagged completion line into status and trailing text.
///
/// Returns `None` when the line does not carry `tag`.
pub fn tagged_status(line: &[u8], tag: &str) -> Option<(Status, String)> {
    let text = String::from_utf8_lossy(line);
    let rest = text.strip_prefix(tag)?.strip_prefix(' ')?;
    let (word, tail) = rest.split_once(' ').unwrap_or((rest.trim_end(), ""));
    let status = match word.trim_end().to_ascii_uppercase().as_str() {
        "OK" => Status::Ok,
        "NO" => Status::No,
        "BAD" => Status::Bad,
        _ => return None,
    };
    Some((status, tail.trim_end().to_string()))
}

/// Collect UIDs from `* SEARCH` responses. Other responses are ignored.
pub fn parse_search(responses: &[Vec<u8>]) -> Vec<u32> {
    let mut uids = Vec::new();
    for response in responses {
        let text = String::from_utf8_lossy(response);
        let Some(rest) = strip_untagged(&text, "SEARCH") else {
            continue;
        };
        uids.extend(rest.split_whitespace().filter_map(|n| n.parse::<u32>().ok()));
    }
    uids
}

/// Parse every `* n FETCH (...)` response that carries a UID.
///
/// Unrelated untagged responses (EXISTS, flag updates without UID) are
/// skipped. A response that cannot be parsed is logged and skipped; the
/// rest of the batch is still returned.
pub fn parse_fetch_responses(responses: &[Vec<u8>]) -> Vec<FetchedItem> {
    let mut items = Vec::new();
    for response in responses {
        let Some(start) = fetch_payload_start(response) else {
            continue;
        };
        match parse_fetch(&response[start..]) {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(e) => tracing::warn!(
                uid = ?uid_hint(response),
                error = %e,
                "Skipping unparsable FETCH response"
            ),
        }
    }
    items
}

fn parse_fetch(payload: &[u8]) -> Result<Option<FetchedItem>, TransportError> {
    let mut parser = Parser::new(payload);
    let Value::List(fields) = parser.value()? else {
        return Err(TransportError::Protocol("FETCH payload is not a list".into()));
    };
    fetched_item(&fields)
}

/// Best-effort `UID <n>` lookup in a response that failed to parse.
fn uid_hint(response: &[u8]) -> Option<u32> {
    let text = String::from_utf8_lossy(response);
    let mut words = text.split(|c: char| c.is_whitespace() || c == '(' || c == ')');
    while let Some(word) = words.next() {
        if word.eq_ignore_ascii_case("UID") {
            return words.next()?.parse().ok();
        }
    }
    None
}

fn strip_untagged<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = text.strip_prefix("* ")?;
    let (word, tail) = rest.split_once(' ').unwrap_or((rest.trim_end(), ""));
    word.eq_ignore_ascii_case(keyword).then_some(tail)
}

/// Offset of the opening paren in `* <n> FETCH (`.
fn fetch_payload_start(response: &[u8]) -> Option<usize> {
    let head_len = response.iter().position(|&b| b == b'(')?;
    let head = std::str::from_utf8(&response[..head_len]).ok()?;
    let mut words = head.split_whitespace();
    if words.next()? != "*" {
        return None;
    }
    words.next()?.parse::<u32>().ok()?;
    if !words.next()?.eq_ignore_ascii_case("FETCH") || words.next().is_some() {
        return None;
    }
    Some(head_len)
}

fn fetched_item(fields: &[Value]) -> Result<Option<FetchedItem>, TransportError> {
    let mut item = FetchedItem::default();
    let mut has_uid = false;

    for pair in fields.chunks(2) {
        let [Value::Atom(name), value] = pair else {
            return Err(TransportError::Protocol("malformed FETCH attribute list".into()));
        };
        match name.to_ascii_uppercase().as_str() {
            "UID" => {
                item.uid = value
                    .as_text()
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| TransportError::Protocol("UID is not a number".into()))?;
                has_uid = true;
            }
            "INTERNALDATE" => item.internal_date = value.as_text(),
            "ENVELOPE" => item.envelope = Some(envelope(value)?),
            "BODY[]" | "RFC822" => {
                if let Value::Bytes(bytes) = value {
                    item.body = Some(bytes.clone());
                }
            }
            _ => {}
        }
    }

    Ok(has_uid.then_some(item))
}

fn envelope(value: &Value) -> Result<Envelope, TransportError> {
    let Value::List(parts) = value else {
        return Err(TransportError::Protocol("ENVELOPE is not a list".into()));
    };
    if parts.len() < 6 {
        return Err(TransportError::Protocol(format!(
            "ENVELOPE has {} fields, expected 10",
            parts.len()
        )));
    }
    Ok(Envelope {
        date: parts[0].as_text(),
        subject: parts[1].as_text(),
        from: address_list(&parts[2]),
        to: address_list(&parts[5]),
    })
}

fn address_list(value: &Value) -> Vec<EnvelopeAddress> {
    let Value::List(entries) = value else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::List(f) if f.len() == 4 => Some(EnvelopeAddress {
                name: f[0].as_text(),
                mailbox: f[2].as_text(),
                host: f[3].as_text(),
            }),
            _ => None,
        })
        // Group syntax markers carry no host.
        .filter(|a| a.host.is_some())
        .collect()
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_spaces(&mut self) {
        while matches!(self.peek(), Some(b' ')) {
            self.pos += 1;
        }
    }

    fn error(&self, message: &str) -> TransportError {
        TransportError::Protocol(format!("{message} at byte {}", self.pos))
    }

    fn value(&mut self) -> Result<Value, TransportError> {
        self.skip_spaces();
        match self.peek() {
            Some(b'(') => self.list(),
            Some(b'"') => self.quoted(),
            Some(b'{') => self.literal(),
            Some(_) => {
                let atom = self.atom()?;
                if atom.eq_ignore_ascii_case("NIL") {
                    Ok(Value::Nil)
                } else {
                    Ok(Value::Atom(atom))
                }
            }
            None => Err(self.error("unexpected end of response")),
        }
    }

    fn list(&mut self) -> Result<Value, TransportError> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_spaces();
            match self.peek() {
                Some(b')') => {
                    self.pos += 1;
                    return Ok(Value::List(items));
                }
                Some(_) => items.push(self.value()?),
                None => return Err(self.error("unterminated list")),
            }
        }
    }

    fn quoted(&mut self) -> Result<Value, TransportError> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                Some(b'\\') => {
                    let escaped = self
                        .input
                        .get(self.pos + 1)
                        .copied()
                        .ok_or_else(|| self.error("dangling escape"))?;
                    out.push(escaped);
                    self.pos += 2;
                }
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(Value::Bytes(out));
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
                None => return Err(self.error("unterminated quoted string")),
            }
        }
    }

    fn literal(&mut self) -> Result<Value, TransportError> {
        let close = self.input[self.pos..]
            .iter()
            .position(|&b| b == b'}')
            .ok_or_else(|| self.error("unterminated literal length"))?;
        let digits = &self.input[self.pos + 1..self.pos + close];
        let digits = digits.strip_suffix(b"+").unwrap_or(digits);
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|d| d.parse().ok())
            .ok_or_else(|| self.error("invalid literal length"))?;
        self.pos += close + 1;
        if self.input[self.pos..].starts_with(b"\r\n") {
            self.pos += 2;
        }
        if len > MAX_LITERAL {
            return Err(self.error("literal exceeds size limit"));
        }
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| self.error("literal length overflows"))?;
        let data = self
            .input
            .get(self.pos..end)
            .ok_or_else(|| self.error("literal shorter than announced"))?
            .to_vec();
        self.pos = end;
        Ok(Value::Bytes(data))
    }

    /// Atoms may contain a bracketed section (`BODY[]`, `BODY[HEADER.FIELDS (A B)]`).
    fn atom(&mut self) -> Result<String, TransportError> {
        let start = self.pos;
        let mut depth = 0usize;
        while let Some(b) = self.peek() {
            match b {
                b'[' => depth += 1,
                b']' => depth = depth.saturating_sub(1),
                b' ' | b'(' | b')' | b'\r' | b'\n' if depth == 0 => break,
                _ => {}
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected atom"));
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }
}
