//! IMAP response formatting
//!
//! Everything that leaves the gateway goes through these helpers. Lengths in
//! literal markers are UTF-8 byte lengths; a formatter producing `{N}` must
//! count the same bytes the framer on the other end will.

use chrono::{DateTime, Utc};

use crate::upstream::types::{
    BodyStructure, EmailAddress, Envelope, MailboxMessage, MessageBody,
};

use super::command::Section;

/// Maximum bytes a value may have and still be sent as a quoted string.
const QUOTED_MAX: usize = 100;
/// Mailbox names beyond this go out as literals.
const NAME_QUOTED_MAX: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

impl Status {
    fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::No => "NO",
            Status::Bad => "BAD",
        }
    }
}

/// One wire response. A command handler returns an ordered list of these;
/// the last one is always tagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Untagged(Vec<u8>),
    Continuation(String),
    Tagged {
        tag: String,
        status: Status,
        code: Option<String>,
        message: String,
    },
}

impl Response {
    pub fn ok(tag: &str, message: &str) -> Self {
        Response::Tagged {
            tag: tag.to_string(),
            status: Status::Ok,
            code: None,
            message: message.to_string(),
        }
    }

    pub fn ok_with_code(tag: &str, code: &str, message: &str) -> Self {
        Response::Tagged {
            tag: tag.to_string(),
            status: Status::Ok,
            code: Some(code.to_string()),
            message: message.to_string(),
        }
    }

    pub fn no(tag: &str, message: &str) -> Self {
        Response::Tagged {
            tag: tag.to_string(),
            status: Status::No,
            code: None,
            message: message.to_string(),
        }
    }

    pub fn no_with_code(tag: &str, code: &str, message: &str) -> Self {
        Response::Tagged {
            tag: tag.to_string(),
            status: Status::No,
            code: Some(code.to_string()),
            message: message.to_string(),
        }
    }

    pub fn bad(tag: &str, message: &str) -> Self {
        Response::Tagged {
            tag: tag.to_string(),
            status: Status::Bad,
            code: None,
            message: message.to_string(),
        }
    }

    pub fn untagged(text: impl Into<Vec<u8>>) -> Self {
        Response::Untagged(text.into())
    }

    pub fn bye(message: &str) -> Self {
        Response::Untagged(format!("BYE {}", message).into_bytes())
    }

    pub fn is_tagged(&self) -> bool {
        matches!(self, Response::Tagged { .. })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::Untagged(data) => {
                let mut out = Vec::with_capacity(data.len() + 4);
                out.extend_from_slice(b"* ");
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
                out
            }
            Response::Continuation(text) => format!("+ {}\r\n", text).into_bytes(),
            Response::Tagged {
                tag,
                status,
                code,
                message,
            } => match code {
                Some(code) => {
                    format!("{} {} [{}] {}\r\n", tag, status.as_str(), code, message).into_bytes()
                }
                None => format!("{} {} {}\r\n", tag, status.as_str(), message).into_bytes(),
            },
        }
    }
}

/// Quote a string, escaping backslash and double-quote.
pub fn quoted(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Literal marker plus payload: `{N}CRLF<bytes>`.
pub fn literal(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{{{}}}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out
}

/// Render a string value as quoted or literal form; parses back to the same
/// bytes under the framer.
pub fn format_string(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let clean = !bytes
        .iter()
        .any(|&b| b == b'\r' || b == b'\n' || b == b'"');
    if clean && bytes.len() <= QUOTED_MAX {
        quoted(s).into_bytes()
    } else {
        literal(bytes)
    }
}

/// NIL for absent, else `format_string`.
pub fn nstring(value: Option<&str>) -> Vec<u8> {
    match value {
        Some(s) => format_string(s),
        None => b"NIL".to_vec(),
    }
}

/// `INTERNALDATE` wire form, always UTC; single-digit days space-padded.
pub fn internal_date(date: &DateTime<Utc>) -> String {
    date.format("\"%e-%b-%Y %H:%M:%S +0000\"").to_string()
}

fn address(addr: &EmailAddress) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(b'(');
    out.extend_from_slice(&nstring(addr.name.as_deref()));
    out.push(b' ');
    out.extend_from_slice(&nstring(addr.adl.as_deref()));
    out.push(b' ');
    out.extend_from_slice(&nstring(addr.mailbox.as_deref()));
    out.push(b' ');
    out.extend_from_slice(&nstring(addr.host.as_deref()));
    out.push(b')');
    out
}

fn address_list(list: Option<&[EmailAddress]>) -> Vec<u8> {
    match list {
        Some(addrs) if !addrs.is_empty() => {
            let mut out = Vec::new();
            out.push(b'(');
            for addr in addrs {
                out.extend_from_slice(&address(addr));
            }
            out.push(b')');
            out
        }
        _ => b"NIL".to_vec(),
    }
}

/// `(date subject from sender reply-to to cc bcc in-reply-to message-id)`.
/// Sender and reply-to default to the from list when the upstream omits them.
pub fn envelope(env: &Envelope) -> Vec<u8> {
    let from = env.from.as_deref();
    let sender = env.sender.as_deref().or(from);
    let reply_to = env.reply_to.as_deref().or(from);

    let mut out = Vec::new();
    out.push(b'(');
    out.extend_from_slice(&nstring(env.date.as_deref()));
    out.push(b' ');
    out.extend_from_slice(&nstring(env.subject.as_deref()));
    out.push(b' ');
    out.extend_from_slice(&address_list(from));
    out.push(b' ');
    out.extend_from_slice(&address_list(sender));
    out.push(b' ');
    out.extend_from_slice(&address_list(reply_to));
    out.push(b' ');
    out.extend_from_slice(&address_list(env.to.as_deref()));
    out.push(b' ');
    out.extend_from_slice(&address_list(env.cc.as_deref()));
    out.push(b' ');
    out.extend_from_slice(&address_list(env.bcc.as_deref()));
    out.push(b' ');
    out.extend_from_slice(&nstring(env.in_reply_to.as_deref()));
    out.push(b' ');
    out.extend_from_slice(&nstring(env.message_id.as_deref()));
    out.push(b')');
    out
}

/// BODYSTRUCTURE / BODY wire form. Single part:
/// `("TYPE" "SUBTYPE" params id desc encoding size [lines])`; multipart
/// nests each part then tails with the subtype.
pub fn body_structure(bs: &BodyStructure) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(b'(');

    if let Some(parts) = bs.parts.as_ref().filter(|p| !p.is_empty()) {
        for part in parts {
            out.extend_from_slice(&body_structure(part));
        }
        out.push(b' ');
        out.extend_from_slice(quoted(&bs.subtype.to_uppercase()).as_bytes());
    } else {
        out.extend_from_slice(quoted(&bs.part_type.to_uppercase()).as_bytes());
        out.push(b' ');
        out.extend_from_slice(quoted(&bs.subtype.to_uppercase()).as_bytes());
        out.push(b' ');
        if bs.params.is_empty() {
            out.extend_from_slice(b"NIL");
        } else {
            out.push(b'(');
            let mut first = true;
            for (k, v) in &bs.params {
                if !first {
                    out.push(b' ');
                }
                first = false;
                out.extend_from_slice(quoted(&k.to_uppercase()).as_bytes());
                out.push(b' ');
                out.extend_from_slice(quoted(v).as_bytes());
            }
            out.push(b')');
        }
        out.push(b' ');
        out.extend_from_slice(&nstring(bs.id.as_deref()));
        out.push(b' ');
        out.extend_from_slice(&nstring(bs.description.as_deref()));
        out.push(b' ');
        out.extend_from_slice(quoted(&bs.encoding.to_uppercase()).as_bytes());
        out.push(b' ');
        out.extend_from_slice(bs.size.to_string().as_bytes());
        if let Some(lines) = bs.lines {
            out.push(b' ');
            out.extend_from_slice(lines.to_string().as_bytes());
        }
    }

    out.push(b')');
    out
}

/// Flag list wire form: `(\Seen \Draft)`.
pub fn flag_list(flags: &[String]) -> String {
    format!("({})", flags.join(" "))
}

/// `* <seq> FETCH (item item …)`.
pub fn fetch_line(seq: u32, parts: &[Vec<u8>]) -> Response {
    let mut data = format!("{} FETCH (", seq).into_bytes();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            data.push(b' ');
        }
        data.extend_from_slice(part);
    }
    data.push(b')');
    Response::Untagged(data)
}

/// `LIST (flags) "/" name` — the name becomes a literal when it contains
/// CR/LF or is longer than the quoted ceiling.
pub fn list_line(command: &str, flags: &[&str], name: &str) -> Response {
    let mut data = format!("{} ({}) \"/\" ", command, flags.join(" ")).into_bytes();
    let bytes = name.as_bytes();
    if bytes.iter().any(|&b| b == b'\r' || b == b'\n') || bytes.len() > NAME_QUOTED_MAX {
        data.extend_from_slice(&literal(bytes));
    } else {
        data.extend_from_slice(quoted(name).as_bytes());
    }
    Response::Untagged(data)
}

/// `STATUS "mailbox" (KEY n …)` with only the requested items.
pub fn status_line(mailbox: &str, items: &[(String, u64)]) -> Response {
    let rendered: Vec<String> = items
        .iter()
        .map(|(key, value)| format!("{} {}", key, value))
        .collect();
    Response::Untagged(
        format!("STATUS {} ({})", quoted(mailbox), rendered.join(" ")).into_bytes(),
    )
}

/// Wire label for a BODY fetch response, echoing section and origin.
pub fn body_label(section: &Section, origin: Option<u32>) -> String {
    let section_text = match section {
        Section::Full => String::new(),
        Section::Header => "HEADER".to_string(),
        Section::HeaderFields(fields) => {
            format!("HEADER.FIELDS ({})", fields.join(" "))
        }
        Section::Text => "TEXT".to_string(),
        Section::Part(path) => path
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join("."),
    };
    match origin {
        Some(start) => format!("BODY[{}]<{}>", section_text, start),
        None => format!("BODY[{}]", section_text),
    }
}

/// Clamp a `<start.length>` partial to the payload, byte-based.
pub fn apply_partial(data: &[u8], partial: Option<(u32, u32)>) -> (&[u8], Option<u32>) {
    match partial {
        Some((start, length)) => {
            let start = (start as usize).min(data.len());
            let end = start.saturating_add(length as usize).min(data.len());
            (&data[start..end], Some(start as u32))
        }
        None => (data, None),
    }
}

/// Normalise line endings to CRLF.
fn to_crlf(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_cr = false;
    for c in s.chars() {
        if c == '\n' && !prev_cr {
            out.push('\r');
        }
        prev_cr = c == '\r';
        out.push(c);
    }
    out
}

const MIME_BOUNDARY_PREFIX: &str = "=_xmit_";

/// Rebuild the full RFC 822 message from the upstream body. Uses the stored
/// header block when available, otherwise synthesises headers from the
/// envelope. All output line endings are CRLF.
pub fn reconstruct_rfc822(message: &MailboxMessage, body: &MessageBody) -> Vec<u8> {
    let boundary = format!("{}{}", MIME_BOUNDARY_PREFIX, message.uid);
    let multipart = body.text.is_some() && body.html.is_some();

    let mut out = String::new();
    match body.headers.as_deref() {
        Some(headers) => {
            let headers = to_crlf(headers);
            out.push_str(headers.trim_end_matches("\r\n"));
            out.push_str("\r\n");
        }
        None => {
            if let Some(env) = &message.envelope {
                if let Some(date) = &env.date {
                    out.push_str(&format!("Date: {}\r\n", date));
                }
                if let Some(from) = &env.from {
                    out.push_str(&format!("From: {}\r\n", join_addresses(from)));
                }
                if let Some(to) = &env.to {
                    out.push_str(&format!("To: {}\r\n", join_addresses(to)));
                }
                if let Some(cc) = &env.cc {
                    out.push_str(&format!("Cc: {}\r\n", join_addresses(cc)));
                }
                if let Some(subject) = &env.subject {
                    out.push_str(&format!("Subject: {}\r\n", subject));
                }
                if let Some(message_id) = &env.message_id {
                    out.push_str(&format!("Message-ID: {}\r\n", message_id));
                }
                if let Some(in_reply_to) = &env.in_reply_to {
                    out.push_str(&format!("In-Reply-To: {}\r\n", in_reply_to));
                }
            }
            out.push_str("MIME-Version: 1.0\r\n");
            if multipart {
                out.push_str(&format!(
                    "Content-Type: multipart/alternative; boundary=\"{}\"\r\n",
                    boundary
                ));
            } else if body.html.is_some() {
                out.push_str("Content-Type: text/html; charset=utf-8\r\n");
            } else {
                out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
            }
        }
    }
    out.push_str("\r\n");

    if multipart {
        let text = to_crlf(body.text.as_deref().unwrap_or_default());
        let html = to_crlf(body.html.as_deref().unwrap_or_default());
        out.push_str(&format!("--{}\r\n", boundary));
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
        out.push_str(&text);
        out.push_str(&format!("\r\n--{}\r\n", boundary));
        out.push_str("Content-Type: text/html; charset=utf-8\r\n\r\n");
        out.push_str(&html);
        out.push_str(&format!("\r\n--{}--\r\n", boundary));
    } else if let Some(html) = &body.html {
        out.push_str(&to_crlf(html));
    } else if let Some(text) = &body.text {
        out.push_str(&to_crlf(text));
    }

    out.into_bytes()
}

/// Extract a BODY section from the full message bytes (or, for numeric MIME
/// paths, from the structured body parts).
pub fn extract_section(full: &[u8], body: &MessageBody, section: &Section) -> Vec<u8> {
    match section {
        Section::Full => full.to_vec(),
        Section::Header => header_block(full).to_vec(),
        Section::HeaderFields(fields) => filter_header_fields(header_block(full), fields),
        Section::Text => text_block(full).to_vec(),
        Section::Part(path) => part_content(body, path)
            .unwrap_or_else(|| text_block(full).to_vec()),
    }
}

/// The header block including its terminating blank line.
fn header_block(full: &[u8]) -> &[u8] {
    match find_blank_line(full) {
        Some(pos) => &full[..pos + 4],
        None => full,
    }
}

/// Everything after the first blank-line separator.
fn text_block(full: &[u8]) -> &[u8] {
    match find_blank_line(full) {
        Some(pos) => &full[pos + 4..],
        None => &[],
    }
}

fn find_blank_line(full: &[u8]) -> Option<usize> {
    full.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Keep only the listed headers (case-insensitive), with continuation lines,
/// plus the terminating blank line.
fn filter_header_fields(headers: &[u8], fields: &[String]) -> Vec<u8> {
    let text = String::from_utf8_lossy(headers);
    let mut out = String::new();
    let mut keeping = false;

    for line in text.split("\r\n") {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if keeping {
                out.push_str(line);
                out.push_str("\r\n");
            }
            continue;
        }
        keeping = match line.split_once(':') {
            Some((name, _)) => fields.iter().any(|f| f.eq_ignore_ascii_case(name.trim())),
            None => false,
        };
        if keeping {
            out.push_str(line);
            out.push_str("\r\n");
        }
    }

    out.push_str("\r\n");
    out.into_bytes()
}

/// Numeric MIME path selection: part 1 is the text alternative and part 2
/// the html one when both exist; a single-part message answers any path with
/// its only content.
fn part_content(body: &MessageBody, path: &[u32]) -> Option<Vec<u8>> {
    let part = *path.first()?;
    let content = match (body.text.as_deref(), body.html.as_deref()) {
        (Some(text), Some(html)) => match part {
            1 => text,
            2 => html,
            _ => return None,
        },
        (Some(text), None) => text,
        (None, Some(html)) => html,
        (None, None) => return None,
    };
    Some(to_crlf(content).into_bytes())
}

fn join_addresses(addrs: &[EmailAddress]) -> String {
    addrs
        .iter()
        .map(|a| {
            let email = match (a.mailbox.as_deref(), a.host.as_deref()) {
                (Some(mailbox), Some(host)) => format!("{}@{}", mailbox, host),
                (Some(mailbox), None) => mailbox.to_string(),
                _ => String::new(),
            };
            match &a.name {
                Some(name) => format!("{} <{}>", name, email),
                None => email,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
