//! IMAP command parsing
//!
//! Tokenisation respects double-quoted strings (with backslash escapes),
//! square brackets (BODY sections) and parentheses (flag lists, FETCH sets);
//! whitespace outside any of these separates tokens. Sub-parsers cover
//! sequence sets, FETCH item sets, SEARCH criteria and IMAP date-times.

use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use regex::Regex;

use crate::error::{Error, Result};

use super::framer::CommandFrame;

/// A parsed command ready for dispatch.
#[derive(Debug, Clone)]
pub struct ImapCommand {
    pub tag: String,
    /// Upper-cased command name; `UID FETCH` arrives as name `FETCH` with
    /// `use_uid` set.
    pub name: String,
    pub args: Vec<String>,
    pub use_uid: bool,
    pub literal: Option<Vec<u8>>,
    pub raw: String,
}

impl ImapCommand {
    pub fn parse(frame: CommandFrame) -> Result<Self> {
        let raw = String::from_utf8_lossy(&frame.line).to_string();
        let mut tokens = tokenize(&raw);
        if tokens.len() < 2 {
            return Err(Error::Protocol("Missing command".to_string()));
        }

        let tag = tokens.remove(0);
        let mut name = tokens.remove(0).to_uppercase();
        let mut use_uid = false;
        if name == "UID" {
            if tokens.is_empty() {
                return Err(Error::Protocol("Missing UID subcommand".to_string()));
            }
            name = tokens.remove(0).to_uppercase();
            use_uid = true;
        }

        Ok(Self {
            tag,
            name,
            args: tokens,
            use_uid,
            literal: frame.literal,
            raw,
        })
    }
}

/// Split a command line into argument tokens.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    // Distinguishes a completed empty quoted string from no token at all.
    let mut has_token = false;
    let mut in_quotes = false;
    let mut depth = 0usize;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' if depth == 0 => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '\\' if in_quotes && depth == 0 => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ' ' | '\t' if !in_quotes && depth == 0 => {
                if has_token || !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            '(' | '[' if !in_quotes => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' if !in_quotes => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            _ => current.push(c),
        }
    }
    if has_token || !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// A sequence set (`2,4:7,9,12:*`). `u32::MAX` stands in for `*` until the
/// set is materialised against the selected folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSet {
    ranges: Vec<(u32, u32)>,
}

impl SequenceSet {
    pub fn parse(s: &str) -> Option<Self> {
        let mut ranges = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            let (a, b) = match part.split_once(':') {
                Some((start, end)) => (parse_seq_atom(start)?, parse_seq_atom(end)?),
                None => {
                    let n = parse_seq_atom(part)?;
                    (n, n)
                }
            };
            // start > end is legal; normalise.
            ranges.push(if a <= b { (a, b) } else { (b, a) });
        }
        if ranges.is_empty() {
            return None;
        }
        Some(Self { ranges })
    }

    /// Materialise against a strictly ascending UID vector; `*` is the last
    /// UID. Returns a deduplicated ascending UID list.
    pub fn resolve_uids(&self, uids: &[u32]) -> Vec<u32> {
        let last = match uids.last() {
            Some(&uid) => uid,
            None => return Vec::new(),
        };
        uids.iter()
            .copied()
            .filter(|&uid| self.contains(uid, last))
            .collect()
    }

    /// Materialise as sequence numbers 1..=len.
    pub fn resolve_seqs(&self, len: u32) -> Vec<u32> {
        (1..=len).filter(|&seq| self.contains(seq, len)).collect()
    }

    fn contains(&self, value: u32, max: u32) -> bool {
        self.ranges.iter().any(|&(a, b)| {
            let a = if a == u32::MAX { max } else { a };
            let b = if b == u32::MAX { max } else { b };
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            (lo..=hi).contains(&value)
        })
    }
}

fn parse_seq_atom(s: &str) -> Option<u32> {
    let s = s.trim();
    if s == "*" {
        Some(u32::MAX)
    } else {
        s.parse().ok().filter(|&n| n > 0)
    }
}

/// A BODY section specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    /// `BODY[]` — the whole RFC 822 message.
    Full,
    Header,
    HeaderFields(Vec<String>),
    Text,
    /// Dotted numeric MIME path, e.g. `BODY[1.2]`.
    Part(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchItem {
    Flags,
    Uid,
    InternalDate,
    Rfc822Size,
    Envelope,
    BodyStructure,
    /// Bare `BODY` — BODYSTRUCTURE without extension data.
    BodyShort,
    Rfc822,
    Rfc822Header,
    Rfc822Text,
    Body {
        section: Section,
        partial: Option<(u32, u32)>,
        peek: bool,
    },
}

/// Parse a FETCH item set: a macro, a single item, or a parenthesised list.
pub fn parse_fetch_items(input: &str) -> Result<Vec<FetchItem>> {
    let trimmed = input.trim();
    match trimmed.to_uppercase().as_str() {
        "ALL" => {
            return Ok(vec![
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
            ])
        }
        "FAST" => {
            return Ok(vec![
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
            ])
        }
        "FULL" => {
            return Ok(vec![
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
                FetchItem::BodyShort,
            ])
        }
        _ => {}
    }

    let inner = if trimmed.starts_with('(') && trimmed.ends_with(')') {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };

    let mut items = Vec::new();
    for token in split_bracket_aware(inner) {
        items.push(parse_fetch_item(&token)?);
    }
    if items.is_empty() {
        return Err(Error::Protocol("Empty FETCH item list".to_string()));
    }
    Ok(items)
}

/// Split on spaces that are outside `[...]` and `(...)`.
fn split_bracket_aware(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in s.chars() {
        match c {
            '[' | '(' => {
                depth += 1;
                current.push(c);
            }
            ']' | ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ' ' if depth == 0 => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn parse_fetch_item(token: &str) -> Result<FetchItem> {
    let upper = token.to_uppercase();
    match upper.as_str() {
        "FLAGS" => return Ok(FetchItem::Flags),
        "UID" => return Ok(FetchItem::Uid),
        "INTERNALDATE" => return Ok(FetchItem::InternalDate),
        "RFC822.SIZE" => return Ok(FetchItem::Rfc822Size),
        "ENVELOPE" => return Ok(FetchItem::Envelope),
        "BODYSTRUCTURE" => return Ok(FetchItem::BodyStructure),
        "BODY" => return Ok(FetchItem::BodyShort),
        "RFC822" => return Ok(FetchItem::Rfc822),
        "RFC822.HEADER" => return Ok(FetchItem::Rfc822Header),
        "RFC822.TEXT" => return Ok(FetchItem::Rfc822Text),
        _ => {}
    }

    let (peek, rest) = if upper.starts_with("BODY.PEEK[") {
        (true, &token["BODY.PEEK[".len()..])
    } else if upper.starts_with("BODY[") {
        (false, &token["BODY[".len()..])
    } else {
        return Err(Error::Protocol(format!("Unknown FETCH item: {}", token)));
    };

    let close = rest
        .rfind(']')
        .ok_or_else(|| Error::Protocol(format!("Unterminated BODY section: {}", token)))?;
    let section = parse_section(&rest[..close])?;
    let partial = parse_partial(&rest[close + 1..])?;

    Ok(FetchItem::Body {
        section,
        partial,
        peek,
    })
}

fn parse_section(s: &str) -> Result<Section> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Section::Full);
    }
    let upper = s.to_uppercase();
    if upper == "HEADER" {
        return Ok(Section::Header);
    }
    if upper == "TEXT" {
        return Ok(Section::Text);
    }
    if upper.starts_with("HEADER.FIELDS") {
        let open = s
            .find('(')
            .ok_or_else(|| Error::Protocol("HEADER.FIELDS needs a field list".to_string()))?;
        let close = s
            .rfind(')')
            .ok_or_else(|| Error::Protocol("Unterminated field list".to_string()))?;
        let fields: Vec<String> = s[open + 1..close]
            .split_whitespace()
            .map(|f| f.trim_matches('"').to_string())
            .collect();
        return Ok(Section::HeaderFields(fields));
    }
    if s.chars().all(|c| c.is_ascii_digit() || c == '.') {
        let path: Option<Vec<u32>> = s.split('.').map(|p| p.parse().ok()).collect();
        if let Some(path) = path {
            if !path.is_empty() {
                return Ok(Section::Part(path));
            }
        }
    }
    Err(Error::Protocol(format!("Bad BODY section: {}", s)))
}

/// `<start.length>` after the closing bracket.
fn parse_partial(s: &str) -> Result<Option<(u32, u32)>> {
    if s.is_empty() {
        return Ok(None);
    }
    let inner = s
        .strip_prefix('<')
        .and_then(|rest| rest.strip_suffix('>'))
        .ok_or_else(|| Error::Protocol(format!("Bad FETCH partial: {}", s)))?;
    let (start, length) = inner
        .split_once('.')
        .ok_or_else(|| Error::Protocol(format!("Bad FETCH partial: {}", s)))?;
    match (start.parse(), length.parse()) {
        (Ok(start), Ok(length)) => Ok(Some((start, length))),
        _ => Err(Error::Protocol(format!("Bad FETCH partial: {}", s))),
    }
}

/// SEARCH keywords that consume the following token as their value.
const SEARCH_VALUE_KEYWORDS: &[&str] = &[
    "FROM",
    "TO",
    "CC",
    "BCC",
    "SUBJECT",
    "BODY",
    "TEXT",
    "KEYWORD",
    "UNKEYWORD",
    "BEFORE",
    "ON",
    "SINCE",
    "SENTBEFORE",
    "SENTON",
    "SENTSINCE",
    "UID",
];

/// Linear scan over SEARCH arguments. Criteria are validated for shape only
/// and passed to the upstream unevaluated.
pub fn parse_search_criteria(args: &[String]) -> Result<Vec<String>> {
    let mut criteria = Vec::new();
    let mut index = 0;
    let mut negate = false;

    while index < args.len() {
        let keyword = args[index].to_uppercase();
        index += 1;

        let criterion = if keyword == "NOT" {
            negate = !negate;
            continue;
        } else if SEARCH_VALUE_KEYWORDS.contains(&keyword.as_str()) {
            let value = args
                .get(index)
                .ok_or_else(|| Error::Protocol(format!("{} needs a value", keyword)))?;
            index += 1;
            format!("{} {}", keyword, value)
        } else if keyword == "HEADER" {
            let field = args
                .get(index)
                .ok_or_else(|| Error::Protocol("HEADER needs a field name".to_string()))?;
            let value = args
                .get(index + 1)
                .ok_or_else(|| Error::Protocol("HEADER needs a value".to_string()))?;
            index += 2;
            format!("HEADER {} {}", field, value)
        } else if keyword == "LARGER" || keyword == "SMALLER" {
            let value = args
                .get(index)
                .and_then(|v| v.parse::<u32>().ok())
                .ok_or_else(|| Error::Protocol(format!("{} needs a size", keyword)))?;
            index += 1;
            format!("{} {}", keyword, value)
        } else {
            // Flag keywords, ALL, and raw sequence sets pass through.
            keyword
        };

        if negate {
            criteria.push(format!("NOT {}", criterion));
            negate = false;
        } else {
            criteria.push(criterion);
        }
    }

    Ok(criteria)
}

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

fn date_time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s?(\d{1,2})-([A-Za-z]{3})-(\d{4}) (\d{2}):(\d{2}):(\d{2}) ([+-])(\d{2})(\d{2})$")
            .unwrap()
    })
}

/// Whether a token has IMAP date-time shape (`DD-Mon-YYYY HH:MM:SS +ZZZZ`).
pub fn is_date_time(s: &str) -> bool {
    date_time_regex().is_match(s)
}

/// Parse an IMAP date-time into UTC.
pub fn parse_date_time(s: &str) -> Option<DateTime<Utc>> {
    let caps = date_time_regex().captures(s)?;
    let day: u32 = caps[1].parse().ok()?;
    let month = MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(&caps[2]))? as u32
        + 1;
    let year: i32 = caps[3].parse().ok()?;
    let hour: u32 = caps[4].parse().ok()?;
    let minute: u32 = caps[5].parse().ok()?;
    let second: u32 = caps[6].parse().ok()?;
    let sign = if &caps[7] == "-" { -1 } else { 1 };
    let offset_secs = sign
        * (caps[8].parse::<i32>().ok()? * 3600 + caps[9].parse::<i32>().ok()? * 60);

    let offset = FixedOffset::east_opt(offset_secs)?;
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
    match offset.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        _ => None,
    }
}
