//! Submission relay: parsed MIME → outbound API message
//!
//! The gateway never forwards raw RFC 822 to the send endpoint; it parses
//! the DATA payload and posts the structured message the API expects.

use mail_parser::{Address, MessageParser};

use crate::error::{Error, Result};
use crate::upstream::types::OutboundMessage;

/// Build the outbound API message from a completed SMTP transaction.
///
/// Envelope recipients that do not appear in the To/Cc headers are carried
/// as Bcc so nothing accepted at RCPT time is dropped.
pub fn build_outbound(
    mail_from: &str,
    rcpt_to: &[String],
    raw: &[u8],
) -> Result<OutboundMessage> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| Error::Protocol("Unparseable message data".to_string()))?;

    let from = if mail_from.contains('@') {
        mail_from.to_string()
    } else {
        header_addresses(parsed.from())
            .into_iter()
            .next()
            .ok_or_else(|| Error::MailboxNotFound("missing sender address".to_string()))?
    };

    let mut to = header_addresses(parsed.to());
    let cc = header_addresses(parsed.cc());
    let mut bcc = header_addresses(parsed.bcc());

    for rcpt in rcpt_to {
        let known = to
            .iter()
            .chain(cc.iter())
            .chain(bcc.iter())
            .any(|a| a.eq_ignore_ascii_case(rcpt));
        if !known {
            bcc.push(rcpt.clone());
        }
    }
    if to.is_empty() && cc.is_empty() {
        to = std::mem::take(&mut bcc);
    }
    if to.is_empty() && cc.is_empty() && bcc.is_empty() {
        return Err(Error::MailboxNotFound("no valid recipients".to_string()));
    }

    let text = parsed.body_text(0).map(|body| body.to_string());
    let html = parsed.body_html(0).map(|body| body.to_string());

    let mut headers = std::collections::BTreeMap::new();
    if let Some(message_id) = parsed.message_id() {
        headers.insert("Message-ID".to_string(), format!("<{}>", message_id));
    }
    let reply_to = header_addresses(parsed.reply_to());
    if !reply_to.is_empty() {
        headers.insert("Reply-To".to_string(), reply_to.join(", "));
    }

    Ok(OutboundMessage {
        from,
        to,
        cc,
        bcc,
        subject: parsed.subject().map(|s| s.to_string()),
        text,
        html,
        headers,
    })
}

fn header_addresses(address: Option<&Address<'_>>) -> Vec<String> {
    match address {
        Some(address) => address
            .iter()
            .filter_map(|addr| addr.address.as_ref().map(|a| a.to_string()))
            .collect(),
        None => Vec::new(),
    }
}
