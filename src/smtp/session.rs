//! SMTP submission session
//!
//! One session per connection: HELO/EHLO, STARTTLS, AUTH PLAIN/LOGIN
//! against the API key, then MAIL/RCPT/DATA. A completed DATA payload is
//! parsed and posted to the send endpoint; reply codes map from the error
//! kind. The session is a state machine fed raw bytes by the server loop.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::config::GatewayConfig;
use crate::error::Error;
use crate::imap::session::decode_b64;
use crate::upstream::{is_valid_key_format, MailboxBackend};

use super::command::{self, parse_command, SmtpCommand};
use super::relay;
use super::response::SmtpResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmtpState {
    /// Waiting for HELO/EHLO.
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
    /// Collecting DATA until <CRLF>.<CRLF>.
    Data,
    Closing,
}

/// Outcome of feeding bytes to the session.
#[derive(Debug, Default)]
pub struct SmtpResult {
    pub response: Vec<u8>,
    pub should_close: bool,
    pub start_tls: bool,
}

struct AuthInProgress {
    mechanism: String,
    username: Option<String>,
}

pub struct SmtpSession {
    state: SmtpState,
    hostname: String,
    peer: String,
    tls_active: bool,
    tls_available: bool,
    api_key: Option<String>,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    buffer: Vec<u8>,
    auth_in_progress: Option<AuthInProgress>,
    backend: Arc<dyn MailboxBackend>,
    config: Arc<GatewayConfig>,
}

impl SmtpSession {
    pub fn new(
        hostname: &str,
        peer: String,
        tls_active: bool,
        tls_available: bool,
        backend: Arc<dyn MailboxBackend>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            state: SmtpState::Connected,
            hostname: hostname.to_string(),
            peer,
            tls_active,
            tls_available,
            api_key: None,
            mail_from: None,
            rcpt_to: Vec::new(),
            buffer: Vec::new(),
            auth_in_progress: None,
            backend,
            config,
        }
    }

    pub fn greeting(&self) -> Vec<u8> {
        SmtpResponse::service_ready(&self.hostname).to_bytes()
    }

    /// Called by the server loop after the STARTTLS handshake completes.
    pub fn tls_established(&mut self) {
        self.tls_active = true;
        // RFC 3207: the session restarts from the greeting state.
        self.state = SmtpState::Connected;
        self.reset_transaction();
        self.buffer.clear();
    }

    /// Feed raw socket bytes; returns the accumulated replies.
    pub async fn process_input(&mut self, data: &[u8]) -> SmtpResult {
        self.buffer.extend_from_slice(data);

        let mut result = SmtpResult::default();
        loop {
            if result.should_close || result.start_tls {
                break;
            }

            if self.state == SmtpState::Data {
                let Some((message, consumed)) = take_data(&self.buffer) else {
                    break;
                };
                self.buffer.drain(..consumed);
                let reply = self.handle_message(&message).await;
                result.response.extend_from_slice(&reply);
                continue;
            }

            let Some(line_end) = find_crlf(&self.buffer) else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..line_end + 2).take(line_end).collect();
            let line = String::from_utf8_lossy(&line).to_string();

            let (reply, close, start_tls) = if self.auth_in_progress.is_some() {
                (self.continue_auth(&line).await, false, false)
            } else {
                self.handle_line(&line).await
            };
            result.response.extend_from_slice(&reply);
            result.should_close = close;
            result.start_tls = start_tls;
        }
        result
    }

    async fn handle_line(&mut self, line: &str) -> (Vec<u8>, bool, bool) {
        if line.is_empty() {
            return (Vec::new(), false, false);
        }
        tracing::debug!(peer = %self.peer, "SMTP C: {}", line);

        match parse_command(line) {
            SmtpCommand::Helo(domain) => (self.handle_helo(domain, false), false, false),
            SmtpCommand::Ehlo(domain) => (self.handle_helo(domain, true), false, false),
            SmtpCommand::StartTls => self.handle_starttls(),
            SmtpCommand::Auth {
                mechanism,
                initial_response,
            } => (
                self.handle_auth(&mechanism, initial_response.as_deref())
                    .await,
                false,
                false,
            ),
            SmtpCommand::MailFrom {
                address,
                parameters,
            } => (self.handle_mail_from(address, &parameters), false, false),
            SmtpCommand::RcptTo { address } => (self.handle_rcpt_to(address), false, false),
            SmtpCommand::Data => (self.handle_data(), false, false),
            SmtpCommand::Rset => {
                self.reset_transaction();
                if self.state != SmtpState::Connected {
                    self.state = SmtpState::Greeted;
                }
                (SmtpResponse::ok("OK").to_bytes(), false, false)
            }
            SmtpCommand::Vrfy(_) => (
                SmtpResponse::new(252, "Cannot VRFY user, but will accept message").to_bytes(),
                false,
                false,
            ),
            SmtpCommand::Noop => (SmtpResponse::ok("OK").to_bytes(), false, false),
            SmtpCommand::Quit => {
                self.state = SmtpState::Closing;
                (
                    SmtpResponse::service_closing(&self.hostname).to_bytes(),
                    true,
                    false,
                )
            }
            SmtpCommand::Unknown(_) => (SmtpResponse::syntax_error().to_bytes(), false, false),
        }
    }

    fn handle_helo(&mut self, domain: String, esmtp: bool) -> Vec<u8> {
        self.state = SmtpState::Greeted;
        self.reset_transaction();
        tracing::debug!(peer = %self.peer, "SMTP greeted by {}", domain);

        if !esmtp {
            return SmtpResponse::ok(format!("{} Hello {}", self.hostname, domain)).to_bytes();
        }

        let mut lines = vec![
            format!("{} Hello {}", self.hostname, domain),
            format!("SIZE {}", self.config.max_message_size),
            "PIPELINING".to_string(),
            "8BITMIME".to_string(),
        ];
        if self.tls_available && !self.tls_active {
            lines.push("STARTTLS".to_string());
        }
        if self.auth_allowed() {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        SmtpResponse::multiline(250, &lines)
    }

    fn handle_starttls(&mut self) -> (Vec<u8>, bool, bool) {
        if self.tls_active {
            return (SmtpResponse::bad_sequence().to_bytes(), false, false);
        }
        if !self.tls_available {
            return (SmtpResponse::not_implemented().to_bytes(), false, false);
        }
        (
            SmtpResponse::new(220, "Ready to start TLS").to_bytes(),
            false,
            true,
        )
    }

    /// AUTH is offered on plaintext only in development.
    fn auth_allowed(&self) -> bool {
        self.tls_active || !self.config.production
    }

    async fn handle_auth(&mut self, mechanism: &str, initial: Option<&str>) -> Vec<u8> {
        if self.state == SmtpState::Connected {
            return SmtpResponse::bad_sequence().to_bytes();
        }
        if self.api_key.is_some() {
            return SmtpResponse::new(503, "Already authenticated").to_bytes();
        }
        if !self.auth_allowed() {
            return SmtpResponse::auth_encryption_required().to_bytes();
        }

        match mechanism {
            "PLAIN" => match initial {
                Some(response) => self.finish_auth_plain(response).await,
                None => {
                    self.auth_in_progress = Some(AuthInProgress {
                        mechanism: "PLAIN".to_string(),
                        username: None,
                    });
                    SmtpResponse::auth_continue("").to_bytes()
                }
            },
            "LOGIN" => {
                self.auth_in_progress = Some(AuthInProgress {
                    mechanism: "LOGIN".to_string(),
                    username: None,
                });
                // base64("Username:")
                SmtpResponse::auth_continue("VXNlcm5hbWU6").to_bytes()
            }
            _ => SmtpResponse::new(504, "Unrecognized authentication type").to_bytes(),
        }
    }

    async fn continue_auth(&mut self, line: &str) -> Vec<u8> {
        let mut auth = match self.auth_in_progress.take() {
            Some(auth) => auth,
            None => return SmtpResponse::bad_sequence().to_bytes(),
        };

        if line == "*" {
            return SmtpResponse::new(501, "Authentication aborted").to_bytes();
        }

        match auth.mechanism.as_str() {
            "PLAIN" => self.finish_auth_plain(line).await,
            "LOGIN" => match auth.username.take() {
                None => {
                    let username = match decode_b64(line) {
                        Some(username) => username,
                        None => return SmtpResponse::auth_failed().to_bytes(),
                    };
                    auth.username = Some(username);
                    self.auth_in_progress = Some(auth);
                    // base64("Password:")
                    SmtpResponse::auth_continue("UGFzc3dvcmQ6").to_bytes()
                }
                Some(username) => match decode_b64(line) {
                    Some(password) => self.authenticate(&username, &password).await,
                    None => SmtpResponse::auth_failed().to_bytes(),
                },
            },
            _ => SmtpResponse::auth_failed().to_bytes(),
        }
    }

    async fn finish_auth_plain(&mut self, response: &str) -> Vec<u8> {
        let decoded = match BASE64.decode(response.trim()) {
            Ok(decoded) => decoded,
            Err(_) => return SmtpResponse::auth_failed().to_bytes(),
        };
        let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
        let (username, password) = match parts.len() {
            3 => (parts[1], parts[2]),
            2 => (parts[0], parts[1]),
            _ => return SmtpResponse::auth_failed().to_bytes(),
        };
        let username = String::from_utf8_lossy(username).to_string();
        let password = String::from_utf8_lossy(password).to_string();
        self.authenticate(&username, &password).await
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> Vec<u8> {
        if !is_valid_key_format(password) {
            return SmtpResponse::auth_failed().to_bytes();
        }
        match self.backend.validate_key(password).await {
            Ok(workspace) => {
                tracing::info!(
                    peer = %self.peer,
                    workspace = %workspace,
                    "SMTP authenticated as {}",
                    username
                );
                self.api_key = Some(password.to_string());
                SmtpResponse::auth_successful().to_bytes()
            }
            Err(Error::Auth(_)) => SmtpResponse::auth_failed().to_bytes(),
            Err(e) => SmtpResponse::for_error(&e).to_bytes(),
        }
    }

    fn handle_mail_from(&mut self, address: String, parameters: &[String]) -> Vec<u8> {
        if self.state == SmtpState::Connected {
            return SmtpResponse::bad_sequence().to_bytes();
        }
        if self.api_key.is_none() {
            return SmtpResponse::auth_required().to_bytes();
        }
        if let Some(size) = command::declared_size(parameters) {
            if size > self.config.max_message_size {
                return SmtpResponse::message_too_large().to_bytes();
            }
        }

        self.reset_transaction();
        self.mail_from = Some(address.clone());
        self.state = SmtpState::MailFrom;
        SmtpResponse::ok(format!("OK <{}>", address)).to_bytes()
    }

    fn handle_rcpt_to(&mut self, address: String) -> Vec<u8> {
        if self.state != SmtpState::MailFrom && self.state != SmtpState::RcptTo {
            return SmtpResponse::bad_sequence().to_bytes();
        }
        if !address.contains('@') {
            return SmtpResponse::mailbox_unavailable("invalid recipient address").to_bytes();
        }
        self.rcpt_to.push(address.clone());
        self.state = SmtpState::RcptTo;
        SmtpResponse::ok(format!("OK <{}>", address)).to_bytes()
    }

    fn handle_data(&mut self) -> Vec<u8> {
        if self.state != SmtpState::RcptTo {
            return SmtpResponse::bad_sequence().to_bytes();
        }
        self.state = SmtpState::Data;
        SmtpResponse::start_mail_input().to_bytes()
    }

    async fn handle_message(&mut self, data: &[u8]) -> Vec<u8> {
        let mail_from = self.mail_from.take().unwrap_or_default();
        let rcpt_to = std::mem::take(&mut self.rcpt_to);
        self.state = SmtpState::Greeted;

        if data.len() > self.config.max_message_size {
            return SmtpResponse::message_too_large().to_bytes();
        }
        let key = match &self.api_key {
            Some(key) => key.clone(),
            None => return SmtpResponse::auth_required().to_bytes(),
        };

        let message = match relay::build_outbound(&mail_from, &rcpt_to, data) {
            Ok(message) => message,
            Err(e) => {
                tracing::info!(peer = %self.peer, "Rejecting submission: {}", e);
                return SmtpResponse::for_error(&e).to_bytes();
            }
        };

        match self.backend.send_message(&key, &message).await {
            Ok(()) => {
                tracing::info!(
                    peer = %self.peer,
                    from = %message.from,
                    recipients = message.to.len() + message.cc.len() + message.bcc.len(),
                    size = data.len(),
                    "Message accepted for delivery"
                );
                SmtpResponse::ok("OK Message accepted for delivery").to_bytes()
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer, "Send failed: {}", e);
                SmtpResponse::for_error(&e).to_bytes()
            }
        }
    }

    fn reset_transaction(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Extract a complete DATA payload (dot-unstuffed, terminator consumed).
/// Returns the message bytes and how many buffer bytes were consumed.
fn take_data(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    // Message with an empty body: terminator arrives first.
    if buf.starts_with(b".\r\n") {
        return Some((Vec::new(), 3));
    }
    let pos = buf.windows(5).position(|w| w == b"\r\n.\r\n")?;
    let data = unstuff_dots(&buf[..pos + 2]);
    Some((data, pos + 5))
}

/// Reverse SMTP dot transparency: strip one leading dot per line.
fn unstuff_dots(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut line_start = true;
    let mut iter = data.iter().peekable();
    while let Some(&b) = iter.next() {
        if line_start && b == b'.' {
            line_start = false;
            continue;
        }
        out.push(b);
        if b == b'\n' {
            line_start = true;
        } else if b != b'\r' {
            line_start = false;
        }
    }
    out
}
