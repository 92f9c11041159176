//! SMTP reply codes (RFC 5321) and the gateway's error-kind mapping.

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }

    /// Multi-line reply (EHLO capability block).
    pub fn multiline(code: u16, lines: &[String]) -> Vec<u8> {
        let mut out = String::new();
        for (i, line) in lines.iter().enumerate() {
            let sep = if i + 1 == lines.len() { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", code, sep, line));
        }
        out.into_bytes()
    }

    // === Standard replies ===

    pub fn service_ready(hostname: &str) -> Self {
        Self::new(220, format!("{} ESMTP Transmit Mail Ready", hostname))
    }

    pub fn service_closing(hostname: &str) -> Self {
        Self::new(221, format!("{} Service closing transmission channel", hostname))
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(250, message)
    }

    pub fn start_mail_input() -> Self {
        Self::new(354, "Start mail input; end with <CRLF>.<CRLF>")
    }

    pub fn service_unavailable() -> Self {
        Self::new(421, "Service not available, closing transmission channel")
    }

    pub fn local_error() -> Self {
        Self::new(451, "Requested action aborted: local error in processing")
    }

    pub fn rate_limited() -> Self {
        Self::new(451, "Rate limited, try again later")
    }

    pub fn syntax_error() -> Self {
        Self::new(500, "Syntax error, command unrecognized")
    }

    pub fn not_implemented() -> Self {
        Self::new(502, "Command not implemented")
    }

    pub fn bad_sequence() -> Self {
        Self::new(503, "Bad sequence of commands")
    }

    pub fn mailbox_unavailable(reason: &str) -> Self {
        Self::new(550, format!("Requested action not taken: {}", reason))
    }

    pub fn message_too_large() -> Self {
        Self::new(552, "Requested mail action aborted: exceeded storage allocation")
    }

    // === Authentication replies ===

    pub fn auth_successful() -> Self {
        Self::new(235, "2.7.0 Authentication successful")
    }

    pub fn auth_continue(challenge: &str) -> Self {
        Self::new(334, challenge)
    }

    pub fn auth_required() -> Self {
        Self::new(530, "5.7.0 Authentication required")
    }

    pub fn auth_failed() -> Self {
        Self::new(535, "5.7.8 Authentication credentials invalid")
    }

    pub fn auth_encryption_required() -> Self {
        Self::new(538, "5.7.11 Encryption required for requested authentication mechanism")
    }

    /// Map a gateway error onto the wire reply for a failed submission.
    pub fn for_error(e: &Error) -> Self {
        match e {
            Error::Auth(_) => Self::auth_failed(),
            Error::MailboxNotFound(reason) => Self::mailbox_unavailable(reason),
            Error::TooLarge(_) => Self::message_too_large(),
            Error::RateLimited => Self::rate_limited(),
            Error::Timeout | Error::Network(_) => Self::service_unavailable(),
            Error::Upstream { status, .. } if *status >= 500 => Self::service_unavailable(),
            _ => Self::local_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_bytes() {
        assert_eq!(
            SmtpResponse::ok("OK").to_bytes(),
            b"250 OK\r\n".to_vec()
        );
    }

    #[test]
    fn test_multiline_block() {
        let lines = vec![
            "mail.example.com".to_string(),
            "SIZE 1024".to_string(),
            "AUTH PLAIN LOGIN".to_string(),
        ];
        assert_eq!(
            SmtpResponse::multiline(250, &lines),
            b"250-mail.example.com\r\n250-SIZE 1024\r\n250 AUTH PLAIN LOGIN\r\n".to_vec()
        );
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(SmtpResponse::for_error(&Error::Auth("x".into())).code, 535);
        assert_eq!(
            SmtpResponse::for_error(&Error::MailboxNotFound("x".into())).code,
            550
        );
        assert_eq!(SmtpResponse::for_error(&Error::TooLarge(11)).code, 552);
        assert_eq!(SmtpResponse::for_error(&Error::RateLimited).code, 451);
        assert_eq!(SmtpResponse::for_error(&Error::Timeout).code, 421);
        assert_eq!(
            SmtpResponse::for_error(&Error::Upstream {
                status: 503,
                message: String::new()
            })
            .code,
            421
        );
        assert_eq!(
            SmtpResponse::for_error(&Error::Internal("x".into())).code,
            451
        );
    }
}
