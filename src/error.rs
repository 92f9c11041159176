//! Gateway error taxonomy
//!
//! Every error a handler can produce maps onto a wire response: IMAP tagged
//! NO/BAD (see `imap::session`) or an SMTP reply code (see `smtp::response`).
//! Nothing bubbles out of a session.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Framer or parser rejected the input.
    #[error("{0}")]
    Protocol(String),

    /// Command not allowed in the current session state.
    #[error("Command not allowed in this state: {0}")]
    BadState(String),

    /// Bad key format, upstream rejected the key, or sender not found.
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Mailbox not found: {0}")]
    MailboxNotFound(String),

    #[error("Message too large ({0} bytes)")]
    TooLarge(usize),

    #[error("Rate limited by upstream")]
    RateLimited,

    #[error("Upstream request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    /// Non-2xx upstream reply that is not auth/not-found/rate-limit.
    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cache store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry inside the upstream adapter may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout
                | Error::Network(_)
                | Error::RateLimited
                | Error::Upstream { status: 502, .. }
                | Error::Upstream { status: 503, .. }
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Network(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
