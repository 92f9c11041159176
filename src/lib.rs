//! xmit-mail: IMAP and SMTP gateway for the Transmit mailbox API
//!
//! The gateway terminates IMAP4rev1 (with IDLE, NAMESPACE, UIDPLUS, MOVE and
//! SPECIAL-USE) and SMTP submission, translating both into REST calls. The
//! upstream service is the source of truth; the gateway holds a two-tier
//! cache and no mail storage of its own.

pub mod cache;
pub mod config;
pub mod error;
pub mod imap;
pub mod server;
pub mod smtp;
pub mod tls;
pub mod upstream;

pub use config::GatewayConfig;
pub use error::{Error, Result};
