//! IMAP4rev1 protocol engine (RFC 3501 plus IDLE, NAMESPACE, UIDPLUS, MOVE
//! and SPECIAL-USE).

pub mod command;
pub mod framer;
pub mod mailbox;
pub mod response;
pub mod session;

pub use framer::{CommandFrame, FrameEvent, Framer};
pub use response::Response;
pub use session::{ImapSession, SessionState};
