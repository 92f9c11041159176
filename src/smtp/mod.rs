//! SMTP submission front-end (RFC 5321/6409): AUTH + DATA, relayed to the
//! send endpoint as structured JSON.

pub mod command;
pub mod relay;
pub mod response;
pub mod session;

pub use response::SmtpResponse;
pub use session::{SmtpResult, SmtpSession};
