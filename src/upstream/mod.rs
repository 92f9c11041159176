//! Typed façade over the remote mailbox service.
//!
//! `MailboxBackend` is the seam between the protocol engines and the REST
//! transport: sessions hold an `Arc<dyn MailboxBackend>` and never see HTTP.
//! `TransmitClient` is the production implementation; tests substitute an
//! in-memory fake.

mod client;
pub mod types;

pub use client::TransmitClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use types::{
    FlagAction, FolderStatus, MailboxFolder, MailboxMessage, MessageBody, MessageQuery,
    OutboundMessage, Sender,
};

/// API key prefixes accepted before any upstream call is made.
pub fn is_valid_key_format(key: &str) -> bool {
    key.starts_with("pm_live_") || key.starts_with("pm_test_")
}

#[async_trait]
pub trait MailboxBackend: Send + Sync {
    /// Validate an API key; returns the workspace id. Failures are never
    /// cached so a transient upstream error cannot stick as a denial.
    async fn validate_key(&self, key: &str) -> Result<String>;

    async fn list_senders(&self, key: &str) -> Result<Vec<Sender>>;

    async fn sender_by_email(&self, key: &str, email: &str) -> Result<Option<Sender>>;

    async fn list_folders(&self, key: &str, sender_id: &str) -> Result<Vec<MailboxFolder>>;

    async fn folder_status(&self, key: &str, sender_id: &str, folder: &str)
        -> Result<FolderStatus>;

    async fn list_messages(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        query: &MessageQuery,
    ) -> Result<Vec<MailboxMessage>>;

    /// None when the upstream declines to return the message.
    async fn get_message(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        uid: u32,
    ) -> Result<Option<MailboxMessage>>;

    async fn get_body(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        uid: u32,
        peek: bool,
    ) -> Result<Option<MessageBody>>;

    /// Returns the new flag set.
    async fn update_flags(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        uid: u32,
        action: FlagAction,
        flags: &[String],
    ) -> Result<Vec<String>>;

    /// Returns the UID assigned in the target folder.
    async fn copy_message(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        target: &str,
        uid: u32,
    ) -> Result<u32>;

    /// Returns the UID assigned in the target folder.
    async fn move_message(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        target: &str,
        uid: u32,
    ) -> Result<u32>;

    /// Returns the UID assigned to the appended message.
    async fn append_message(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        raw: &[u8],
        flags: &[String],
        date: Option<DateTime<Utc>>,
    ) -> Result<u32>;

    async fn delete_message(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        uid: u32,
        expunge: bool,
    ) -> Result<()>;

    /// Criteria travel unevaluated; the upstream answers with UIDs.
    async fn search(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        criteria: &[String],
    ) -> Result<Vec<u32>>;

    async fn sync_mailbox(&self, key: &str, sender_id: &str) -> Result<()>;

    async fn create_folder(&self, key: &str, sender_id: &str, name: &str) -> Result<()>;

    async fn delete_folder(&self, key: &str, sender_id: &str, folder_id: &str) -> Result<()>;

    async fn send_message(&self, key: &str, message: &OutboundMessage) -> Result<()>;
}
