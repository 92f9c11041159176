//! Data types exchanged with the Transmit mailbox API.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A sending identity ("account") in the workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    pub id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// RFC 6154 folder role reported by the upstream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FolderRole {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Archive,
    Junk,
}

impl FolderRole {
    /// The special-use backslash atom advertised in LIST.
    pub fn special_use_flag(&self) -> &'static str {
        match self {
            FolderRole::Inbox => "\\Inbox",
            FolderRole::Sent => "\\Sent",
            FolderRole::Drafts => "\\Drafts",
            FolderRole::Trash => "\\Trash",
            FolderRole::Archive => "\\Archive",
            FolderRole::Junk => "\\Junk",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxFolder {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<FolderRole>,
    #[serde(default)]
    pub flags: Vec<String>,
    pub uid_validity: u32,
    pub uid_next: u32,
    #[serde(default)]
    pub total_messages: u32,
    #[serde(default)]
    pub unread_messages: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderStatus {
    pub exists: u32,
    #[serde(default)]
    pub recent: u32,
    #[serde(default)]
    pub unseen: u32,
    pub uid_validity: u32,
    pub uid_next: u32,
    #[serde(default)]
    pub highest_mod_seq: u64,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub permanent_flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxMessage {
    pub uid: u32,
    #[serde(default)]
    pub flags: Vec<String>,
    pub internal_date: DateTime<Utc>,
    #[serde(default)]
    pub size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_structure: Option<BodyStructure>,
    /// Attached by the gateway after a body fetch; never part of listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<MessageBody>,
}

impl MailboxMessage {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Vec<EmailAddress>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Vec<EmailAddress>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Vec<EmailAddress>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Vec<EmailAddress>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<Vec<EmailAddress>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bcc: Option<Vec<EmailAddress>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmailAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Source route; effectively always absent in practice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl EmailAddress {
    pub fn parse(addr: &str) -> Self {
        let (mailbox, host) = match addr.split_once('@') {
            Some((m, h)) => (Some(m.to_string()), Some(h.to_string())),
            None => (Some(addr.to_string()), None),
        };
        Self {
            name: None,
            adl: None,
            mailbox,
            host,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BodyStructure {
    #[serde(rename = "type")]
    pub part_type: String,
    pub subtype: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<BodyStructure>>,
}

fn default_encoding() -> String {
    "7BIT".to_string()
}

impl BodyStructure {
    pub fn is_multipart(&self) -> bool {
        self.parts.as_ref().map_or(false, |p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    /// Raw header block when the upstream has it; CRLF line endings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<String>,
}

/// Metadata fields the gateway can ask listings to include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FetchField {
    Uid,
    Flags,
    InternalDate,
    Size,
    Envelope,
    BodyStructure,
}

impl FetchField {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchField::Uid => "uid",
            FetchField::Flags => "flags",
            FetchField::InternalDate => "internalDate",
            FetchField::Size => "size",
            FetchField::Envelope => "envelope",
            FetchField::BodyStructure => "bodyStructure",
        }
    }
}

/// Listing query; `canonical` is the cache-key suffix.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub uids: Option<Vec<u32>>,
    pub fields: Vec<FetchField>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl MessageQuery {
    pub fn canonical(&self) -> String {
        let mut parts = Vec::new();
        if let Some(uids) = &self.uids {
            let list: Vec<String> = uids.iter().map(|u| u.to_string()).collect();
            parts.push(format!("uids={}", list.join(",")));
        }
        if !self.fields.is_empty() {
            let mut fields: Vec<&str> = self.fields.iter().map(|f| f.as_str()).collect();
            fields.sort_unstable();
            parts.push(format!("fields={}", fields.join(",")));
        }
        if let Some(limit) = self.limit {
            parts.push(format!("limit={}", limit));
        }
        if let Some(offset) = self.offset {
            parts.push(format!("offset={}", offset));
        }
        parts.join("&")
    }
}

/// How a STORE maps onto the flags endpoint.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlagAction {
    Set,
    Add,
    Remove,
}

/// Message submitted through the SMTP relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub from: String,
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_canonical_is_stable() {
        let q = MessageQuery {
            uids: Some(vec![3, 1, 7]),
            fields: vec![FetchField::Flags, FetchField::Envelope],
            limit: Some(100),
            offset: None,
        };
        assert_eq!(q.canonical(), "uids=3,1,7&fields=envelope,flags&limit=100");
        assert_eq!(MessageQuery::default().canonical(), "");
    }

    #[test]
    fn test_address_parse() {
        let a = EmailAddress::parse("ada@acme.com");
        assert_eq!(a.mailbox.as_deref(), Some("ada"));
        assert_eq!(a.host.as_deref(), Some("acme.com"));
    }

    #[test]
    fn test_folder_deserialize_with_role() {
        let folder: MailboxFolder = serde_json::from_str(
            r#"{"id":"f1","name":"Inbox","role":"inbox","uidValidity":4,"uidNext":12,"totalMessages":3,"unreadMessages":1}"#,
        )
        .unwrap();
        assert_eq!(folder.role, Some(FolderRole::Inbox));
        assert_eq!(folder.role.unwrap().special_use_flag(), "\\Inbox");
    }
}
