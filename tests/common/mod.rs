//! In-memory MailboxBackend used by the wire-level tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use xmit_mail::error::{Error, Result};
use xmit_mail::upstream::types::{
    EmailAddress, Envelope, FlagAction, FolderRole, FolderStatus, MailboxFolder, MailboxMessage,
    MessageBody, MessageQuery, OutboundMessage, Sender,
};
use xmit_mail::upstream::MailboxBackend;

pub const API_KEY: &str = "pm_live_test_key_0001";
pub const SENDER_ID: &str = "s1";
pub const SENDER_EMAIL: &str = "support@acme.com";

#[derive(Clone)]
pub struct StoredMessage {
    pub meta: MailboxMessage,
    pub body: MessageBody,
}

pub struct FakeState {
    pub senders: Vec<Sender>,
    pub folders: HashMap<String, Vec<MailboxFolder>>,
    /// (sender id, folder name) -> messages, ascending by UID.
    pub messages: HashMap<(String, String), Vec<StoredMessage>>,
    pub uid_next: HashMap<(String, String), u32>,
    pub sent: Vec<OutboundMessage>,
    /// Next SEARCH returns these UIDs.
    pub search_results: Vec<u32>,
}

pub struct FakeBackend {
    pub state: Mutex<FakeState>,
}

fn folder(id: &str, name: &str, role: Option<FolderRole>, uid_validity: u32) -> MailboxFolder {
    MailboxFolder {
        id: id.to_string(),
        name: name.to_string(),
        role,
        flags: Vec::new(),
        uid_validity,
        uid_next: 1,
        total_messages: 0,
        unread_messages: 0,
    }
}

fn message(uid: u32, subject: &str, seen: bool, date: DateTime<Utc>) -> StoredMessage {
    let text = format!("Body of {}\r\n", subject);
    let headers = format!(
        "From: Ada <ada@acme.com>\r\nTo: {}\r\nSubject: {}\r\n",
        SENDER_EMAIL, subject
    );
    let mut flags = Vec::new();
    if seen {
        flags.push("\\Seen".to_string());
    }
    StoredMessage {
        meta: MailboxMessage {
            uid,
            flags,
            internal_date: date,
            size: (headers.len() + 2 + text.len()) as u32,
            envelope: Some(Envelope {
                date: Some(date.to_rfc2822()),
                subject: Some(subject.to_string()),
                from: Some(vec![EmailAddress {
                    name: Some("Ada".to_string()),
                    adl: None,
                    mailbox: Some("ada".to_string()),
                    host: Some("acme.com".to_string()),
                }]),
                to: Some(vec![EmailAddress::parse(SENDER_EMAIL)]),
                ..Envelope::default()
            }),
            body_structure: None,
            body: None,
        },
        body: MessageBody {
            text: Some(text),
            html: None,
            headers: Some(headers),
        },
    }
}

impl FakeBackend {
    /// One sender with the standard folders; Inbox holds UIDs 10, 20, 30
    /// (20 unseen).
    pub fn with_fixture() -> Arc<Self> {
        let sender = Sender {
            id: SENDER_ID.to_string(),
            email: SENDER_EMAIL.to_string(),
            name: Some("Support".to_string()),
        };

        let mut folders = HashMap::new();
        folders.insert(
            SENDER_ID.to_string(),
            vec![
                folder("f1", "Inbox", Some(FolderRole::Inbox), 99),
                folder("f2", "Sent", Some(FolderRole::Sent), 42),
                folder("f3", "Drafts", Some(FolderRole::Drafts), 43),
                folder("f4", "Trash", Some(FolderRole::Trash), 44),
            ],
        );

        let base = Utc.with_ymd_and_hms(2026, 1, 20, 12, 0, 0).unwrap();
        let inbox = vec![
            message(10, "first", true, base),
            message(20, "second", false, base + chrono::Duration::hours(1)),
            message(30, "third", true, base + chrono::Duration::hours(2)),
        ];

        let mut messages = HashMap::new();
        let mut uid_next = HashMap::new();
        for name in ["Inbox", "Sent", "Drafts", "Trash"] {
            let key = (SENDER_ID.to_string(), name.to_string());
            messages.insert(key.clone(), Vec::new());
            uid_next.insert(key, 1);
        }
        messages.insert(
            (SENDER_ID.to_string(), "Inbox".to_string()),
            inbox,
        );
        uid_next.insert((SENDER_ID.to_string(), "Inbox".to_string()), 31);

        Arc::new(Self {
            state: Mutex::new(FakeState {
                senders: vec![sender],
                folders,
                messages,
                uid_next,
                sent: Vec::new(),
                search_results: Vec::new(),
            }),
        })
    }

    pub fn set_search_results(&self, uids: &[u32]) {
        self.state.lock().unwrap().search_results = uids.to_vec();
    }

    pub fn uids_in(&self, folder: &str) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        state
            .messages
            .get(&(SENDER_ID.to_string(), folder.to_string()))
            .map(|msgs| msgs.iter().map(|m| m.meta.uid).collect())
            .unwrap_or_default()
    }

    pub fn flags_of(&self, folder: &str, uid: u32) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .messages
            .get(&(SENDER_ID.to_string(), folder.to_string()))
            .and_then(|msgs| msgs.iter().find(|m| m.meta.uid == uid))
            .map(|m| m.meta.flags.clone())
            .unwrap_or_default()
    }

    pub fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.state.lock().unwrap().sent.clone()
    }

    fn check_key(&self, key: &str) -> Result<()> {
        if key == API_KEY {
            Ok(())
        } else {
            Err(Error::Auth("unknown key".to_string()))
        }
    }

    fn folder_key(&self, sender_id: &str, folder: &str) -> (String, String) {
        (sender_id.to_string(), folder.to_string())
    }
}

#[async_trait]
impl MailboxBackend for FakeBackend {
    async fn validate_key(&self, key: &str) -> Result<String> {
        self.check_key(key)?;
        Ok("ws1".to_string())
    }

    async fn list_senders(&self, key: &str) -> Result<Vec<Sender>> {
        self.check_key(key)?;
        Ok(self.state.lock().unwrap().senders.clone())
    }

    async fn sender_by_email(&self, key: &str, email: &str) -> Result<Option<Sender>> {
        self.check_key(key)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .senders
            .iter()
            .find(|s| s.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn list_folders(&self, key: &str, sender_id: &str) -> Result<Vec<MailboxFolder>> {
        self.check_key(key)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .folders
            .get(sender_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn folder_status(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
    ) -> Result<FolderStatus> {
        self.check_key(key)?;
        let state = self.state.lock().unwrap();
        let meta = state
            .folders
            .get(sender_id)
            .and_then(|fs| fs.iter().find(|f| f.name.eq_ignore_ascii_case(folder)))
            .ok_or_else(|| Error::MailboxNotFound(folder.to_string()))?;
        let msgs = state
            .messages
            .get(&self.folder_key(sender_id, &meta.name))
            .cloned()
            .unwrap_or_default();
        let uid_next = state
            .uid_next
            .get(&self.folder_key(sender_id, &meta.name))
            .copied()
            .unwrap_or(1);
        Ok(FolderStatus {
            exists: msgs.len() as u32,
            recent: 0,
            unseen: msgs
                .iter()
                .filter(|m| !m.meta.has_flag("\\Seen"))
                .count() as u32,
            uid_validity: meta.uid_validity,
            uid_next,
            highest_mod_seq: 0,
            flags: Vec::new(),
            permanent_flags: Vec::new(),
        })
    }

    async fn list_messages(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        query: &MessageQuery,
    ) -> Result<Vec<MailboxMessage>> {
        self.check_key(key)?;
        let state = self.state.lock().unwrap();
        let msgs = state
            .messages
            .get(&self.folder_key(sender_id, folder))
            .ok_or_else(|| Error::MailboxNotFound(folder.to_string()))?;
        let mut out: Vec<MailboxMessage> = msgs
            .iter()
            .filter(|m| match &query.uids {
                Some(uids) => uids.contains(&m.meta.uid),
                None => true,
            })
            .map(|m| m.meta.clone())
            .collect();
        if let Some(limit) = query.limit {
            out.truncate(limit as usize);
        }
        Ok(out)
    }

    async fn get_message(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        uid: u32,
    ) -> Result<Option<MailboxMessage>> {
        self.check_key(key)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .messages
            .get(&self.folder_key(sender_id, folder))
            .and_then(|msgs| msgs.iter().find(|m| m.meta.uid == uid))
            .map(|m| m.meta.clone()))
    }

    async fn get_body(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        uid: u32,
        peek: bool,
    ) -> Result<Option<MessageBody>> {
        self.check_key(key)?;
        let mut state = self.state.lock().unwrap();
        let folder_key = self.folder_key(sender_id, folder);
        let Some(msgs) = state.messages.get_mut(&folder_key) else {
            return Ok(None);
        };
        let Some(stored) = msgs.iter_mut().find(|m| m.meta.uid == uid) else {
            return Ok(None);
        };
        if !peek && !stored.meta.has_flag("\\Seen") {
            stored.meta.flags.push("\\Seen".to_string());
        }
        Ok(Some(stored.body.clone()))
    }

    async fn update_flags(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        uid: u32,
        action: FlagAction,
        flags: &[String],
    ) -> Result<Vec<String>> {
        self.check_key(key)?;
        let mut state = self.state.lock().unwrap();
        let folder_key = self.folder_key(sender_id, folder);
        let stored = state
            .messages
            .get_mut(&folder_key)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.meta.uid == uid))
            .ok_or_else(|| Error::MailboxNotFound(format!("uid {}", uid)))?;
        match action {
            FlagAction::Set => stored.meta.flags = flags.to_vec(),
            FlagAction::Add => {
                for flag in flags {
                    if !stored.meta.has_flag(flag) {
                        stored.meta.flags.push(flag.clone());
                    }
                }
            }
            FlagAction::Remove => {
                stored
                    .meta
                    .flags
                    .retain(|f| !flags.iter().any(|r| r.eq_ignore_ascii_case(f)));
            }
        }
        Ok(stored.meta.flags.clone())
    }

    async fn copy_message(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        target: &str,
        uid: u32,
    ) -> Result<u32> {
        self.check_key(key)?;
        let mut state = self.state.lock().unwrap();
        let source_key = self.folder_key(sender_id, folder);
        let target_key = self.folder_key(sender_id, target);
        let stored = state
            .messages
            .get(&source_key)
            .and_then(|msgs| msgs.iter().find(|m| m.meta.uid == uid))
            .cloned()
            .ok_or_else(|| Error::MailboxNotFound(format!("uid {}", uid)))?;
        if !state.messages.contains_key(&target_key) {
            return Err(Error::MailboxNotFound(target.to_string()));
        }
        let next = state.uid_next.entry(target_key.clone()).or_insert(1);
        let new_uid = *next;
        *next += 1;
        let mut copied = stored;
        copied.meta.uid = new_uid;
        state.messages.get_mut(&target_key).unwrap().push(copied);
        Ok(new_uid)
    }

    async fn move_message(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        target: &str,
        uid: u32,
    ) -> Result<u32> {
        let new_uid = self.copy_message(key, sender_id, folder, target, uid).await?;
        let mut state = self.state.lock().unwrap();
        let source_key = self.folder_key(sender_id, folder);
        if let Some(msgs) = state.messages.get_mut(&source_key) {
            msgs.retain(|m| m.meta.uid != uid);
        }
        Ok(new_uid)
    }

    async fn append_message(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        raw: &[u8],
        flags: &[String],
        date: Option<DateTime<Utc>>,
    ) -> Result<u32> {
        self.check_key(key)?;
        let mut state = self.state.lock().unwrap();
        let folder_key = self.folder_key(sender_id, folder);
        if !state.messages.contains_key(&folder_key) {
            return Err(Error::MailboxNotFound(folder.to_string()));
        }
        let next = state.uid_next.entry(folder_key.clone()).or_insert(1);
        let uid = *next;
        *next += 1;

        // Split the raw message like the real service: header block and text.
        let (headers, text) = match raw.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(pos) => (
                Some(String::from_utf8_lossy(&raw[..pos + 2]).to_string()),
                Some(String::from_utf8_lossy(&raw[pos + 4..]).to_string()),
            ),
            None => (None, Some(String::from_utf8_lossy(raw).to_string())),
        };

        state.messages.get_mut(&folder_key).unwrap().push(StoredMessage {
            meta: MailboxMessage {
                uid,
                flags: flags.to_vec(),
                internal_date: date.unwrap_or_else(|| {
                    Utc.with_ymd_and_hms(2026, 1, 25, 0, 0, 0).unwrap()
                }),
                size: raw.len() as u32,
                envelope: None,
                body_structure: None,
                body: None,
            },
            body: MessageBody {
                text,
                html: None,
                headers,
            },
        });
        Ok(uid)
    }

    async fn delete_message(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        uid: u32,
        _expunge: bool,
    ) -> Result<()> {
        self.check_key(key)?;
        let mut state = self.state.lock().unwrap();
        let folder_key = self.folder_key(sender_id, folder);
        if let Some(msgs) = state.messages.get_mut(&folder_key) {
            msgs.retain(|m| m.meta.uid != uid);
        }
        Ok(())
    }

    async fn search(
        &self,
        key: &str,
        _sender_id: &str,
        _folder: &str,
        _criteria: &[String],
    ) -> Result<Vec<u32>> {
        self.check_key(key)?;
        Ok(self.state.lock().unwrap().search_results.clone())
    }

    async fn sync_mailbox(&self, key: &str, _sender_id: &str) -> Result<()> {
        self.check_key(key)
    }

    async fn create_folder(&self, key: &str, sender_id: &str, name: &str) -> Result<()> {
        self.check_key(key)?;
        let mut state = self.state.lock().unwrap();
        let id = format!("f{}", state.folders.values().map(|v| v.len()).sum::<usize>() + 1);
        state
            .folders
            .entry(sender_id.to_string())
            .or_default()
            .push(folder(&id, name, None, 1));
        state
            .messages
            .insert(self.folder_key(sender_id, name), Vec::new());
        state.uid_next.insert(self.folder_key(sender_id, name), 1);
        Ok(())
    }

    async fn delete_folder(&self, key: &str, sender_id: &str, folder_id: &str) -> Result<()> {
        self.check_key(key)?;
        let mut state = self.state.lock().unwrap();
        if let Some(folders) = state.folders.get_mut(sender_id) {
            folders.retain(|f| f.id != folder_id);
        }
        Ok(())
    }

    async fn send_message(&self, key: &str, message: &OutboundMessage) -> Result<()> {
        self.check_key(key)?;
        self.state.lock().unwrap().sent.push(message.clone());
        Ok(())
    }
}
