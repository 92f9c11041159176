//! Per-connection IMAP session
//!
//! One session per socket: the state machine (not-authenticated →
//! authenticated → selected → logout), the selected-folder UID vector that
//! defines sequence-number mapping, and the command dispatcher. Handlers
//! return an ordered response list whose last element is always tagged;
//! every error path collapses into a wire response here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::upstream::types::{
    BodyStructure, FetchField, FlagAction, MailboxMessage, MessageQuery, Sender,
};
use crate::upstream::{is_valid_key_format, MailboxBackend};

use super::command::{self, FetchItem, ImapCommand, Section, SequenceSet};
use super::framer::CommandFrame;
use super::mailbox;
use super::response::{self, Response};

pub const CAPABILITIES: &str = "IMAP4rev1 IDLE NAMESPACE UIDPLUS MOVE SPECIAL-USE";
const AUTH_CAPABILITIES: &str = "AUTH=PLAIN AUTH=LOGIN";

/// SELECT loads at most this many UIDs into the session vector.
const SELECT_UID_CEILING: u32 = 10_000;
/// IDLE is re-armed at most this often regardless of configuration.
const IDLE_CAP: Duration = Duration::from_secs(28 * 60);

const DEFAULT_FLAGS: [&str; 5] = ["\\Seen", "\\Answered", "\\Flagged", "\\Deleted", "\\Draft"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
}

/// The selected folder and its UID vector. The vector is strictly ascending;
/// index + 1 is the message's sequence number for this session.
#[derive(Debug, Clone)]
pub struct SelectedFolder {
    pub sender: Sender,
    pub folder: String,
    pub uid_validity: u32,
    pub uid_next: u32,
    pub read_only: bool,
    pub uids: Vec<u32>,
    pub highest_mod_seq: u64,
}

#[derive(Debug)]
struct IdleState {
    tag: String,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMechanism {
    Plain,
    Login,
}

#[derive(Debug)]
struct AuthExchange {
    tag: String,
    mechanism: AuthMechanism,
    username: Option<String>,
}

pub struct ImapSession {
    id: u64,
    peer: String,
    state: SessionState,
    api_key: Option<String>,
    /// Set when LOGIN used a sender email instead of `api`/`*`.
    pinned_sender: Option<Sender>,
    selected: Option<SelectedFolder>,
    idle: Option<IdleState>,
    auth: Option<AuthExchange>,
    backend: Arc<dyn MailboxBackend>,
    config: Arc<GatewayConfig>,
}

impl ImapSession {
    pub fn new(
        id: u64,
        peer: String,
        backend: Arc<dyn MailboxBackend>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            id,
            peer,
            state: SessionState::NotAuthenticated,
            api_key: None,
            pinned_sender: None,
            selected: None,
            idle: None,
            auth: None,
            backend,
            config,
        }
    }

    pub fn greeting() -> Vec<u8> {
        format!(
            "* OK [CAPABILITY {}] Transmit IMAP Ready\r\n",
            CAPABILITIES
        )
        .into_bytes()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn should_close(&self) -> bool {
        self.state == SessionState::Logout
    }

    pub fn is_idling(&self) -> bool {
        self.idle.is_some()
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle.as_ref().map(|idle| idle.deadline)
    }

    /// Called by the connection loop when the IDLE timer fires.
    pub fn end_idle_timeout(&mut self) -> Vec<Response> {
        match self.idle.take() {
            Some(idle) => vec![Response::ok(&idle.tag, "IDLE terminated (timeout)")],
            None => Vec::new(),
        }
    }

    /// The selected folder's UID vector (ascending; index + 1 = sequence
    /// number).
    pub fn selected_uids(&self) -> Option<&[u32]> {
        self.selected.as_ref().map(|sel| sel.uids.as_slice())
    }

    /// Handle one framed command and return its responses in order.
    pub async fn handle_frame(&mut self, frame: CommandFrame) -> Vec<Response> {
        if let Some(auth) = self.auth.take() {
            let line = String::from_utf8_lossy(&frame.line).trim().to_string();
            return self.continue_authenticate(auth, &line).await;
        }

        if self.idle.is_some() {
            let line = String::from_utf8_lossy(&frame.line);
            if line.trim().eq_ignore_ascii_case("DONE") {
                let idle = self.idle.take().unwrap();
                return vec![Response::ok(&idle.tag, "IDLE terminated")];
            }
            tracing::debug!(session = self.id, "Ignoring line during IDLE: {}", line.trim());
            return Vec::new();
        }

        let cmd = match ImapCommand::parse(frame) {
            Ok(cmd) => cmd,
            Err(e) => {
                return vec![Response::untagged(format!("BAD {}", e).into_bytes())];
            }
        };

        tracing::debug!(
            session = self.id,
            peer = %self.peer,
            "C: {} {}{}",
            cmd.tag,
            if cmd.use_uid { "UID " } else { "" },
            cmd.name
        );

        if !self.command_allowed(&cmd.name) {
            return vec![Response::bad(
                &cmd.tag,
                &format!("{} not allowed in current state", cmd.name),
            )];
        }

        let tag = cmd.tag.clone();
        let name = cmd.name.clone();
        match self.dispatch(cmd).await {
            Ok(responses) => responses,
            Err(e) => vec![self.error_response(&tag, &name, e)],
        }
    }

    fn command_allowed(&self, name: &str) -> bool {
        use SessionState::*;
        match name {
            "CAPABILITY" | "NOOP" | "LOGOUT" => true,
            "LOGIN" | "AUTHENTICATE" => self.state == NotAuthenticated,
            "LIST" | "LSUB" | "STATUS" | "SELECT" | "EXAMINE" | "CREATE" | "DELETE"
            | "RENAME" | "SUBSCRIBE" | "UNSUBSCRIBE" | "APPEND" | "NAMESPACE" => {
                matches!(self.state, Authenticated | Selected)
            }
            "CHECK" | "CLOSE" | "EXPUNGE" | "SEARCH" | "FETCH" | "STORE" | "COPY" | "MOVE"
            | "IDLE" => self.state == Selected,
            _ => true,
        }
    }

    async fn dispatch(&mut self, cmd: ImapCommand) -> Result<Vec<Response>> {
        let name = cmd.name.clone();
        match name.as_str() {
            "CAPABILITY" => self.cmd_capability(&cmd),
            "NOOP" => Ok(vec![Response::ok(&cmd.tag, "NOOP completed")]),
            "CHECK" => self.cmd_check(&cmd).await,
            "LOGOUT" => self.cmd_logout(&cmd),
            "LOGIN" => self.cmd_login(cmd).await,
            "AUTHENTICATE" => self.cmd_authenticate(cmd).await,
            "LIST" => self.cmd_list(&cmd, false).await,
            "LSUB" => self.cmd_list(&cmd, true).await,
            "STATUS" => self.cmd_status(&cmd).await,
            "SELECT" => self.cmd_select(&cmd, false).await,
            "EXAMINE" => self.cmd_select(&cmd, true).await,
            "CREATE" => self.cmd_create(&cmd).await,
            "DELETE" => self.cmd_delete(&cmd).await,
            "RENAME" => Ok(vec![Response::no(&cmd.tag, "Rename is not supported")]),
            "SUBSCRIBE" => Ok(vec![Response::ok(&cmd.tag, "SUBSCRIBE completed")]),
            "UNSUBSCRIBE" => Ok(vec![Response::ok(&cmd.tag, "UNSUBSCRIBE completed")]),
            "NAMESPACE" => Ok(vec![
                Response::untagged(b"NAMESPACE ((\"\" \"/\")) NIL NIL".to_vec()),
                Response::ok(&cmd.tag, "NAMESPACE completed"),
            ]),
            "APPEND" => self.cmd_append(&cmd).await,
            "CLOSE" => self.cmd_close(&cmd).await,
            "EXPUNGE" => self.cmd_expunge(&cmd).await,
            "SEARCH" => self.cmd_search(&cmd).await,
            "FETCH" => self.cmd_fetch(&cmd).await,
            "STORE" => self.cmd_store(&cmd).await,
            "COPY" => self.cmd_copy_move(&cmd, false).await,
            "MOVE" => self.cmd_copy_move(&cmd, true).await,
            "IDLE" => self.cmd_idle(&cmd),
            other => Ok(vec![Response::bad(
                &cmd.tag,
                &format!("Unknown command: {}", other),
            )]),
        }
    }

    fn error_response(&self, tag: &str, name: &str, e: Error) -> Response {
        match e {
            Error::Auth(reason) => {
                tracing::info!(session = self.id, "Authentication failed: {}", reason);
                Response::no_with_code(tag, "AUTHENTICATIONFAILED", "Authentication failed")
            }
            Error::MailboxNotFound(_) => Response::no(tag, "Mailbox does not exist"),
            Error::BadState(message) | Error::Protocol(message) => Response::bad(tag, &message),
            Error::TooLarge(size) => {
                Response::no(tag, &format!("Message too large ({} bytes)", size))
            }
            Error::Timeout | Error::Network(_) | Error::RateLimited | Error::Upstream { .. } => {
                tracing::warn!(session = self.id, "Upstream failure in {}: {}", name, e);
                Response::no(tag, &format!("Failed to complete {}", name))
            }
            other => {
                tracing::error!(session = self.id, "Internal error in {}: {}", name, other);
                Response::bad(tag, &format!("{}", other))
            }
        }
    }

    fn require_key(&self) -> Result<String> {
        self.api_key
            .clone()
            .ok_or_else(|| Error::BadState("Not authenticated".to_string()))
    }

    fn selected(&self) -> Result<&SelectedFolder> {
        self.selected
            .as_ref()
            .ok_or_else(|| Error::BadState("No mailbox selected".to_string()))
    }

    // === Any-state commands ===

    fn cmd_capability(&self, cmd: &ImapCommand) -> Result<Vec<Response>> {
        Ok(vec![
            Response::untagged(
                format!("CAPABILITY {} {}", CAPABILITIES, AUTH_CAPABILITIES).into_bytes(),
            ),
            Response::ok(&cmd.tag, "CAPABILITY completed"),
        ])
    }

    fn cmd_logout(&mut self, cmd: &ImapCommand) -> Result<Vec<Response>> {
        self.state = SessionState::Logout;
        self.selected = None;
        Ok(vec![
            Response::bye("Transmit IMAP logging out"),
            Response::ok(&cmd.tag, "LOGOUT completed"),
        ])
    }

    // === Authentication ===

    async fn cmd_login(&mut self, cmd: ImapCommand) -> Result<Vec<Response>> {
        if cmd.args.len() < 2 {
            return Err(Error::Protocol("LOGIN needs a username and password".to_string()));
        }
        let username = cmd.args[0].clone();
        let password = cmd.args[1].clone();
        self.login_with(&cmd.tag, "LOGIN", &username, &password).await
    }

    async fn cmd_authenticate(&mut self, cmd: ImapCommand) -> Result<Vec<Response>> {
        let mechanism = cmd
            .args
            .first()
            .ok_or_else(|| Error::Protocol("AUTHENTICATE needs a mechanism".to_string()))?
            .to_uppercase();

        match mechanism.as_str() {
            "PLAIN" => {
                if let Some(initial) = cmd.args.get(1) {
                    let exchange = AuthExchange {
                        tag: cmd.tag.clone(),
                        mechanism: AuthMechanism::Plain,
                        username: None,
                    };
                    return Ok(self.continue_authenticate(exchange, initial).await);
                }
                self.auth = Some(AuthExchange {
                    tag: cmd.tag,
                    mechanism: AuthMechanism::Plain,
                    username: None,
                });
                Ok(vec![Response::Continuation(String::new())])
            }
            "LOGIN" => {
                self.auth = Some(AuthExchange {
                    tag: cmd.tag,
                    mechanism: AuthMechanism::Login,
                    username: None,
                });
                // base64("Username:")
                Ok(vec![Response::Continuation("VXNlcm5hbWU6".to_string())])
            }
            _ => Ok(vec![Response::no(
                &cmd.tag,
                "Unsupported authentication mechanism",
            )]),
        }
    }

    async fn continue_authenticate(
        &mut self,
        mut exchange: AuthExchange,
        line: &str,
    ) -> Vec<Response> {
        if line == "*" {
            return vec![Response::bad(&exchange.tag, "AUTHENTICATE aborted")];
        }

        match exchange.mechanism {
            AuthMechanism::Plain => match decode_plain(line) {
                Some((username, password)) => {
                    let tag = exchange.tag.clone();
                    match self
                        .login_with(&tag, "AUTHENTICATE", &username, &password)
                        .await
                    {
                        Ok(responses) => responses,
                        Err(e) => vec![self.error_response(&tag, "AUTHENTICATE", e)],
                    }
                }
                None => vec![Response::no_with_code(
                    &exchange.tag,
                    "AUTHENTICATIONFAILED",
                    "Invalid PLAIN response",
                )],
            },
            AuthMechanism::Login => {
                let decoded = match decode_b64(line) {
                    Some(value) => value,
                    None => {
                        return vec![Response::no_with_code(
                            &exchange.tag,
                            "AUTHENTICATIONFAILED",
                            "Invalid base64",
                        )]
                    }
                };
                match exchange.username.take() {
                    None => {
                        exchange.username = Some(decoded);
                        self.auth = Some(exchange);
                        // base64("Password:")
                        vec![Response::Continuation("UGFzc3dvcmQ6".to_string())]
                    }
                    Some(username) => {
                        let tag = exchange.tag.clone();
                        match self
                            .login_with(&tag, "AUTHENTICATE", &username, &decoded)
                            .await
                        {
                            Ok(responses) => responses,
                            Err(e) => vec![self.error_response(&tag, "AUTHENTICATE", e)],
                        }
                    }
                }
            }
        }
    }

    async fn login_with(
        &mut self,
        tag: &str,
        command_name: &str,
        username: &str,
        password: &str,
    ) -> Result<Vec<Response>> {
        if !is_valid_key_format(password) {
            return Err(Error::Auth("API key format rejected".to_string()));
        }

        self.backend.validate_key(password).await?;

        // `api` or `*` grants access to every sender; an email pins one.
        if username != "*" && !username.eq_ignore_ascii_case("api") {
            match self.backend.sender_by_email(password, username).await? {
                Some(sender) => self.pinned_sender = Some(sender),
                None => {
                    return Err(Error::Auth(format!("No sender matches {}", username)));
                }
            }
        } else {
            self.pinned_sender = None;
        }

        self.api_key = Some(password.to_string());
        self.state = SessionState::Authenticated;
        tracing::info!(session = self.id, peer = %self.peer, "Authenticated");
        Ok(vec![Response::ok(
            tag,
            &format!("{} completed", command_name),
        )])
    }

    // === Mailbox commands ===

    async fn cmd_list(&mut self, cmd: &ImapCommand, lsub: bool) -> Result<Vec<Response>> {
        let key = self.require_key()?;
        let command_name = if lsub { "LSUB" } else { "LIST" };
        let pattern = cmd.args.get(1).cloned().unwrap_or_else(|| "*".to_string());

        // An empty pattern asks for the hierarchy delimiter only.
        if pattern.is_empty() {
            return Ok(vec![
                response::list_line(command_name, &["\\Noselect"], ""),
                Response::ok(&cmd.tag, &format!("{} completed", command_name)),
            ]);
        }

        let senders = match &self.pinned_sender {
            Some(sender) => vec![sender.clone()],
            None => self.backend.list_senders(&key).await?,
        };
        let pinned = self.pinned_sender.is_some();

        let mut responses = Vec::new();
        for sender in &senders {
            let folders = self.backend.list_folders(&key, &sender.id).await?;
            for folder in folders {
                let display = if pinned {
                    folder.name.clone()
                } else {
                    format!("{}/{}", sender.email, folder.name)
                };
                if !mailbox::wildcard_match(&pattern, &display) {
                    continue;
                }
                let mut flags: Vec<&str> = Vec::new();
                if let Some(role) = folder.role {
                    flags.push(role.special_use_flag());
                }
                responses.push(response::list_line(command_name, &flags, &display));
            }
        }
        responses.push(Response::ok(&cmd.tag, &format!("{} completed", command_name)));
        Ok(responses)
    }

    async fn cmd_status(&mut self, cmd: &ImapCommand) -> Result<Vec<Response>> {
        let key = self.require_key()?;
        let mailbox_arg = cmd
            .args
            .first()
            .ok_or_else(|| Error::Protocol("STATUS needs a mailbox".to_string()))?
            .clone();

        let resolved =
            mailbox::resolve(&self.backend, &key, self.pinned_sender.as_ref(), &mailbox_arg)
                .await?;
        let sender = resolved
            .sender
            .ok_or_else(|| Error::MailboxNotFound(mailbox_arg.clone()))?;
        let status = self
            .backend
            .folder_status(&key, &sender.id, &resolved.folder)
            .await?;

        let requested = cmd
            .args
            .get(1)
            .map(|s| s.trim_start_matches('(').trim_end_matches(')').to_uppercase())
            .unwrap_or_else(|| "MESSAGES RECENT UIDNEXT UIDVALIDITY UNSEEN".to_string());

        let mut items: Vec<(String, u64)> = Vec::new();
        for item in requested.split_whitespace() {
            let value = match item {
                "MESSAGES" => status.exists as u64,
                "RECENT" => status.recent as u64,
                "UIDNEXT" => status.uid_next as u64,
                "UIDVALIDITY" => status.uid_validity as u64,
                "UNSEEN" => status.unseen as u64,
                _ => continue,
            };
            items.push((item.to_string(), value));
        }

        Ok(vec![
            response::status_line(&mailbox_arg, &items),
            Response::ok(&cmd.tag, "STATUS completed"),
        ])
    }

    async fn cmd_select(&mut self, cmd: &ImapCommand, read_only: bool) -> Result<Vec<Response>> {
        let key = self.require_key()?;
        let command_name = if read_only { "EXAMINE" } else { "SELECT" };
        let mailbox_arg = cmd
            .args
            .first()
            .ok_or_else(|| Error::Protocol(format!("{} needs a mailbox", command_name)))?
            .clone();

        let resolved =
            mailbox::resolve(&self.backend, &key, self.pinned_sender.as_ref(), &mailbox_arg)
                .await?;
        let sender = resolved
            .sender
            .ok_or_else(|| Error::MailboxNotFound(mailbox_arg.clone()))?;

        let status = self
            .backend
            .folder_status(&key, &sender.id, &resolved.folder)
            .await?;

        let listing = self
            .backend
            .list_messages(
                &key,
                &sender.id,
                &resolved.folder,
                &MessageQuery {
                    uids: None,
                    fields: vec![FetchField::Uid, FetchField::Flags],
                    limit: Some(SELECT_UID_CEILING),
                    offset: None,
                },
            )
            .await?;

        let mut entries: Vec<(u32, bool)> = listing
            .iter()
            .map(|m| (m.uid, m.has_flag("\\Seen")))
            .collect();
        entries.sort_unstable_by_key(|&(uid, _)| uid);
        entries.dedup_by_key(|&mut (uid, _)| uid);

        let uids: Vec<u32> = entries.iter().map(|&(uid, _)| uid).collect();
        let first_unseen = entries
            .iter()
            .position(|&(_, seen)| !seen)
            .map(|index| index as u32 + 1);

        let flags: Vec<String> = if status.flags.is_empty() {
            DEFAULT_FLAGS.iter().map(|f| f.to_string()).collect()
        } else {
            status.flags.clone()
        };
        let mut permanent: Vec<String> = if status.permanent_flags.is_empty() {
            flags.clone()
        } else {
            status.permanent_flags.clone()
        };
        if !permanent.iter().any(|f| f == "\\*") {
            permanent.push("\\*".to_string());
        }

        let mut responses = vec![
            Response::untagged(format!("{} EXISTS", uids.len()).into_bytes()),
            Response::untagged(format!("{} RECENT", status.recent).into_bytes()),
            Response::untagged(format!("FLAGS {}", response::flag_list(&flags)).into_bytes()),
            Response::untagged(
                format!("OK [PERMANENTFLAGS {}]", response::flag_list(&permanent)).into_bytes(),
            ),
            Response::untagged(
                format!("OK [UIDVALIDITY {}] UIDs valid", status.uid_validity).into_bytes(),
            ),
            Response::untagged(
                format!("OK [UIDNEXT {}] Predicted next UID", status.uid_next).into_bytes(),
            ),
        ];
        if let Some(seq) = first_unseen {
            responses.push(Response::untagged(
                format!("OK [UNSEEN {}] First unseen message", seq).into_bytes(),
            ));
        }
        responses.push(Response::ok_with_code(
            &cmd.tag,
            if read_only { "READ-ONLY" } else { "READ-WRITE" },
            &format!("{} completed", command_name),
        ));

        self.selected = Some(SelectedFolder {
            sender,
            folder: resolved.folder,
            uid_validity: status.uid_validity,
            uid_next: status.uid_next,
            read_only,
            uids,
            highest_mod_seq: status.highest_mod_seq,
        });
        self.state = SessionState::Selected;

        Ok(responses)
    }

    async fn cmd_create(&mut self, cmd: &ImapCommand) -> Result<Vec<Response>> {
        let key = self.require_key()?;
        let mailbox_arg = cmd
            .args
            .first()
            .ok_or_else(|| Error::Protocol("CREATE needs a mailbox".to_string()))?;

        let resolved =
            mailbox::resolve(&self.backend, &key, self.pinned_sender.as_ref(), mailbox_arg)
                .await?;
        let sender = match resolved.sender {
            Some(sender) => sender,
            // No folder with that name anywhere: create under the first
            // accessible sender.
            None => self
                .backend
                .list_senders(&key)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| Error::MailboxNotFound(mailbox_arg.clone()))?,
        };

        self.backend
            .create_folder(&key, &sender.id, &resolved.folder)
            .await?;
        Ok(vec![Response::ok(&cmd.tag, "CREATE completed")])
    }

    async fn cmd_delete(&mut self, cmd: &ImapCommand) -> Result<Vec<Response>> {
        let key = self.require_key()?;
        let mailbox_arg = cmd
            .args
            .first()
            .ok_or_else(|| Error::Protocol("DELETE needs a mailbox".to_string()))?;

        let resolved =
            mailbox::resolve(&self.backend, &key, self.pinned_sender.as_ref(), mailbox_arg)
                .await?;
        let sender = resolved
            .sender
            .ok_or_else(|| Error::MailboxNotFound(mailbox_arg.clone()))?;

        let folders = self.backend.list_folders(&key, &sender.id).await?;
        let folder = folders
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(&resolved.folder))
            .ok_or_else(|| Error::MailboxNotFound(mailbox_arg.clone()))?;

        self.backend
            .delete_folder(&key, &sender.id, &folder.id)
            .await?;
        Ok(vec![Response::ok(&cmd.tag, "DELETE completed")])
    }

    // === Selected-state commands ===

    /// CHECK requests a checkpoint; the closest upstream notion is a sender
    /// sync, so ask for one and answer OK either way.
    async fn cmd_check(&mut self, cmd: &ImapCommand) -> Result<Vec<Response>> {
        let key = self.require_key()?;
        let sel = self.selected()?.clone();
        if let Err(e) = self.backend.sync_mailbox(&key, &sel.sender.id).await {
            tracing::debug!(session = self.id, "Sync on CHECK failed: {}", e);
        }
        Ok(vec![Response::ok(&cmd.tag, "CHECK completed")])
    }

    async fn cmd_close(&mut self, cmd: &ImapCommand) -> Result<Vec<Response>> {
        let key = self.require_key()?;
        let sel = self.selected()?.clone();

        // CLOSE expunges silently; EXAMINE sessions must not.
        if !sel.read_only {
            let deleted = self.deleted_uids(&key, &sel, None).await?;
            for uid in deleted {
                if let Err(e) = self
                    .backend
                    .delete_message(&key, &sel.sender.id, &sel.folder, uid, true)
                    .await
                {
                    tracing::warn!(session = self.id, "CLOSE expunge failed for {}: {}", uid, e);
                }
            }
        }

        self.selected = None;
        self.state = SessionState::Authenticated;
        Ok(vec![Response::ok(&cmd.tag, "CLOSE completed")])
    }

    async fn cmd_expunge(&mut self, cmd: &ImapCommand) -> Result<Vec<Response>> {
        let key = self.require_key()?;
        let sel = self.selected()?.clone();
        if sel.read_only {
            return Ok(vec![Response::no(&cmd.tag, "Mailbox is read-only")]);
        }

        // UID EXPUNGE restricts the candidate set.
        let uid_filter = match (cmd.use_uid, cmd.args.first()) {
            (true, Some(arg)) => Some(
                SequenceSet::parse(arg)
                    .ok_or_else(|| Error::Protocol("Bad sequence set".to_string()))?,
            ),
            _ => None,
        };

        let deleted = self.deleted_uids(&key, &sel, uid_filter.as_ref()).await?;

        let mut responses = Vec::new();
        for uid in deleted {
            self.backend
                .delete_message(&key, &sel.sender.id, &sel.folder, uid, true)
                .await?;
            if let Some(seq) = self.splice_uid(uid) {
                responses.push(Response::untagged(format!("{} EXPUNGE", seq).into_bytes()));
            }
        }
        responses.push(Response::ok(&cmd.tag, "EXPUNGE completed"));
        Ok(responses)
    }

    /// UIDs in the selected folder currently flagged `\Deleted`, ascending.
    async fn deleted_uids(
        &self,
        key: &str,
        sel: &SelectedFolder,
        filter: Option<&SequenceSet>,
    ) -> Result<Vec<u32>> {
        if sel.uids.is_empty() {
            return Ok(Vec::new());
        }
        let listing = self
            .backend
            .list_messages(
                key,
                &sel.sender.id,
                &sel.folder,
                &MessageQuery {
                    uids: Some(sel.uids.clone()),
                    fields: vec![FetchField::Uid, FetchField::Flags],
                    limit: None,
                    offset: None,
                },
            )
            .await?;

        let allowed: Option<Vec<u32>> = filter.map(|set| set.resolve_uids(&sel.uids));
        let mut deleted: Vec<u32> = listing
            .iter()
            .filter(|m| m.has_flag("\\Deleted"))
            .map(|m| m.uid)
            .filter(|uid| match &allowed {
                Some(set) => set.contains(uid),
                None => true,
            })
            .collect();
        deleted.sort_unstable();
        Ok(deleted)
    }

    /// Remove a UID from the session vector, returning the sequence number
    /// it had at removal time. Subsequent calls see the shifted numbering.
    fn splice_uid(&mut self, uid: u32) -> Option<u32> {
        let sel = self.selected.as_mut()?;
        let index = sel.uids.iter().position(|&u| u == uid)?;
        sel.uids.remove(index);
        Some(index as u32 + 1)
    }

    async fn cmd_search(&mut self, cmd: &ImapCommand) -> Result<Vec<Response>> {
        let key = self.require_key()?;
        let sel = self.selected()?.clone();

        // Skip an optional CHARSET prefix; criteria go upstream as text.
        let mut args = cmd.args.as_slice();
        if args
            .first()
            .map(|a| a.eq_ignore_ascii_case("CHARSET"))
            .unwrap_or(false)
        {
            args = args.get(2..).unwrap_or(&[]);
        }
        let criteria = command::parse_search_criteria(args)?;

        let uids = self
            .backend
            .search(&key, &sel.sender.id, &sel.folder, &criteria)
            .await?;

        let results: Vec<u32> = if cmd.use_uid {
            uids
        } else {
            uids.iter()
                .filter_map(|uid| sel.uids.iter().position(|u| u == uid))
                .map(|index| index as u32 + 1)
                .collect()
        };

        let mut line = String::from("SEARCH");
        for value in &results {
            line.push(' ');
            line.push_str(&value.to_string());
        }
        Ok(vec![
            Response::untagged(line.into_bytes()),
            Response::ok(&cmd.tag, "SEARCH completed"),
        ])
    }

    async fn cmd_fetch(&mut self, cmd: &ImapCommand) -> Result<Vec<Response>> {
        let key = self.require_key()?;
        let sel = self.selected()?.clone();

        if cmd.args.len() < 2 {
            return Err(Error::Protocol(
                "FETCH needs a sequence set and items".to_string(),
            ));
        }
        let set = SequenceSet::parse(&cmd.args[0])
            .ok_or_else(|| Error::Protocol("Bad sequence set".to_string()))?;
        let mut items = command::parse_fetch_items(&cmd.args[1..].join(" "))?;
        if cmd.use_uid && !items.contains(&FetchItem::Uid) {
            items.insert(0, FetchItem::Uid);
        }

        let uids = self.resolve_set(&set, cmd.use_uid, &sel.uids);
        if uids.is_empty() {
            return Ok(vec![Response::ok(&cmd.tag, "FETCH completed")]);
        }

        let needs_body = items.iter().any(|item| {
            matches!(
                item,
                FetchItem::Rfc822
                    | FetchItem::Rfc822Header
                    | FetchItem::Rfc822Text
                    | FetchItem::Body { .. }
            )
        });
        // Peek unless some item is allowed to set \Seen.
        let peek = !items.iter().any(|item| {
            matches!(
                item,
                FetchItem::Rfc822
                    | FetchItem::Rfc822Text
                    | FetchItem::Body { peek: false, .. }
            )
        });

        let mut fields = vec![FetchField::Uid];
        for item in &items {
            match item {
                FetchItem::Flags => fields.push(FetchField::Flags),
                FetchItem::InternalDate => fields.push(FetchField::InternalDate),
                FetchItem::Rfc822Size => fields.push(FetchField::Size),
                FetchItem::Envelope => fields.push(FetchField::Envelope),
                FetchItem::BodyStructure | FetchItem::BodyShort => {
                    fields.push(FetchField::BodyStructure)
                }
                _ => {}
            }
        }
        // Header synthesis falls back to the envelope.
        if needs_body && !fields.contains(&FetchField::Envelope) {
            fields.push(FetchField::Envelope);
        }
        fields.sort_unstable();
        fields.dedup();

        let listing = self
            .backend
            .list_messages(
                &key,
                &sel.sender.id,
                &sel.folder,
                &MessageQuery {
                    uids: Some(uids.clone()),
                    fields,
                    limit: None,
                    offset: None,
                },
            )
            .await?;
        let mut by_uid: HashMap<u32, MailboxMessage> =
            listing.into_iter().map(|m| (m.uid, m)).collect();

        let mut responses = Vec::new();
        for uid in &uids {
            // Messages the upstream declines to return are skipped silently.
            let Some(mut message) = by_uid.remove(uid) else {
                continue;
            };

            if needs_body {
                match self
                    .backend
                    .get_body(&key, &sel.sender.id, &sel.folder, *uid, peek)
                    .await
                {
                    Ok(Some(body)) => message.body = Some(body),
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(
                            session = self.id,
                            "Body fetch failed for UID {}: {}",
                            uid,
                            e
                        );
                        continue;
                    }
                }
            }

            let Some(index) = sel.uids.iter().position(|u| u == uid) else {
                continue;
            };
            let parts = render_fetch_items(&items, &message);
            responses.push(response::fetch_line(index as u32 + 1, &parts));
        }

        responses.push(Response::ok(&cmd.tag, "FETCH completed"));
        Ok(responses)
    }

    async fn cmd_store(&mut self, cmd: &ImapCommand) -> Result<Vec<Response>> {
        let key = self.require_key()?;
        let sel = self.selected()?.clone();
        if sel.read_only {
            return Ok(vec![Response::no(&cmd.tag, "Mailbox is read-only")]);
        }

        if cmd.args.len() < 3 {
            return Err(Error::Protocol(
                "STORE needs a sequence set, an action and flags".to_string(),
            ));
        }
        let set = SequenceSet::parse(&cmd.args[0])
            .ok_or_else(|| Error::Protocol("Bad sequence set".to_string()))?;

        let action_token = cmd.args[1].to_uppercase();
        let silent = action_token.ends_with(".SILENT");
        let action = if action_token.starts_with("+FLAGS") {
            FlagAction::Add
        } else if action_token.starts_with("-FLAGS") {
            FlagAction::Remove
        } else if action_token.starts_with("FLAGS") {
            FlagAction::Set
        } else {
            return Err(Error::Protocol(format!(
                "Bad STORE action: {}",
                cmd.args[1]
            )));
        };

        let flags: Vec<String> = cmd.args[2..]
            .join(" ")
            .trim_start_matches('(')
            .trim_end_matches(')')
            .split_whitespace()
            .map(|f| f.to_string())
            .collect();

        let uids = self.resolve_set(&set, cmd.use_uid, &sel.uids);

        let mut responses = Vec::new();
        for uid in uids {
            let new_flags = self
                .backend
                .update_flags(&key, &sel.sender.id, &sel.folder, uid, action, &flags)
                .await?;
            if silent {
                continue;
            }
            let index = match sel.uids.iter().position(|&u| u == uid) {
                Some(index) => index,
                None => continue,
            };
            let mut parts = Vec::new();
            if cmd.use_uid {
                parts.push(format!("UID {}", uid).into_bytes());
            }
            parts.push(format!("FLAGS {}", response::flag_list(&new_flags)).into_bytes());
            responses.push(response::fetch_line(index as u32 + 1, &parts));
        }
        responses.push(Response::ok(&cmd.tag, "STORE completed"));
        Ok(responses)
    }

    async fn cmd_copy_move(&mut self, cmd: &ImapCommand, is_move: bool) -> Result<Vec<Response>> {
        let key = self.require_key()?;
        let sel = self.selected()?.clone();
        let command_name = if is_move { "MOVE" } else { "COPY" };

        if cmd.args.len() < 2 {
            return Err(Error::Protocol(format!(
                "{} needs a sequence set and a mailbox",
                command_name
            )));
        }
        let set = SequenceSet::parse(&cmd.args[0])
            .ok_or_else(|| Error::Protocol("Bad sequence set".to_string()))?;
        if is_move && sel.read_only {
            return Ok(vec![Response::no(&cmd.tag, "Mailbox is read-only")]);
        }

        let resolved =
            mailbox::resolve(&self.backend, &key, Some(&sel.sender), &cmd.args[1]).await?;
        let target = resolved.folder;

        let uids = self.resolve_set(&set, cmd.use_uid, &sel.uids);
        if uids.is_empty() {
            return Ok(vec![Response::ok(
                &cmd.tag,
                &format!("{} completed", command_name),
            )]);
        }

        let mut responses = Vec::new();
        let mut source_done: Vec<u32> = Vec::new();
        let mut target_uids: Vec<u32> = Vec::new();
        let mut first_error: Option<Error> = None;

        for uid in &uids {
            let result = if is_move {
                self.backend
                    .move_message(&key, &sel.sender.id, &sel.folder, &target, *uid)
                    .await
            } else {
                self.backend
                    .copy_message(&key, &sel.sender.id, &sel.folder, &target, *uid)
                    .await
            };
            match result {
                Ok(new_uid) => {
                    source_done.push(*uid);
                    target_uids.push(new_uid);
                    if is_move {
                        // The untagged EXPUNGE carries the sequence number at
                        // emission time; each splice shifts the ones after it.
                        if let Some(seq) = self.splice_uid(*uid) {
                            responses
                                .push(Response::untagged(format!("{} EXPUNGE", seq).into_bytes()));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        session = self.id,
                        "{} failed for UID {}: {}",
                        command_name,
                        uid,
                        e
                    );
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if source_done.is_empty() {
            return Err(first_error
                .unwrap_or_else(|| Error::Internal("no messages processed".to_string())));
        }

        let target_validity = self
            .backend
            .folder_status(&key, &sel.sender.id, &target)
            .await
            .map(|status| status.uid_validity)
            .unwrap_or(0);

        let code = format!(
            "COPYUID {} {} {}",
            target_validity,
            join_uids(&source_done),
            join_uids(&target_uids)
        );
        responses.push(Response::ok_with_code(
            &cmd.tag,
            &code,
            &format!("{} completed", command_name),
        ));
        Ok(responses)
    }

    async fn cmd_append(&mut self, cmd: &ImapCommand) -> Result<Vec<Response>> {
        let key = self.require_key()?;
        let mailbox_arg = cmd
            .args
            .first()
            .ok_or_else(|| Error::Protocol("APPEND needs a mailbox".to_string()))?
            .clone();

        let raw = cmd
            .literal
            .clone()
            .ok_or_else(|| Error::Protocol("APPEND requires a literal".to_string()))?;
        if raw.len() > self.config.max_message_size {
            return Err(Error::TooLarge(raw.len()));
        }

        let mut flags: Vec<String> = Vec::new();
        let mut date = None;
        for arg in &cmd.args[1..] {
            if arg.starts_with('(') && arg.ends_with(')') {
                flags = arg[1..arg.len() - 1]
                    .split_whitespace()
                    .map(|f| f.to_string())
                    .collect();
            } else if command::is_date_time(arg) {
                date = command::parse_date_time(arg);
            }
        }

        let resolved =
            mailbox::resolve(&self.backend, &key, self.pinned_sender.as_ref(), &mailbox_arg)
                .await?;
        let sender = match resolved.sender {
            Some(sender) => sender,
            None => {
                return Ok(vec![Response::no_with_code(
                    &cmd.tag,
                    "TRYCREATE",
                    "Mailbox does not exist",
                )])
            }
        };

        let uid = match self
            .backend
            .append_message(&key, &sender.id, &resolved.folder, &raw, &flags, date)
            .await
        {
            Ok(uid) => uid,
            Err(Error::MailboxNotFound(_)) => {
                return Ok(vec![Response::no_with_code(
                    &cmd.tag,
                    "TRYCREATE",
                    "Mailbox does not exist",
                )])
            }
            Err(e) => return Err(e),
        };

        let uid_validity = self
            .backend
            .folder_status(&key, &sender.id, &resolved.folder)
            .await
            .map(|status| status.uid_validity)
            .unwrap_or(0);

        // A message appended to the selected folder becomes visible to this
        // session immediately.
        if let Some(sel) = self.selected.as_mut() {
            if sel.sender.id == sender.id
                && sel.folder.eq_ignore_ascii_case(&resolved.folder)
                && !sel.uids.contains(&uid)
            {
                sel.uids.push(uid);
                sel.uids.sort_unstable();
            }
        }

        Ok(vec![Response::ok_with_code(
            &cmd.tag,
            &format!("APPENDUID {} {}", uid_validity, uid),
            "APPEND completed",
        )])
    }

    fn cmd_idle(&mut self, cmd: &ImapCommand) -> Result<Vec<Response>> {
        let timeout = self.config.imap_idle_timeout.min(IDLE_CAP);
        self.idle = Some(IdleState {
            tag: cmd.tag.clone(),
            deadline: Instant::now() + timeout,
        });
        Ok(vec![Response::Continuation("idling".to_string())])
    }

    /// Materialise a sequence set as UIDs against the session vector.
    fn resolve_set(&self, set: &SequenceSet, use_uid: bool, uids: &[u32]) -> Vec<u32> {
        if use_uid {
            set.resolve_uids(uids)
        } else {
            set.resolve_seqs(uids.len() as u32)
                .into_iter()
                .map(|seq| uids[seq as usize - 1])
                .collect()
        }
    }
}

/// Render the requested FETCH items for one message, in request order.
fn render_fetch_items(items: &[FetchItem], message: &MailboxMessage) -> Vec<Vec<u8>> {
    let full: Option<Vec<u8>> = message
        .body
        .as_ref()
        .map(|body| response::reconstruct_rfc822(message, body));

    let mut parts = Vec::new();
    for item in items {
        match item {
            FetchItem::Flags => {
                parts.push(format!("FLAGS {}", response::flag_list(&message.flags)).into_bytes());
            }
            FetchItem::Uid => parts.push(format!("UID {}", message.uid).into_bytes()),
            FetchItem::InternalDate => parts.push(
                format!(
                    "INTERNALDATE {}",
                    response::internal_date(&message.internal_date)
                )
                .into_bytes(),
            ),
            FetchItem::Rfc822Size => {
                parts.push(format!("RFC822.SIZE {}", message.size).into_bytes());
            }
            FetchItem::Envelope => {
                let env = message.envelope.clone().unwrap_or_default();
                let mut out = b"ENVELOPE ".to_vec();
                out.extend_from_slice(&response::envelope(&env));
                parts.push(out);
            }
            FetchItem::BodyStructure | FetchItem::BodyShort => {
                let label: &[u8] = if matches!(item, FetchItem::BodyStructure) {
                    b"BODYSTRUCTURE "
                } else {
                    b"BODY "
                };
                let structure = message
                    .body_structure
                    .clone()
                    .unwrap_or_else(|| fallback_structure(message));
                let mut out = label.to_vec();
                out.extend_from_slice(&response::body_structure(&structure));
                parts.push(out);
            }
            FetchItem::Rfc822 => {
                if let Some(full) = &full {
                    let mut out = b"RFC822 ".to_vec();
                    out.extend_from_slice(&response::literal(full));
                    parts.push(out);
                }
            }
            FetchItem::Rfc822Header => {
                if let (Some(full), Some(body)) = (&full, &message.body) {
                    let data = response::extract_section(full, body, &Section::Header);
                    let mut out = b"RFC822.HEADER ".to_vec();
                    out.extend_from_slice(&response::literal(&data));
                    parts.push(out);
                }
            }
            FetchItem::Rfc822Text => {
                if let (Some(full), Some(body)) = (&full, &message.body) {
                    let data = response::extract_section(full, body, &Section::Text);
                    let mut out = b"RFC822.TEXT ".to_vec();
                    out.extend_from_slice(&response::literal(&data));
                    parts.push(out);
                }
            }
            FetchItem::Body {
                section, partial, ..
            } => {
                if let (Some(full), Some(body)) = (&full, &message.body) {
                    let data = response::extract_section(full, body, section);
                    let (slice, origin) = response::apply_partial(&data, *partial);
                    let mut out = response::body_label(section, origin).into_bytes();
                    out.push(b' ');
                    out.extend_from_slice(&response::literal(slice));
                    parts.push(out);
                }
            }
        }
    }
    parts
}

/// Minimal single-part structure when the upstream sent none.
fn fallback_structure(message: &MailboxMessage) -> BodyStructure {
    let html = message
        .body
        .as_ref()
        .map(|body| body.text.is_none() && body.html.is_some())
        .unwrap_or(false);
    BodyStructure {
        part_type: "text".to_string(),
        subtype: if html { "html" } else { "plain" }.to_string(),
        params: [("charset".to_string(), "utf-8".to_string())].into(),
        id: None,
        description: None,
        encoding: "7BIT".to_string(),
        size: message.size,
        lines: None,
        parts: None,
    }
}

fn join_uids(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn decode_b64(line: &str) -> Option<String> {
    let bytes = BASE64.decode(line.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

/// SASL PLAIN: `authzid \0 authcid \0 password`.
fn decode_plain(line: &str) -> Option<(String, String)> {
    let decoded = BASE64.decode(line.trim()).ok()?;
    let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
    let (user, pass) = match parts.len() {
        3 => (parts[1], parts[2]),
        2 => (parts[0], parts[1]),
        _ => return None,
    };
    Some((
        String::from_utf8_lossy(user).to_string(),
        String::from_utf8_lossy(pass).to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_with_authzid() {
        let encoded = BASE64.encode(b"authz\0api\0pm_live_k");
        assert_eq!(
            decode_plain(&encoded),
            Some(("api".to_string(), "pm_live_k".to_string()))
        );
    }

    #[test]
    fn test_decode_plain_without_authzid() {
        let encoded = BASE64.encode(b"api\0pm_live_k");
        assert_eq!(
            decode_plain(&encoded),
            Some(("api".to_string(), "pm_live_k".to_string()))
        );
    }

    #[test]
    fn test_decode_plain_rejects_garbage() {
        assert!(decode_plain("!!!").is_none());
        assert!(decode_plain(&BASE64.encode(b"no-separator")).is_none());
    }

    #[test]
    fn test_join_uids() {
        assert_eq!(join_uids(&[10, 30]), "10,30");
        assert_eq!(join_uids(&[]), "");
    }
}
