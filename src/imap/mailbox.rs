//! Mailbox name handling
//!
//! Mail clients disagree on folder naming (Apple, Outlook and Gmail all ship
//! their own spellings), so every mailbox argument is normalised through a
//! fixed alias table before it reaches the upstream. Resolution then maps an
//! IMAP mailbox argument to a (sender, folder) pair.

use std::sync::Arc;

use crate::error::Result;
use crate::upstream::types::Sender;
use crate::upstream::MailboxBackend;

/// Client-specific folder spellings mapped to canonical names.
const FOLDER_ALIASES: &[(&str, &str)] = &[
    ("inbox", "Inbox"),
    ("sent", "Sent"),
    ("sent messages", "Sent"),
    ("sent items", "Sent"),
    ("sent mail", "Sent"),
    ("[gmail]/sent mail", "Sent"),
    ("drafts", "Drafts"),
    ("draft", "Drafts"),
    ("[gmail]/drafts", "Drafts"),
    ("trash", "Trash"),
    ("deleted messages", "Trash"),
    ("deleted items", "Trash"),
    ("deleted", "Trash"),
    ("[gmail]/trash", "Trash"),
    ("junk", "Junk"),
    ("junk e-mail", "Junk"),
    ("junk email", "Junk"),
    ("spam", "Junk"),
    ("[gmail]/spam", "Junk"),
    ("archive", "Archive"),
    ("archives", "Archive"),
    ("[gmail]/all mail", "Archive"),
];

/// Normalise a folder name through the alias table; unknown names pass
/// through unchanged.
pub fn normalize_folder(name: &str) -> String {
    let lower = name.to_lowercase();
    for (alias, canonical) in FOLDER_ALIASES {
        if lower == *alias {
            return (*canonical).to_string();
        }
    }
    name.to_string()
}

/// A mailbox argument resolved against the accessible senders. `sender` is
/// None when no sender owns a folder with that name.
#[derive(Debug, Clone)]
pub struct ResolvedMailbox {
    pub sender: Option<Sender>,
    pub folder: String,
}

/// Resolve an IMAP mailbox argument.
///
/// Order: a pinned session sender wins; otherwise a `sender@email/Folder`
/// prefix selects the sender; otherwise every accessible sender is searched
/// for a folder with the normalised name.
pub async fn resolve(
    backend: &Arc<dyn MailboxBackend>,
    key: &str,
    pinned: Option<&Sender>,
    mailbox_arg: &str,
) -> Result<ResolvedMailbox> {
    if let Some(sender) = pinned {
        return Ok(ResolvedMailbox {
            sender: Some(sender.clone()),
            folder: normalize_folder(mailbox_arg),
        });
    }

    if let Some((email, folder)) = mailbox_arg.split_once('/') {
        if email.contains('@') {
            let sender = backend.sender_by_email(key, email).await?;
            return Ok(ResolvedMailbox {
                sender,
                folder: normalize_folder(folder),
            });
        }
    }

    let folder = normalize_folder(mailbox_arg);
    for sender in backend.list_senders(key).await? {
        let folders = backend.list_folders(key, &sender.id).await?;
        if folders.iter().any(|f| f.name.eq_ignore_ascii_case(&folder)) {
            return Ok(ResolvedMailbox {
                sender: Some(sender),
                folder,
            });
        }
    }

    Ok(ResolvedMailbox {
        sender: None,
        folder,
    })
}

/// IMAP LIST wildcard match: `*` crosses the hierarchy delimiter, `%` stops
/// at it.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn inner(pattern: &[char], name: &[char]) -> bool {
        match pattern.first() {
            None => name.is_empty(),
            Some('*') => {
                (0..=name.len()).any(|skip| inner(&pattern[1..], &name[skip..]))
            }
            Some('%') => (0..=name.len())
                .take_while(|&skip| skip == 0 || name[skip - 1] != '/')
                .any(|skip| inner(&pattern[1..], &name[skip..])),
            Some(&c) => match name.first() {
                Some(&n) if n.eq_ignore_ascii_case(&c) => inner(&pattern[1..], &name[1..]),
                _ => false,
            },
        }
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    inner(&pattern, &name)
}
