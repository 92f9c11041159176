//! Wire-level IMAP scenarios against the in-memory backend.

mod common;

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use common::{FakeBackend, API_KEY, SENDER_EMAIL};
use xmit_mail::config::GatewayConfig;
use xmit_mail::imap::{CommandFrame, ImapSession, Response};
use xmit_mail::upstream::MailboxBackend;

fn new_session(backend: &Arc<FakeBackend>) -> ImapSession {
    let backend: Arc<dyn MailboxBackend> = backend.clone();
    ImapSession::new(1, "test-peer".to_string(), backend, Arc::new(GatewayConfig::default()))
}

async fn run(session: &mut ImapSession, line: &str) -> Vec<Response> {
    session
        .handle_frame(CommandFrame {
            line: line.as_bytes().to_vec(),
            literal: None,
        })
        .await
}

fn wire(responses: &[Response]) -> String {
    responses
        .iter()
        .map(|r| String::from_utf8_lossy(&r.to_bytes()).to_string())
        .collect()
}

fn assert_tagged_last(responses: &[Response]) {
    assert!(!responses.is_empty());
    assert!(responses.last().unwrap().is_tagged());
    for r in &responses[..responses.len() - 1] {
        assert!(!r.is_tagged(), "only the last response may be tagged");
    }
}

async fn login(session: &mut ImapSession) {
    let rs = run(session, &format!("a LOGIN api {}", API_KEY)).await;
    assert!(wire(&rs).contains("a OK LOGIN completed"), "{}", wire(&rs));
}

async fn select_inbox(session: &mut ImapSession) {
    let rs = run(session, "s SELECT \"Inbox\"").await;
    assert!(wire(&rs).contains("s OK [READ-WRITE] SELECT completed"));
}

#[tokio::test]
async fn test_login_and_list() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);

    login(&mut session).await;

    let rs = run(&mut session, "b LIST \"\" \"*\"").await;
    assert_tagged_last(&rs);
    let out = wire(&rs);
    assert!(
        out.contains("* LIST (\\Inbox) \"/\" \"support@acme.com/Inbox\""),
        "{}",
        out
    );
    assert!(out.contains("* LIST (\\Trash) \"/\" \"support@acme.com/Trash\""));
    assert!(out.ends_with("b OK LIST completed\r\n"));
}

#[tokio::test]
async fn test_login_rejects_bad_key_format() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);

    let rs = run(&mut session, "a LOGIN api hunter2").await;
    assert!(wire(&rs).contains("a NO [AUTHENTICATIONFAILED]"));
}

#[tokio::test]
async fn test_login_with_unknown_sender_fails() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);

    let rs = run(&mut session, &format!("a LOGIN nobody@acme.com {}", API_KEY)).await;
    assert!(wire(&rs).contains("a NO [AUTHENTICATIONFAILED]"));
}

#[tokio::test]
async fn test_pinned_sender_lists_bare_folder_names() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);

    let rs = run(&mut session, &format!("a LOGIN {} {}", SENDER_EMAIL, API_KEY)).await;
    assert!(wire(&rs).contains("a OK LOGIN completed"));

    let rs = run(&mut session, "b LIST \"\" \"*\"").await;
    let out = wire(&rs);
    assert!(out.contains("* LIST (\\Inbox) \"/\" \"Inbox\""), "{}", out);
    assert!(!out.contains("support@acme.com/"));
}

#[tokio::test]
async fn test_authenticate_plain_inline() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);

    let initial = BASE64.encode(format!("\0api\0{}", API_KEY));
    let rs = run(&mut session, &format!("a AUTHENTICATE PLAIN {}", initial)).await;
    assert!(wire(&rs).contains("a OK AUTHENTICATE completed"), "{}", wire(&rs));
}

#[tokio::test]
async fn test_authenticate_login_exchange() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);

    let rs = run(&mut session, "a AUTHENTICATE LOGIN").await;
    assert_eq!(rs, vec![Response::Continuation("VXNlcm5hbWU6".to_string())]);

    let rs = run(&mut session, &BASE64.encode("api")).await;
    assert_eq!(rs, vec![Response::Continuation("UGFzc3dvcmQ6".to_string())]);

    let rs = run(&mut session, &BASE64.encode(API_KEY)).await;
    assert!(wire(&rs).contains("a OK AUTHENTICATE completed"));
}

#[tokio::test]
async fn test_command_gating_by_state() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);

    let rs = run(&mut session, "x FETCH 1 (FLAGS)").await;
    assert!(wire(&rs).contains("x BAD"));

    login(&mut session).await;
    let rs = run(&mut session, "y EXPUNGE").await;
    assert!(wire(&rs).contains("y BAD"));

    // LOGIN twice is a state violation too.
    let rs = run(&mut session, &format!("z LOGIN api {}", API_KEY)).await;
    assert!(wire(&rs).contains("z BAD"));
}

#[tokio::test]
async fn test_capability() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);

    let rs = run(&mut session, "c CAPABILITY").await;
    let out = wire(&rs);
    for token in ["IMAP4rev1", "IDLE", "NAMESPACE", "UIDPLUS", "MOVE", "SPECIAL-USE", "AUTH=PLAIN", "AUTH=LOGIN"] {
        assert!(out.contains(token), "missing {} in {}", token, out);
    }
    assert!(out.ends_with("c OK CAPABILITY completed\r\n"));
}

#[tokio::test]
async fn test_select_empty_folder() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;

    let rs = run(&mut session, "c SELECT \"Drafts\"").await;
    assert_tagged_last(&rs);
    let out = wire(&rs);
    assert!(out.contains("* 0 EXISTS"));
    assert!(out.contains("* 0 RECENT"));
    assert!(!out.contains("[UNSEEN"));
    assert!(out.contains("* OK [UIDVALIDITY 43] UIDs valid"));
    assert!(out.ends_with("c OK [READ-WRITE] SELECT completed\r\n"));
}

#[tokio::test]
async fn test_select_inbox_reports_unseen_and_uidvalidity() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;

    let rs = run(&mut session, "s SELECT \"Inbox\"").await;
    let out = wire(&rs);
    assert!(out.contains("* 3 EXISTS"));
    assert!(out.contains("* OK [UNSEEN 2]"), "{}", out);
    assert!(out.contains("* OK [UIDVALIDITY 99]"));
    assert!(out.contains("* OK [UIDNEXT 31]"));
    assert!(out.contains("FLAGS (\\Seen \\Answered \\Flagged \\Deleted \\Draft)"));
    assert_eq!(session.selected_uids().unwrap(), &[10, 20, 30]);
}

#[tokio::test]
async fn test_status_returns_only_requested_items() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;

    let rs = run(&mut session, "t STATUS \"Inbox\" (MESSAGES UNSEEN)").await;
    let out = wire(&rs);
    assert!(out.contains("* STATUS \"Inbox\" (MESSAGES 3 UNSEEN 1)"), "{}", out);
    assert!(!out.contains("UIDNEXT"));
}

#[tokio::test]
async fn test_fetch_flags_by_sequence() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;
    select_inbox(&mut session).await;

    let rs = run(&mut session, "f FETCH 1:2 (FLAGS UID)").await;
    assert_tagged_last(&rs);
    let out = wire(&rs);
    assert!(out.contains("* 1 FETCH (FLAGS (\\Seen) UID 10)"), "{}", out);
    assert!(out.contains("* 2 FETCH (FLAGS () UID 20)"));
    assert!(!out.contains("UID 30"));
}

#[tokio::test]
async fn test_uid_fetch_body_peek_preserves_flags() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;
    select_inbox(&mut session).await;

    let rs = run(&mut session, "f UID FETCH 20 (BODY.PEEK[])").await;
    let out = wire(&rs);
    assert!(out.contains("* 2 FETCH (UID 20 BODY[] {"), "{}", out);
    assert!(out.contains("Subject: second"));
    // Peek must not set \Seen.
    assert!(!backend.flags_of("Inbox", 20).contains(&"\\Seen".to_string()));
}

#[tokio::test]
async fn test_fetch_envelope_and_internaldate() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;
    select_inbox(&mut session).await;

    let rs = run(&mut session, "f FETCH 1 (ENVELOPE INTERNALDATE RFC822.SIZE)").await;
    let out = wire(&rs);
    assert!(out.contains("ENVELOPE (\""), "{}", out);
    assert!(out.contains("\"first\""));
    assert!(out.contains("INTERNALDATE \"20-Jan-2026 12:00:00 +0000\""));
    assert!(out.contains("RFC822.SIZE "));
}

#[tokio::test]
async fn test_fetch_header_fields_section() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;
    select_inbox(&mut session).await;

    let rs = run(
        &mut session,
        "f UID FETCH 10 (BODY.PEEK[HEADER.FIELDS (Subject)])",
    )
    .await;
    let out = wire(&rs);
    assert!(
        out.contains("BODY[HEADER.FIELDS (Subject)] {"),
        "{}",
        out
    );
    assert!(out.contains("Subject: first\r\n\r\n"));
    assert!(!out.contains("From: Ada"));
}

#[tokio::test]
async fn test_fetch_partial_is_byte_based() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;
    select_inbox(&mut session).await;

    let rs = run(&mut session, "f UID FETCH 10 (BODY.PEEK[TEXT]<0.4>)").await;
    let out = wire(&rs);
    // "Body of first\r\n" truncated to 4 bytes.
    assert!(out.contains("BODY[TEXT]<0> {4}\r\nBody"), "{}", out);
}

#[tokio::test]
async fn test_append_then_fetch_roundtrip() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;

    let raw = b"Subject: Hi\r\n\r\nHello world\r\n";
    let rs = session
        .handle_frame(CommandFrame {
            line: b"d APPEND \"Drafts\" (\\Draft)".to_vec(),
            literal: Some(raw.to_vec()),
        })
        .await;
    let out = wire(&rs);
    assert!(out.contains("d OK [APPENDUID 43 1] APPEND completed"), "{}", out);
    assert_eq!(backend.flags_of("Drafts", 1), vec!["\\Draft".to_string()]);

    let rs = run(&mut session, "e SELECT \"Drafts\"").await;
    assert!(wire(&rs).contains("* 1 EXISTS"));

    let rs = run(&mut session, "g UID FETCH 1 (BODY.PEEK[])").await;
    let out = wire(&rs);
    let expected = format!("BODY[] {{{}}}\r\nSubject: Hi\r\n\r\nHello world\r\n", raw.len());
    assert!(out.contains(&expected), "{}", out);
}

#[tokio::test]
async fn test_append_missing_mailbox_try_create() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;

    let rs = session
        .handle_frame(CommandFrame {
            line: b"d APPEND \"Nonexistent\"".to_vec(),
            literal: Some(b"x".to_vec()),
        })
        .await;
    assert!(wire(&rs).contains("d NO [TRYCREATE]"), "{}", wire(&rs));
}

#[tokio::test]
async fn test_move_with_sequence_shift() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;
    select_inbox(&mut session).await;

    let rs = run(&mut session, "f UID MOVE 10,30 \"Trash\"").await;
    assert_tagged_last(&rs);

    // UID 10 is sequence 1; after its splice UID 30 is sequence 2.
    assert_eq!(
        rs[0],
        Response::Untagged(b"1 EXPUNGE".to_vec()),
    );
    assert_eq!(
        rs[1],
        Response::Untagged(b"2 EXPUNGE".to_vec()),
    );
    let out = wire(&rs);
    assert!(out.contains("f OK [COPYUID 44 10,30 1,2] MOVE completed"), "{}", out);

    assert_eq!(session.selected_uids().unwrap(), &[20]);
    assert_eq!(backend.uids_in("Inbox"), vec![20]);
    assert_eq!(backend.uids_in("Trash"), vec![1, 2]);
}

#[tokio::test]
async fn test_copy_reports_copyuid() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;
    select_inbox(&mut session).await;

    let rs = run(&mut session, "f UID COPY 10 \"Sent\"").await;
    let out = wire(&rs);
    assert!(out.contains("f OK [COPYUID 42 10 1] COPY completed"), "{}", out);
    // Source untouched.
    assert_eq!(session.selected_uids().unwrap(), &[10, 20, 30]);
    assert_eq!(backend.uids_in("Sent"), vec![1]);
}

#[tokio::test]
async fn test_store_and_expunge_shift() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;
    select_inbox(&mut session).await;

    let rs = run(&mut session, "g STORE 1,3 +FLAGS (\\Deleted)").await;
    let out = wire(&rs);
    assert!(out.contains("* 1 FETCH (FLAGS (\\Seen \\Deleted))"), "{}", out);
    assert!(out.contains("* 3 FETCH (FLAGS (\\Seen \\Deleted))"));

    let rs = run(&mut session, "h EXPUNGE").await;
    assert_eq!(rs[0], Response::Untagged(b"1 EXPUNGE".to_vec()));
    assert_eq!(rs[1], Response::Untagged(b"2 EXPUNGE".to_vec()));
    assert!(wire(&rs).ends_with("h OK EXPUNGE completed\r\n"));
    assert_eq!(session.selected_uids().unwrap(), &[20]);
}

#[tokio::test]
async fn test_store_silent_suppresses_fetch() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;
    select_inbox(&mut session).await;

    let rs = run(&mut session, "g STORE 1 +FLAGS.SILENT (\\Flagged)").await;
    assert_eq!(rs.len(), 1);
    assert!(wire(&rs).contains("g OK STORE completed"));
    assert!(backend.flags_of("Inbox", 10).contains(&"\\Flagged".to_string()));
}

#[tokio::test]
async fn test_uid_expunge_respects_set() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;
    select_inbox(&mut session).await;

    run(&mut session, "g STORE 1,3 +FLAGS.SILENT (\\Deleted)").await;
    let rs = run(&mut session, "h UID EXPUNGE 30").await;
    assert_eq!(rs[0], Response::Untagged(b"3 EXPUNGE".to_vec()));
    assert_eq!(rs.len(), 2);
    // UID 10 keeps its \Deleted flag but stays.
    assert_eq!(session.selected_uids().unwrap(), &[10, 20]);
}

#[tokio::test]
async fn test_close_expunges_silently() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;
    select_inbox(&mut session).await;

    run(&mut session, "g STORE 1 +FLAGS.SILENT (\\Deleted)").await;
    let rs = run(&mut session, "h CLOSE").await;
    assert_eq!(rs.len(), 1);
    assert!(wire(&rs).contains("h OK CLOSE completed"));
    assert_eq!(backend.uids_in("Inbox"), vec![20, 30]);

    // Back to authenticated state; SELECT works again.
    let rs = run(&mut session, "i SELECT \"Inbox\"").await;
    assert!(wire(&rs).contains("* 2 EXISTS"));
}

#[tokio::test]
async fn test_search_remaps_to_sequence_numbers() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;
    select_inbox(&mut session).await;

    backend.set_search_results(&[20, 30]);
    let rs = run(&mut session, "j SEARCH UNSEEN").await;
    let out = wire(&rs);
    assert!(out.contains("* SEARCH 2 3\r\n"), "{}", out);

    backend.set_search_results(&[20, 30]);
    let rs = run(&mut session, "k UID SEARCH UNSEEN").await;
    assert!(wire(&rs).contains("* SEARCH 20 30\r\n"));
}

#[tokio::test]
async fn test_idle_done_and_ignored_lines() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;
    select_inbox(&mut session).await;

    let rs = run(&mut session, "l IDLE").await;
    assert_eq!(rs, vec![Response::Continuation("idling".to_string())]);
    assert!(session.is_idling());
    assert!(session.idle_deadline().is_some());

    // Anything but DONE is ignored while idling.
    let rs = run(&mut session, "noise").await;
    assert!(rs.is_empty());

    let rs = run(&mut session, "DONE").await;
    assert_eq!(rs, vec![Response::ok("l", "IDLE terminated")]);
    assert!(!session.is_idling());
}

#[tokio::test]
async fn test_idle_timeout_response() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;
    select_inbox(&mut session).await;

    run(&mut session, "l IDLE").await;
    let rs = session.end_idle_timeout();
    assert_eq!(rs, vec![Response::ok("l", "IDLE terminated (timeout)")]);
}

#[tokio::test]
async fn test_namespace_fixed_reply() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;

    let rs = run(&mut session, "n NAMESPACE").await;
    let out = wire(&rs);
    assert!(out.contains("* NAMESPACE ((\"\" \"/\")) NIL NIL"));
    assert!(out.ends_with("n OK NAMESPACE completed\r\n"));
}

#[tokio::test]
async fn test_rename_not_supported() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;

    let rs = run(&mut session, "r RENAME \"Inbox\" \"Elsewhere\"").await;
    assert!(wire(&rs).contains("r NO Rename is not supported"));
}

#[tokio::test]
async fn test_mailbox_alias_resolution() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;

    // Outlook spelling resolves to the canonical Trash folder.
    let rs = run(&mut session, "s SELECT \"Deleted Items\"").await;
    assert!(wire(&rs).contains("s OK [READ-WRITE] SELECT completed"));

    let rs = run(&mut session, "t SELECT \"No Such Folder\"").await;
    assert!(wire(&rs).contains("t NO Mailbox does not exist"));
}

#[tokio::test]
async fn test_examine_is_read_only() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    login(&mut session).await;

    let rs = run(&mut session, "e EXAMINE \"Inbox\"").await;
    assert!(wire(&rs).contains("e OK [READ-ONLY] EXAMINE completed"));

    let rs = run(&mut session, "f STORE 1 +FLAGS (\\Deleted)").await;
    assert!(wire(&rs).contains("f NO Mailbox is read-only"));
}

#[tokio::test]
async fn test_parse_error_yields_bad() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);

    let rs = run(&mut session, "lonely").await;
    assert!(wire(&rs).starts_with("* BAD"));
}
