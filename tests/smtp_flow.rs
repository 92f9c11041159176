//! SMTP submission scenarios against the in-memory backend.

mod common;

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use common::{FakeBackend, API_KEY};
use xmit_mail::config::GatewayConfig;
use xmit_mail::smtp::SmtpSession;
use xmit_mail::upstream::MailboxBackend;

fn dev_config() -> Arc<GatewayConfig> {
    Arc::new(GatewayConfig {
        production: false,
        ..GatewayConfig::default()
    })
}

fn new_session(backend: &Arc<FakeBackend>) -> SmtpSession {
    let backend: Arc<dyn MailboxBackend> = backend.clone();
    SmtpSession::new(
        "mail.xmit.sh",
        "test-peer".to_string(),
        false,
        false,
        backend,
        dev_config(),
    )
}

async fn send(session: &mut SmtpSession, line: &str) -> String {
    let result = session
        .process_input(format!("{}\r\n", line).as_bytes())
        .await;
    String::from_utf8_lossy(&result.response).to_string()
}

async fn authenticate(session: &mut SmtpSession) {
    let reply = send(session, "EHLO client.example.org").await;
    assert!(reply.contains("250"), "{}", reply);
    let initial = BASE64.encode(format!("\0api\0{}", API_KEY));
    let reply = send(session, &format!("AUTH PLAIN {}", initial)).await;
    assert!(reply.starts_with("235"), "{}", reply);
}

#[tokio::test]
async fn test_greeting_and_ehlo_capabilities() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);

    let greeting = String::from_utf8_lossy(&session.greeting()).to_string();
    assert!(greeting.starts_with("220 mail.xmit.sh ESMTP"));

    let reply = send(&mut session, "EHLO client.example.org").await;
    assert!(reply.contains("250-mail.xmit.sh Hello client.example.org"));
    assert!(reply.contains("250-SIZE 10485760"));
    assert!(reply.contains("AUTH PLAIN LOGIN"), "{}", reply);
}

#[tokio::test]
async fn test_auth_plain_bad_key() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);

    send(&mut session, "EHLO c").await;
    let initial = BASE64.encode("\0api\0pm_live_wrong");
    let reply = send(&mut session, &format!("AUTH PLAIN {}", initial)).await;
    assert!(reply.starts_with("535"), "{}", reply);

    let initial = BASE64.encode("\0api\0not_a_key");
    let reply = send(&mut session, &format!("AUTH PLAIN {}", initial)).await;
    assert!(reply.starts_with("535"));
}

#[tokio::test]
async fn test_auth_login_exchange() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);

    send(&mut session, "EHLO c").await;
    let reply = send(&mut session, "AUTH LOGIN").await;
    assert!(reply.starts_with("334 VXNlcm5hbWU6"), "{}", reply);
    let reply = send(&mut session, &BASE64.encode("api")).await;
    assert!(reply.starts_with("334 UGFzc3dvcmQ6"));
    let reply = send(&mut session, &BASE64.encode(API_KEY)).await;
    assert!(reply.starts_with("235"));
}

#[tokio::test]
async fn test_mail_requires_auth() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);

    send(&mut session, "EHLO c").await;
    let reply = send(&mut session, "MAIL FROM:<ada@acme.com>").await;
    assert!(reply.starts_with("530"), "{}", reply);
}

#[tokio::test]
async fn test_full_submission() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    authenticate(&mut session).await;

    assert!(send(&mut session, "MAIL FROM:<ada@acme.com>")
        .await
        .starts_with("250"));
    assert!(send(&mut session, "RCPT TO:<bob@acme.com>")
        .await
        .starts_with("250"));
    assert!(send(&mut session, "DATA").await.starts_with("354"));

    let reply = send(
        &mut session,
        "From: Ada <ada@acme.com>\r\nTo: Bob <bob@acme.com>\r\nSubject: Hello\r\n\r\nHi Bob!\r\n.",
    )
    .await;
    assert!(reply.starts_with("250"), "{}", reply);

    let sent = backend.sent_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].from, "ada@acme.com");
    assert_eq!(sent[0].to, vec!["bob@acme.com"]);
    assert_eq!(sent[0].subject.as_deref(), Some("Hello"));
    assert_eq!(sent[0].text.as_deref().map(str::trim_end), Some("Hi Bob!"));

    // The transaction reset; a second message can follow.
    assert!(send(&mut session, "MAIL FROM:<ada@acme.com>")
        .await
        .starts_with("250"));
}

#[tokio::test]
async fn test_declared_size_too_large() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    authenticate(&mut session).await;

    let reply = send(&mut session, "MAIL FROM:<ada@acme.com> SIZE=99999999").await;
    assert!(reply.starts_with("552"), "{}", reply);
}

#[tokio::test]
async fn test_bad_sequence_replies() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);

    // MAIL before EHLO.
    let reply = send(&mut session, "MAIL FROM:<a@b.c>").await;
    assert!(reply.starts_with("503"), "{}", reply);

    authenticate(&mut session).await;
    // DATA before RCPT.
    let reply = send(&mut session, "DATA").await;
    assert!(reply.starts_with("503"));

    // RCPT before MAIL.
    let reply = send(&mut session, "RCPT TO:<b@c.d>").await;
    assert!(reply.starts_with("503"));
}

#[tokio::test]
async fn test_invalid_recipient_rejected() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    authenticate(&mut session).await;

    send(&mut session, "MAIL FROM:<ada@acme.com>").await;
    let reply = send(&mut session, "RCPT TO:<not-an-address>").await;
    assert!(reply.starts_with("550"), "{}", reply);
}

#[tokio::test]
async fn test_rset_clears_transaction() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    authenticate(&mut session).await;

    send(&mut session, "MAIL FROM:<ada@acme.com>").await;
    send(&mut session, "RCPT TO:<bob@acme.com>").await;
    assert!(send(&mut session, "RSET").await.starts_with("250"));

    // DATA now out of sequence again.
    let reply = send(&mut session, "DATA").await;
    assert!(reply.starts_with("503"));
}

#[tokio::test]
async fn test_quit_closes() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);

    let result = session.process_input(b"QUIT\r\n").await;
    assert!(String::from_utf8_lossy(&result.response).starts_with("221"));
    assert!(result.should_close);
}

#[tokio::test]
async fn test_pipelined_commands_in_one_read() {
    let backend = FakeBackend::with_fixture();
    let mut session = new_session(&backend);
    authenticate(&mut session).await;

    let result = session
        .process_input(b"MAIL FROM:<ada@acme.com>\r\nRCPT TO:<bob@acme.com>\r\nDATA\r\n")
        .await;
    let reply = String::from_utf8_lossy(&result.response).to_string();
    assert!(reply.contains("250 OK <ada@acme.com>"));
    assert!(reply.contains("250 OK <bob@acme.com>"));
    assert!(reply.contains("354"), "{}", reply);
}

#[tokio::test]
async fn test_production_requires_tls_for_auth() {
    let backend = FakeBackend::with_fixture();
    let b: Arc<dyn MailboxBackend> = backend.clone();
    let mut session = SmtpSession::new(
        "mail.xmit.sh",
        "test-peer".to_string(),
        false,
        true,
        b,
        Arc::new(GatewayConfig::default()),
    );

    let reply = send(&mut session, "EHLO c").await;
    assert!(reply.contains("STARTTLS"));
    assert!(!reply.contains("AUTH PLAIN"), "{}", reply);

    let reply = send(&mut session, "AUTH PLAIN dGVzdA==").await;
    assert!(reply.starts_with("538"), "{}", reply);
}
