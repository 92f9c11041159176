//! TCP/TLS listeners and per-connection drive loops
//!
//! One task per connection. Within a session everything is serial: the loop
//! reads, feeds the framer, runs the handler to completion, writes the
//! responses, then reads again. The select against a deadline implements
//! the literal timeout, the IDLE timer and the connection idle timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::cache::{ttl, CacheManager, MemoryCache, PersistentCache};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::imap::{FrameEvent, Framer, ImapSession};
use crate::smtp::SmtpSession;
use crate::tls;
use crate::upstream::{MailboxBackend, TransmitClient};

const SMTP_HOSTNAME: &str = "mail.xmit.sh";
const LITERAL_TIMEOUT: Duration = Duration::from_secs(60);
const SMTP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const MEMORY_CACHE_MAX_ENTRIES: usize = 50_000;
const READ_BUFFER_SIZE: usize = 8192;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Build the shared pieces and run both listeners until one fails.
pub async fn run(config: GatewayConfig) -> Result<()> {
    let config = Arc::new(config);

    let memory = MemoryCache::new(
        MEMORY_CACHE_MAX_ENTRIES,
        config.cache_memory_bytes,
        ttl::MESSAGES,
    );
    let persistent = PersistentCache::open(
        config.cache_dir.join("bodies.db"),
        config.cache_persistent_bytes,
    )?;
    let cache = Arc::new(CacheManager::new(memory, persistent));
    CacheManager::start_prune_task(Arc::clone(&cache));

    let backend: Arc<dyn MailboxBackend> =
        Arc::new(TransmitClient::new(&config, Arc::clone(&cache))?);
    let acceptor = tls::load_acceptor(&config)?;
    if acceptor.is_none() {
        tracing::warn!("TLS disabled; serving plaintext (development only)");
    }

    tokio::try_join!(
        run_imap_listener(Arc::clone(&config), Arc::clone(&backend), acceptor.clone()),
        run_smtp_listener(Arc::clone(&config), backend, acceptor),
    )?;
    Ok(())
}

pub async fn run_imap_listener(
    config: Arc<GatewayConfig>,
    backend: Arc<dyn MailboxBackend>,
    acceptor: Option<TlsAcceptor>,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.imap_port)).await?;
    tracing::info!("IMAP listener on port {}", config.imap_port);

    loop {
        let (socket, addr) = listener.accept().await?;
        let config = Arc::clone(&config);
        let backend = Arc::clone(&backend);
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(session = id, "IMAP connection from {}", addr);
            let session = ImapSession::new(id, addr.to_string(), backend, Arc::clone(&config));

            let result = match acceptor {
                Some(acceptor) => match acceptor.accept(socket).await {
                    Ok(stream) => drive_imap(stream, session, &config).await,
                    Err(e) => {
                        tracing::debug!(session = id, "TLS handshake failed: {}", e);
                        return;
                    }
                },
                None => drive_imap(socket, session, &config).await,
            };
            if let Err(e) = result {
                tracing::debug!(session = id, "IMAP session ended: {}", e);
            }
        });
    }
}

async fn drive_imap<S>(
    mut stream: S,
    mut session: ImapSession,
    config: &GatewayConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&ImapSession::greeting()).await?;

    let mut framer = Framer::new(config.max_line_size, config.max_literal_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let deadline = if framer.awaiting_literal() {
            Instant::now() + LITERAL_TIMEOUT
        } else if let Some(idle_deadline) = session.idle_deadline() {
            idle_deadline
        } else {
            Instant::now() + config.imap_idle_timeout
        };

        tokio::select! {
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                for event in framer.feed(&buf[..n]) {
                    match event {
                        FrameEvent::SendContinuation => {
                            stream.write_all(b"+ Ready for literal data\r\n").await?;
                        }
                        FrameEvent::Reject { message, close } => {
                            stream
                                .write_all(format!("* BAD {}\r\n", message).as_bytes())
                                .await?;
                            if close {
                                return Ok(());
                            }
                        }
                        FrameEvent::Command(frame) => {
                            for response in session.handle_frame(frame).await {
                                stream.write_all(&response.to_bytes()).await?;
                            }
                            if session.should_close() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline.into()) => {
                if framer.awaiting_literal() {
                    stream.write_all(b"* BAD Literal data timeout\r\n").await?;
                    return Ok(());
                }
                if session.is_idling() {
                    for response in session.end_idle_timeout() {
                        stream.write_all(&response.to_bytes()).await?;
                    }
                    continue;
                }
                stream.write_all(b"* BYE Connection timed out\r\n").await?;
                return Ok(());
            }
        }
    }
}

pub async fn run_smtp_listener(
    config: Arc<GatewayConfig>,
    backend: Arc<dyn MailboxBackend>,
    acceptor: Option<TlsAcceptor>,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.smtp_port)).await?;
    tracing::info!("SMTP listener on port {}", config.smtp_port);

    loop {
        let (socket, addr) = listener.accept().await?;
        let config = Arc::clone(&config);
        let backend = Arc::clone(&backend);
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            tracing::debug!("SMTP connection from {}", addr);
            if let Err(e) =
                handle_smtp_connection(socket, addr.to_string(), acceptor, backend, config).await
            {
                tracing::debug!("SMTP session ended: {}", e);
            }
        });
    }
}

/// Plaintext phase of an SMTP connection; upgrades in place on STARTTLS.
async fn handle_smtp_connection(
    mut stream: TcpStream,
    peer: String,
    acceptor: Option<TlsAcceptor>,
    backend: Arc<dyn MailboxBackend>,
    config: Arc<GatewayConfig>,
) -> Result<()> {
    let mut session = SmtpSession::new(
        SMTP_HOSTNAME,
        peer,
        false,
        acceptor.is_some(),
        backend,
        Arc::clone(&config),
    );
    stream.write_all(&session.greeting()).await?;

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match tokio::time::timeout(SMTP_IDLE_TIMEOUT, stream.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                let _ = stream
                    .write_all(b"421 Idle timeout, closing transmission channel\r\n")
                    .await;
                return Ok(());
            }
        };
        if n == 0 {
            return Ok(());
        }

        let result = session.process_input(&buf[..n]).await;
        if !result.response.is_empty() {
            stream.write_all(&result.response).await?;
        }
        if result.start_tls {
            // The acceptor exists whenever the session offered STARTTLS.
            let acceptor = acceptor.expect("STARTTLS accepted without TLS config");
            let tls_stream = acceptor.accept(stream).await?;
            session.tls_established();
            return drive_smtp(tls_stream, session).await;
        }
        if result.should_close {
            return Ok(());
        }
    }
}

/// Post-STARTTLS phase; no greeting, no further upgrades.
async fn drive_smtp<S>(mut stream: S, mut session: SmtpSession) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match tokio::time::timeout(SMTP_IDLE_TIMEOUT, stream.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                let _ = stream
                    .write_all(b"421 Idle timeout, closing transmission channel\r\n")
                    .await;
                return Ok(());
            }
        };
        if n == 0 {
            return Ok(());
        }

        let result = session.process_input(&buf[..n]).await;
        if !result.response.is_empty() {
            stream.write_all(&result.response).await?;
        }
        if result.should_close {
            return Ok(());
        }
    }
}
