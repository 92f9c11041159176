use tracing_subscriber::EnvFilter;

use xmit_mail::{server, GatewayConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::from_env();
    tracing::info!(
        "Starting xmit-mail gateway (IMAP :{}, SMTP :{}, upstream {})",
        config.imap_port,
        config.smtp_port,
        config.api_base
    );

    if let Err(e) = server::run(config).await {
        tracing::error!("Gateway terminated: {}", e);
        std::process::exit(1);
    }
}
