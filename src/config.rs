//! Environment-driven gateway configuration
//!
//! Variable names and defaults are an external contract shared with the
//! hosted deployment; `NODE_ENV=development` keeps compatibility with the
//! original service and disables TLS for local runs.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub smtp_port: u16,
    pub imap_port: u16,
    pub api_base: String,
    pub tls_key_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    /// True unless NODE_ENV=development; gates TLS and AUTH requirements.
    pub production: bool,
    pub api_key_cache_ttl: Duration,
    pub api_timeout: Duration,
    pub max_message_size: usize,
    pub imap_idle_timeout: Duration,
    pub cache_dir: PathBuf,
    pub cache_memory_bytes: usize,
    pub cache_persistent_bytes: u64,
    /// Maximum IMAP command line length in bytes.
    pub max_line_size: usize,
    /// Maximum IMAP literal size in bytes.
    pub max_literal_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            smtp_port: 587,
            imap_port: 993,
            api_base: "https://api.xmit.sh".to_string(),
            tls_key_path: None,
            tls_cert_path: None,
            production: true,
            api_key_cache_ttl: Duration::from_millis(300_000),
            api_timeout: Duration::from_millis(30_000),
            max_message_size: 10 * 1024 * 1024,
            imap_idle_timeout: Duration::from_millis(1_800_000),
            cache_dir: PathBuf::from("."),
            cache_memory_bytes: 50 * 1024 * 1024,
            cache_persistent_bytes: 500 * 1024 * 1024,
            max_line_size: 64 * 1024,
            max_literal_size: 50 * 1024 * 1024,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_parse("SMTP_PORT") {
            config.smtp_port = port;
        }
        if let Some(port) = env_parse("IMAP_PORT") {
            config.imap_port = port;
        }
        if let Ok(base) = std::env::var("API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Ok(path) = std::env::var("TLS_KEY_PATH") {
            config.tls_key_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("TLS_CERT_PATH") {
            config.tls_cert_path = Some(PathBuf::from(path));
        }
        if let Ok(env) = std::env::var("NODE_ENV") {
            config.production = env != "development";
        }
        if let Some(ms) = env_parse("API_KEY_CACHE_TTL") {
            config.api_key_cache_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("API_TIMEOUT") {
            config.api_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = env_parse("MAX_MESSAGE_SIZE") {
            config.max_message_size = bytes;
        }
        if let Some(ms) = env_parse("IMAP_IDLE_TIMEOUT") {
            config.imap_idle_timeout = Duration::from_millis(ms);
        }
        if let Ok(dir) = std::env::var("CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(mb) = env_parse::<usize>("CACHE_MEMORY_MB") {
            config.cache_memory_bytes = mb * 1024 * 1024;
        }
        if let Some(mb) = env_parse::<u64>("CACHE_PERSISTENT_MB") {
            config.cache_persistent_bytes = mb * 1024 * 1024;
        }

        config
    }

    /// TLS is required when running in production with key material present.
    pub fn tls_enabled(&self) -> bool {
        self.production && self.tls_key_path.is_some() && self.tls_cert_path.is_some()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!("Ignoring invalid value for {}: {}", name, value);
                None
            }
        },
        Err(_) => None,
    }
}
