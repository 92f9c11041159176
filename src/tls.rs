//! TLS material loading
//!
//! Key and certificate are loaded once at startup; the resulting server
//! config is shared read-only by every listener.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::GatewayConfig;
use crate::error::{Error, Result};

pub fn load_acceptor(config: &GatewayConfig) -> Result<Option<TlsAcceptor>> {
    if !config.tls_enabled() {
        return Ok(None);
    }
    let cert_path = config.tls_cert_path.as_ref().unwrap();
    let key_path = config.tls_key_path.as_ref().unwrap();

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("invalid key/cert pair: {}", e)))?;

    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs = certs.map_err(|e| Error::Tls(format!("bad certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Tls(format!("bad key PEM: {}", e)))?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", path.display())))
}
