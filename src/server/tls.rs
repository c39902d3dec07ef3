//! TLS configuration — loading the configured certificate and key.
//!
//! The server's TLS identity comes from `server_cert_path` /
//! `server_key_path`. Both PEM files are read once at startup into a
//! `rustls::ServerConfig`; failures here are configuration errors and fatal.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tracing::debug;

use crate::{Error, Result};

/// Build a `rustls::ServerConfig` from PEM certificate and key files.
///
/// # Errors
///
/// Returns [`Error::Config`] if either file cannot be read or parsed, or if
/// the pair does not match.
pub fn build_tls_config(cert_path: &str, key_path: &str) -> Result<ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut tls_cfg = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("TLS config error (cert/key mismatch?): {e}")))?;

    // Prefer HTTP/2, fall back to HTTP/1.1
    tls_cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(cert = %cert_path, "TLS config built");
    Ok(tls_cfg)
}

/// Load all certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = std::fs::read(path)
        .map_err(|e| Error::Config(format!("Failed to read '{path}': {e}")))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem_data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certs from '{path}': {e}")))?;

    if certs.is_empty() {
        return Err(Error::Config(format!("No certificates found in '{path}'")));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// Supports RSA (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`), and EC keys.
fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem_data = std::fs::read(path)
        .map_err(|e| Error::Config(format!("Failed to read '{path}': {e}")))?;
    let key = rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| Error::Config(format!("Failed to parse private key from '{path}': {e}")))?
        .ok_or_else(|| Error::Config(format!("No private key found in '{path}'")))?;

    Ok(key)
}
