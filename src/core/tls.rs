//! TLS listener configuration
//!
//! Certificate and key are loaded once when an instance starts; codecs only
//! ever see the decrypted stream.

use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::error::{ProxyError, Result};

/// Create TLS config from PEM certificate chain and private key files
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert_file = File::open(cert_path)
        .map_err(|e| ProxyError::Tls(format!("open {}: {}", cert_path.display(), e)))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .filter_map(|r| r.ok())
        .collect();

    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path)
        .map_err(|e| ProxyError::Tls(format!("open {}: {}", key_path.display(), e)))?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ProxyError::Tls(format!("read {}: {}", key_path.display(), e)))?
        .ok_or_else(|| ProxyError::Tls(format!("no private key found in {}", key_path.display())))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(e.to_string()))?;

    // Session tickets let reconnecting clients skip the full handshake
    if let Ok(ticketer) = rustls::crypto::ring::Ticketer::new() {
        config.ticketer = ticketer;
    }

    Ok(Arc::new(config))
}

/// Build an acceptor for a listener
pub fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    load_tls_config(cert_path, key_path).map(TlsAcceptor::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_tls_config_invalid_cert() {
        let mut cert_file = NamedTempFile::new().unwrap();
        cert_file.write_all(b"invalid cert").unwrap();

        let mut key_file = NamedTempFile::new().unwrap();
        key_file.write_all(b"invalid key").unwrap();

        let result = load_tls_config(cert_file.path(), key_file.path());
        assert!(matches!(result, Err(ProxyError::Tls(_))));
    }

    #[test]
    fn test_tls_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = build_acceptor(&dir.path().join("cert.pem"), &dir.path().join("key.pem"));
        match result {
            Err(ProxyError::Tls(msg)) => assert!(msg.contains("cert.pem")),
            _ => panic!("expected TLS error"),
        }
    }
}
