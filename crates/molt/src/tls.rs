//! TLS-aware listener setup.
//!
//! Certificate material is opaque configuration to the lifecycle core: it
//! is loaded once at startup and any failure is fatal before serving
//! begins. The TLS layer wraps the *tracked* TCP stream, so drain
//! accounting always sees the raw connection lifecycle.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::debug;

use crate::error::ServeError;

/// TLS configuration for a [`Server`](crate::Server): PEM certificate
/// chain and private key paths, plus the advertised ALPN protocols
/// (defaults to `http/1.1`).
#[derive(Debug, Clone)]
pub struct TlsSettings {
    cert_path: PathBuf,
    key_path: PathBuf,
    alpn: Vec<Vec<u8>>,
}

impl TlsSettings {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            alpn: Vec::new(),
        }
    }

    /// Override the ALPN protocol list.
    pub fn alpn<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.alpn = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn load(&self) -> Result<Arc<rustls::ServerConfig>, ServeError> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_key(&self.key_path)?;

        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        config.alpn_protocols = if self.alpn.is_empty() {
            vec![b"http/1.1".to_vec()]
        } else {
            self.alpn.clone()
        };

        debug!(
            cert = %self.cert_path.display(),
            key = %self.key_path.display(),
            "TLS configuration loaded"
        );
        Ok(Arc::new(config))
    }
}

fn load_error(path: &Path, source: io::Error) -> ServeError {
    ServeError::CertificateLoad {
        path: path.to_path_buf(),
        source,
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServeError> {
    let file = File::open(path).map_err(|e| load_error(path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| load_error(path, e))?;
    if certs.is_empty() {
        return Err(load_error(
            path,
            io::Error::new(io::ErrorKind::InvalidData, "no certificates found in PEM file"),
        ));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServeError> {
    let file = File::open(path).map_err(|e| load_error(path, e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| load_error(path, e))?
        .ok_or_else(|| {
            load_error(
                path,
                io::Error::new(io::ErrorKind::InvalidData, "no private key found in PEM file"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("molt-tls-{}-{name}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// Missing certificate file is a startup failure.
    #[test]
    fn test_missing_cert_file() {
        let settings = TlsSettings::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        let err = settings.load().unwrap_err();
        assert!(matches!(err, ServeError::CertificateLoad { .. }));
    }

    /// A PEM file without certificates is rejected.
    #[test]
    fn test_empty_pem_rejected() {
        let cert = scratch_file("empty-cert.pem", "not a certificate\n");
        let key = scratch_file("empty-key.pem", "not a key\n");

        let err = TlsSettings::new(&cert, &key).load().unwrap_err();
        assert!(matches!(err, ServeError::CertificateLoad { .. }));

        std::fs::remove_file(cert).ok();
        std::fs::remove_file(key).ok();
    }

    #[test]
    fn test_alpn_override() {
        let settings = TlsSettings::new("c", "k").alpn([b"h2".to_vec(), b"http/1.1".to_vec()]);
        assert_eq!(settings.alpn.len(), 2);
    }
}
