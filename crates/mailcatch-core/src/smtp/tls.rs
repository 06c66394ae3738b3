//! TLS support for SMTP

use anyhow::{anyhow, Result};
use mailcatch_common::config::TlsConfig;
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Serves one certificate for every requested server name
pub struct StaticCertResolver {
    key: Arc<CertifiedKey>,
}

impl fmt::Debug for StaticCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCertResolver")
            .field("certificates", &self.key.cert.len())
            .finish()
    }
}

impl StaticCertResolver {
    /// Load a PEM certificate chain and private key from disk
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read(cert_path)
            .map_err(|e| anyhow!("Failed to open certificate file {}: {}", cert_path.display(), e))?;
        let key_pem = std::fs::read(key_path)
            .map_err(|e| anyhow!("Failed to open key file {}: {}", key_path.display(), e))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let mut cert_reader = cert_pem;
        let chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("Failed to parse certificates: {}", e))?;

        if chain.is_empty() {
            return Err(anyhow!("No certificates found in certificate file"));
        }

        let mut key_reader = key_pem;
        let key = private_key(&mut key_reader)
            .map_err(|e| anyhow!("Failed to read private key: {}", e))?
            .ok_or_else(|| anyhow!("No private key found in key file"))?;

        let signing_key =
            any_supported_type(&key).map_err(|e| anyhow!("Unsupported private key: {}", e))?;

        info!(certificates = chain.len(), "Loaded TLS certificate");

        Ok(Self {
            key: Arc::new(CertifiedKey::new(chain, signing_key)),
        })
    }
}

impl ResolvesServerCert for StaticCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.key.clone())
    }
}

/// Build an acceptor around any certificate provider
pub fn acceptor_from_resolver(resolver: Arc<dyn ResolvesServerCert>) -> TlsAcceptor {
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    TlsAcceptor::from(Arc::new(server_config))
}

/// Acceptor for the configured static certificate, or `None` when TLS is off
pub fn create_tls_acceptor(tls_config: &TlsConfig) -> Result<Option<TlsAcceptor>> {
    if !tls_config.enabled {
        return Ok(None);
    }

    let cert_path = tls_config
        .cert_path
        .as_deref()
        .ok_or_else(|| anyhow!("server.tls.cert_path is required when TLS is enabled"))?;
    let key_path = tls_config
        .key_path
        .as_deref()
        .ok_or_else(|| anyhow!("server.tls.key_path is required when TLS is enabled"))?;

    let resolver = StaticCertResolver::from_files(cert_path, key_path)?;
    Ok(Some(acceptor_from_resolver(Arc::new(resolver))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_tls_has_no_acceptor() {
        assert!(create_tls_acceptor(&TlsConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_from_pem() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let resolver = StaticCertResolver::from_pem(
            generated.cert.pem().as_bytes(),
            generated.signing_key.serialize_pem().as_bytes(),
        )
        .unwrap();
        assert_eq!(resolver.key.cert.len(), 1);
    }

    #[test]
    fn test_rejects_empty_pem() {
        assert!(StaticCertResolver::from_pem(b"", b"").is_err());
    }

    #[test]
    fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = TlsConfig {
            enabled: true,
            cert_path: Some(dir.path().join("cert.pem")),
            key_path: Some(dir.path().join("key.pem")),
            ..TlsConfig::default()
        };
        assert!(create_tls_acceptor(&config).is_err());
    }
}
