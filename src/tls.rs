//! TLS support for the control-plane server.
//!
//! Loads PEM-encoded certificate chains and private keys, builds a rustls
//! `ServerConfig`, and wraps it in a `TlsAcceptor` for use with the manual
//! accept loop in `server::serve()`. When a client CA bundle is given,
//! clients must present a certificate signed by it.

use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use tokio_rustls::rustls::RootCertStore;
use tokio_rustls::TlsAcceptor;

/// Errors that can occur when loading TLS configuration.
#[derive(Debug)]
pub enum TlsError {
    /// Failed to read the certificate file.
    CertRead(std::io::Error),
    /// Failed to read the private key file.
    KeyRead(std::io::Error),
    /// Failed to read the client CA bundle.
    ClientCaRead(std::io::Error),
    /// No certificates found in the PEM file.
    NoCerts,
    /// No private key found in the PEM file.
    NoKey,
    /// The client CA bundle holds no usable certificates.
    NoClientCa,
    /// Failed to build the client certificate verifier.
    ClientVerifier(VerifierBuilderError),
    /// Failed to build the TLS server configuration.
    Config(tokio_rustls::rustls::Error),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CertRead(e) => write!(f, "failed to read TLS certificate file: {}", e),
            Self::KeyRead(e) => write!(f, "failed to read TLS key file: {}", e),
            Self::ClientCaRead(e) => write!(f, "failed to read TLS client CA file: {}", e),
            Self::NoCerts => write!(f, "no certificates found in PEM file"),
            Self::NoKey => write!(f, "no private key found in PEM file"),
            Self::NoClientCa => write!(f, "no usable certificates in client CA file"),
            Self::ClientVerifier(e) => write!(f, "failed to build client verifier: {}", e),
            Self::Config(e) => write!(f, "failed to build TLS config: {}", e),
        }
    }
}

impl std::error::Error for TlsError {}

/// Load TLS certificate chain and private key from PEM files, returning a
/// `TlsAcceptor` ready for use with `tokio_rustls`.
///
/// With `client_ca` set, the acceptor requires and verifies client
/// certificates against that bundle.
pub fn load_tls_config(
    cert_path: &Path,
    key_path: &Path,
    client_ca: Option<&Path>,
) -> Result<TlsAcceptor, TlsError> {
    // Read certificate chain
    let cert_data = std::fs::read(cert_path).map_err(TlsError::CertRead)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_data[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::CertRead)?;
    if certs.is_empty() {
        return Err(TlsError::NoCerts);
    }

    // Read private key (try PKCS8, RSA, and EC formats)
    let key_data = std::fs::read(key_path).map_err(TlsError::KeyRead)?;
    let key = rustls_pemfile::private_key(&mut &key_data[..])
        .map_err(TlsError::KeyRead)?
        .ok_or(TlsError::NoKey)?;

    // Ensure a CryptoProvider is installed. This is idempotent if already set.
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

    let builder = tokio_rustls::rustls::ServerConfig::builder();
    let config = match client_ca {
        Some(ca_path) => {
            let roots = load_client_roots(ca_path)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(TlsError::ClientVerifier)?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(TlsError::Config)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_client_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let data = std::fs::read(path).map_err(TlsError::ClientCaRead)?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &data[..]) {
        let cert = cert.map_err(TlsError::ClientCaRead)?;
        if let Err(e) = roots.add(cert) {
            tracing::warn!(path = %path.display(), error = %e, "skipping unusable client CA certificate");
        }
    }
    if roots.is_empty() {
        return Err(TlsError::NoClientCa);
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_self_signed(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn load_nonexistent_cert_returns_error() {
        let result = load_tls_config(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
            None,
        );
        assert!(matches!(result, Err(TlsError::CertRead(_))));
    }

    #[test]
    fn load_empty_cert_returns_no_certs() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, "").unwrap();
        std::fs::write(&key_path, "").unwrap();

        let result = load_tls_config(&cert_path, &key_path, None);
        assert!(matches!(result, Err(TlsError::NoCerts)));
    }

    #[test]
    fn load_valid_self_signed_cert() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path());

        let result = load_tls_config(&cert_path, &key_path, None);
        assert!(result.is_ok(), "valid self-signed cert should load: {:?}", result.err());
    }

    #[test]
    fn load_cert_without_key_returns_no_key() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path());
        std::fs::write(&key_path, "not a key").unwrap();

        let result = load_tls_config(&cert_path, &key_path, None);
        assert!(matches!(result, Err(TlsError::NoKey)));
    }

    #[test]
    fn load_with_client_ca() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path());

        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let ca = params.self_signed(&ca_key).unwrap();
        let ca_path = dir.path().join("ca.pem");
        std::fs::write(&ca_path, ca.pem()).unwrap();

        let result = load_tls_config(&cert_path, &key_path, Some(&ca_path));
        assert!(result.is_ok(), "client CA should load: {:?}", result.err());
    }

    #[test]
    fn empty_client_ca_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path());
        let ca_path = dir.path().join("ca.pem");
        std::fs::write(&ca_path, "").unwrap();

        let result = load_tls_config(&cert_path, &key_path, Some(&ca_path));
        assert!(matches!(result, Err(TlsError::NoClientCa)));
    }
}
