//! TLS/certificate handling for h2tunnel.
//!
//! Both endpoints share a single self-signed certificate: the pair is the
//! endpoint identity and the sole trust anchor. Peer identity is proved by
//! byte-equality of the presented leaf certificate against the pinned one;
//! server name verification plays no part.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DistinguishedName, ServerConfig};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// ALPN protocol identifier spoken inside the tunnel TLS connection.
pub const ALPN_H2: &[u8] = b"h2";

/// Error type for TLS operations.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

/// Result type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// The shared identity: certificate chain, private key, and the leaf's
/// fingerprint for operator-facing logs.
pub struct CertKeyPair {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub fingerprint: String,
}

/// Loads the identity pair from `--crt`/`--key` PEM files. The first
/// certificate in the chain is the pinned leaf.
pub fn load_cert_key(cert_path: &Path, key_path: &Path) -> TlsResult<CertKeyPair> {
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::InvalidCertificate(format!("{}: {}", cert_path.display(), e)))?;
    let leaf = certs.first().ok_or_else(|| {
        TlsError::InvalidCertificate(format!("{}: no certificate found", cert_path.display()))
    })?;
    let fingerprint = compute_fingerprint(leaf.as_ref());

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| TlsError::InvalidCertificate(format!("{}: {}", key_path.display(), e)))?
        .ok_or_else(|| {
            TlsError::InvalidCertificate(format!("{}: no private key found", key_path.display()))
        })?;

    Ok(CertKeyPair {
        certs,
        key,
        fingerprint,
    })
}

/// SHA-256 digest of a DER certificate as colon-separated lowercase hex.
pub fn compute_fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Builds the tunnel server TLS configuration.
///
/// The server presents the shared pair and requires the client to present the
/// exact same certificate.
pub fn build_server_config(cert_key: &CertKeyPair) -> TlsResult<ServerConfig> {
    let leaf = pinned_leaf(cert_key)?;
    let verifier = PinnedClientVerifier::new(leaf);

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(cert_key.certs.clone(), cert_key.key.clone_key())
        .map_err(|e| TlsError::TlsConfig(e.to_string()))?;

    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok(config)
}

/// Builds the tunnel client TLS configuration.
///
/// The client presents the shared pair and accepts exactly that certificate
/// back from the server; server name verification is disabled.
pub fn build_client_config(cert_key: &CertKeyPair) -> TlsResult<ClientConfig> {
    let leaf = pinned_leaf(cert_key)?;
    let verifier = PinnedServerVerifier::new(leaf);

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(cert_key.certs.clone(), cert_key.key.clone_key())
        .map_err(|e| TlsError::TlsConfig(e.to_string()))?;

    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok(config)
}

fn pinned_leaf(cert_key: &CertKeyPair) -> TlsResult<Vec<u8>> {
    cert_key
        .certs
        .first()
        .map(|cert| cert.as_ref().to_vec())
        .ok_or_else(|| TlsError::InvalidCertificate("empty certificate chain".to_string()))
}

/// Checks a presented leaf certificate against the pinned one.
fn verify_pinned(pinned: &[u8], presented: &CertificateDer<'_>) -> Result<(), rustls::Error> {
    if presented.as_ref() == pinned {
        Ok(())
    } else {
        Err(rustls::Error::General(format!(
            "peer certificate does not match pinned certificate: expected {}, got {}",
            compute_fingerprint(pinned),
            compute_fingerprint(presented.as_ref())
        )))
    }
}

/// Server certificate verifier that accepts only the pinned certificate.
#[derive(Debug)]
struct PinnedServerVerifier {
    pinned: Vec<u8>,
}

impl PinnedServerVerifier {
    fn new(pinned: Vec<u8>) -> Self {
        Self { pinned }
    }
}

impl rustls::client::danger::ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        verify_pinned(&self.pinned, end_entity)?;
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client certificate verifier that requires exactly the pinned certificate.
#[derive(Debug)]
struct PinnedClientVerifier {
    pinned: Vec<u8>,
    root_hints: Vec<DistinguishedName>,
}

impl PinnedClientVerifier {
    fn new(pinned: Vec<u8>) -> Self {
        Self {
            pinned,
            root_hints: Vec::new(),
        }
    }
}

impl rustls::server::danger::ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.root_hints
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        verify_pinned(&self.pinned, end_entity)?;
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::client::danger::ServerCertVerifier;
    use rustls::server::danger::ClientCertVerifier;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Once;
    use tempfile::tempdir;

    static INIT: Once = Once::new();

    /// Initialize the crypto provider for tests.
    fn init_crypto() {
        INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    fn write_pem_pair(dir: &Path) -> (PathBuf, PathBuf) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("test.crt");
        let key_path = dir.join("test.key");
        fs::write(&cert_path, cert.cert.pem()).unwrap();
        fs::write(&key_path, cert.signing_key.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn test_load_cert_key() {
        let dir = tempdir().unwrap();
        let (cert_path, key_path) = write_pem_pair(dir.path());

        let result = load_cert_key(&cert_path, &key_path).unwrap();
        assert_eq!(result.certs.len(), 1);
        assert_eq!(result.fingerprint.len(), 95);
        assert_eq!(result.fingerprint.matches(':').count(), 31);
    }

    #[test]
    fn test_load_cert_key_missing_file() {
        let dir = tempdir().unwrap();
        let result = load_cert_key(&dir.path().join("nope.crt"), &dir.path().join("nope.key"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_cert_key_rejects_key_without_pem_blocks() {
        let dir = tempdir().unwrap();
        let (cert_path, _) = write_pem_pair(dir.path());
        let bogus_key = dir.path().join("bogus.key");
        fs::write(&bogus_key, "not a key").unwrap();

        let result = load_cert_key(&cert_path, &bogus_key);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_cert_key_rejects_empty_cert_file() {
        let dir = tempdir().unwrap();
        let (_, key_path) = write_pem_pair(dir.path());
        let empty_cert = dir.path().join("empty.crt");
        fs::write(&empty_cert, "").unwrap();

        let result = load_cert_key(&empty_cert, &key_path);
        assert!(result.is_err());
    }

    #[test]
    fn test_compute_fingerprint_format() {
        let fingerprint = compute_fingerprint(b"certificate bytes");
        assert_eq!(fingerprint.len(), 95);
        assert_eq!(fingerprint.matches(':').count(), 31);
        assert_eq!(fingerprint, compute_fingerprint(b"certificate bytes"));
        assert_ne!(fingerprint, compute_fingerprint(b"other bytes"));
    }

    #[test]
    fn test_build_server_config() {
        init_crypto();
        let dir = tempdir().unwrap();
        let (cert_path, key_path) = write_pem_pair(dir.path());
        let cert_key = load_cert_key(&cert_path, &key_path).unwrap();

        let config = build_server_config(&cert_key).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn test_build_client_config() {
        init_crypto();
        let dir = tempdir().unwrap();
        let (cert_path, key_path) = write_pem_pair(dir.path());
        let cert_key = load_cert_key(&cert_path, &key_path).unwrap();

        let config = build_client_config(&cert_key).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn test_pinned_server_verifier_accepts_pinned_cert() {
        init_crypto();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let der = cert.cert.der().to_vec();

        let verifier = PinnedServerVerifier::new(der.clone());
        let result = verifier.verify_server_cert(
            &CertificateDer::from(der),
            &[],
            &ServerName::try_from("localhost").unwrap(),
            &[],
            UnixTime::now(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_pinned_server_verifier_rejects_other_cert() {
        init_crypto();
        let pinned = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let other = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let verifier = PinnedServerVerifier::new(pinned.cert.der().to_vec());
        let result = verifier.verify_server_cert(
            &CertificateDer::from(other.cert.der().to_vec()),
            &[],
            &ServerName::try_from("localhost").unwrap(),
            &[],
            UnixTime::now(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_pinned_client_verifier_rejects_other_cert() {
        init_crypto();
        let pinned = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let other = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let verifier = PinnedClientVerifier::new(pinned.cert.der().to_vec());
        assert!(verifier
            .verify_client_cert(
                &CertificateDer::from(pinned.cert.der().to_vec()),
                &[],
                UnixTime::now(),
            )
            .is_ok());
        assert!(verifier
            .verify_client_cert(
                &CertificateDer::from(other.cert.der().to_vec()),
                &[],
                UnixTime::now(),
            )
            .is_err());
    }
}
