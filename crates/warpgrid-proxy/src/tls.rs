//! TLS material for front-door listeners and the host multiplexer.
//!
//! Listeners use a PEM certificate/key pair from disk when one is
//! configured, and otherwise a self-signed pair generated at startup.
//! Mux clients connect to peer hosts without verifying certificates;
//! peers present exactly these generated certificates.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

use crate::error::{ProxyError, ProxyResult};

fn tls_err(e: impl std::fmt::Display) -> ProxyError {
    ProxyError::Tls(e.to_string())
}

/// A certificate chain with its private key.
pub struct TlsMaterial {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsMaterial {
    /// Read a PEM certificate chain and private key.
    pub fn load(cert_file: &Path, key_file: &Path) -> ProxyResult<Self> {
        let mut cert_reader = BufReader::new(File::open(cert_file)?);
        let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(ProxyError::Tls(format!(
                "no certificates in {}",
                cert_file.display()
            )));
        }
        let mut key_reader = BufReader::new(File::open(key_file)?);
        let key = rustls_pemfile::private_key(&mut key_reader)?
            .ok_or_else(|| ProxyError::Tls(format!("no private key in {}", key_file.display())))?;
        info!(cert = %cert_file.display(), "loaded TLS certificate");
        Ok(Self { certs, key })
    }

    /// Generate a temporary self-signed pair for the given names.
    pub fn generate(names: &[String]) -> ProxyResult<Self> {
        let mut params = CertificateParams::new(names.to_vec()).map_err(tls_err)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "WarpGrid");
        dn.push(DnType::CommonName, "WarpGrid front door");
        params.distinguished_name = dn;

        let key_pair = KeyPair::generate().map_err(tls_err)?;
        let cert = params.self_signed(&key_pair).map_err(tls_err)?;
        let key = PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(tls_err)?;
        info!(names = ?names, "generated temporary TLS certificate");
        Ok(Self {
            certs: vec![cert.der().clone()],
            key,
        })
    }

    /// Load the configured pair, or generate one when either file is missing.
    pub fn load_or_generate(cert_file: Option<&Path>, key_file: Option<&Path>) -> ProxyResult<Self> {
        match (cert_file, key_file) {
            (Some(cert), Some(key)) => Self::load(cert, key),
            _ => Self::generate(&["localhost".to_string()]),
        }
    }

    /// Server configuration offering HTTP/1.1.
    pub fn server_config(&self) -> ProxyResult<Arc<rustls::ServerConfig>> {
        let mut config =
            rustls::ServerConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
                .with_safe_default_protocol_versions()
                .map_err(tls_err)?
                .with_no_client_auth()
                .with_single_cert(self.certs.clone(), self.key.clone_key())
                .map_err(tls_err)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    pub fn acceptor(&self) -> ProxyResult<TlsAcceptor> {
        Ok(TlsAcceptor::from(self.server_config()?))
    }
}

/// Connector for mux connections to peer hosts. Skips certificate verification.
pub fn insecure_connector() -> ProxyResult<TlsConnector> {
    let config =
        rustls::ClientConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
            .with_safe_default_protocol_versions()
            .map_err(tls_err)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
            .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
